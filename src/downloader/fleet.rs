//! The downloader fleet and its manager.
//!
//! The manager owns a fixed-size fleet of downloaders and the worker pool
//! that drives the download stage. Each worker pulls a command, walks the
//! fleet for a downloader that will accept it, and routes the result: valid
//! responses to the parse queue, failed attempts back onto the download
//! queue while the command's failure budget lasts.
//!
//! Downloaders that exhaust their error budget or get banned by too many
//! hosts are replaced under an exclusive lock: replacements draw fresh
//! proxies from the store (excluding every proxy still in use) and the
//! evicted proxies are deactivated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::Downloader;
use crate::command::Command;
use crate::error::DownloadError;
use crate::proxy::{Proxy, ProxyStore, StoreError};

/// Pause before a refused or failed command re-enters the download queue.
/// Keeps a starved fleet from spinning on the same command.
const RECIRCULATE_DELAY: Duration = Duration::from_millis(50);

/// Errors from fleet construction and replacement.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The proxy store has no proxy left outside the refuse list.
    #[error("no proxy available outside the refuse list")]
    NoProxyAvailable,

    /// The proxy store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The HTTP client could not be built.
    #[error("could not build downloader client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Builds downloaders for the fleet and retires their proxies.
#[async_trait]
pub trait DownloaderFactory: Send + Sync {
    /// Creates a downloader whose proxy is not in `in_use`.
    ///
    /// # Errors
    ///
    /// [`FleetError`] when no proxy is available or the client cannot be
    /// built.
    async fn make(
        &self,
        in_use: &[Proxy],
        concurrency: usize,
        host_interval: Duration,
    ) -> Result<Arc<Downloader>, FleetError>;

    /// Called with the proxy of an evicted downloader.
    async fn retire(&self, _proxy: &Proxy) {}
}

/// Factory for proxyless downloaders. All downloaders share the direct
/// identity, so the refuse list is ignored.
#[derive(Debug, Default)]
pub struct DirectFactory;

impl DirectFactory {
    /// Creates the factory.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DownloaderFactory for DirectFactory {
    async fn make(
        &self,
        _in_use: &[Proxy],
        concurrency: usize,
        host_interval: Duration,
    ) -> Result<Arc<Downloader>, FleetError> {
        Ok(Arc::new(Downloader::new(None, concurrency, host_interval)?))
    }
}

/// Factory drawing proxies from a reputation store.
pub struct ProxyFactory {
    store: Arc<dyn ProxyStore>,
}

impl ProxyFactory {
    /// Creates the factory over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ProxyStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DownloaderFactory for ProxyFactory {
    async fn make(
        &self,
        in_use: &[Proxy],
        concurrency: usize,
        host_interval: Duration,
    ) -> Result<Arc<Downloader>, FleetError> {
        let proxy = self
            .store
            .random_excluding(in_use)
            .await?
            .ok_or(FleetError::NoProxyAvailable)?;
        Ok(Arc::new(Downloader::new(
            Some(proxy),
            concurrency,
            host_interval,
        )?))
    }

    async fn retire(&self, proxy: &Proxy) {
        if let Err(e) = self.store.deactivate(proxy).await {
            warn!(proxy = %proxy, error = %e, "could not deactivate evicted proxy");
        }
    }
}

/// Sizing and budget parameters for the fleet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FleetConfig {
    pub fleet_size: usize,
    pub concurrency: usize,
    pub err_limit: u32,
    pub host_interval: Duration,
}

struct ManagerInner {
    fleet: RwLock<Vec<Arc<Downloader>>>,
    factory: Arc<dyn DownloaderFactory>,
    config: FleetConfig,
    download_tx: async_channel::Sender<Command>,
    download_rx: async_channel::Receiver<Command>,
    parse_tx: async_channel::Sender<Command>,
    shutdown: CancellationToken,
}

/// Owns the downloader fleet and the download-stage worker pool.
pub(crate) struct DownloaderManager {
    inner: Arc<ManagerInner>,
    workers: Vec<JoinHandle<()>>,
}

impl DownloaderManager {
    /// Builds the fleet and spawns `fleet_size x concurrency` workers.
    pub(crate) async fn start(
        factory: Arc<dyn DownloaderFactory>,
        config: FleetConfig,
        download_tx: async_channel::Sender<Command>,
        download_rx: async_channel::Receiver<Command>,
        parse_tx: async_channel::Sender<Command>,
    ) -> Self {
        let mut fleet: Vec<Arc<Downloader>> = Vec::with_capacity(config.fleet_size);
        let mut in_use: Vec<Proxy> = Vec::new();
        for slot in 0..config.fleet_size {
            match factory
                .make(&in_use, config.concurrency, config.host_interval)
                .await
            {
                Ok(downloader) => {
                    if let Some(proxy) = downloader.proxy() {
                        in_use.push(proxy.clone());
                    }
                    fleet.push(downloader);
                }
                Err(e) => {
                    warn!(slot, error = %e, "could not fill fleet slot");
                    break;
                }
            }
        }
        info!(
            fleet = fleet.len(),
            requested = config.fleet_size,
            "downloader fleet initialised"
        );

        let inner = Arc::new(ManagerInner {
            fleet: RwLock::new(fleet),
            factory,
            config,
            download_tx,
            download_rx,
            parse_tx,
            shutdown: CancellationToken::new(),
        });

        let worker_count = config.fleet_size.max(1) * config.concurrency.max(1);
        let workers = (0..worker_count)
            .map(|worker_id| {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { download_worker(worker_id, inner).await })
            })
            .collect();

        Self { inner, workers }
    }

    /// Signals every worker and joins them. Commands left on the queue stay
    /// there for the executor's drain.
    #[instrument(skip(self))]
    pub(crate) async fn stop(&mut self) {
        self.inner.shutdown.cancel();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "download worker panicked");
            }
        }
        info!("downloader manager stopped");
    }

    /// Number of live downloaders.
    #[cfg(test)]
    pub(crate) async fn fleet_len(&self) -> usize {
        self.inner.fleet.read().await.len()
    }

    /// Proxies currently bound to the fleet.
    #[cfg(test)]
    pub(crate) async fn fleet_proxies(&self) -> Vec<Proxy> {
        self.inner
            .fleet
            .read()
            .await
            .iter()
            .filter_map(|d| d.proxy().cloned())
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn clean_for_test(&self, host: &str) {
        fleet_clean(&self.inner, host).await;
    }
}

async fn download_worker(worker_id: usize, inner: Arc<ManagerInner>) {
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            received = inner.download_rx.recv() => match received {
                Ok(cmd) => handle_command(&inner, cmd).await,
                Err(_) => break, // channel closed
            },
        }
    }
    debug!(worker_id, "download worker stopped");
}

async fn handle_command(inner: &Arc<ManagerInner>, mut cmd: Command) {
    let host = cmd.host();

    let mut banned = 0_usize;
    let mut bad_state = 0_usize;
    let mut acquired: Option<Arc<Downloader>> = None;
    let fleet_size;
    {
        let fleet = inner.fleet.read().await;
        fleet_size = fleet.len();
        for downloader in fleet.iter() {
            match downloader.try_acquire(&host, inner.config.err_limit) {
                Ok(()) => {
                    acquired = Some(Arc::clone(downloader));
                    break;
                }
                Err(DownloadError::HostBanned) => banned += 1,
                Err(DownloadError::BadState) => bad_state += 1,
                Err(_) => {}
            }
        }
    }

    let Some(downloader) = acquired else {
        if fleet_size > 0 && banned + bad_state >= fleet_size.div_ceil(2) {
            fleet_clean(inner, &host).await;
        }
        recirculate(inner, cmd);
        return;
    };

    cmd.set_downloader(Arc::clone(&downloader));
    match downloader.download(&mut cmd).await {
        Ok(()) => {
            if inner.parse_tx.send(cmd).await.is_err() {
                debug!("parse queue closed; dropping downloaded command");
            }
        }
        Err(e) => {
            debug!(command = cmd.id(), error = %e, "download attempt failed");
            if downloader.exceeded_err_budget(inner.config.err_limit) {
                fleet_clean(inner, &host).await;
            }
            let failures = cmd.record_failure();
            if failures >= inner.config.err_limit {
                warn!(command = cmd.id(), failures, "command failure budget exhausted");
                cmd.task().record_failed_command().await;
            } else {
                recirculate(inner, cmd);
            }
        }
    }
}

/// Re-enqueues a command onto the download queue from a detached task, so a
/// saturated queue cannot deadlock the worker that holds the command.
fn recirculate(inner: &Arc<ManagerInner>, cmd: Command) {
    let download_tx = inner.download_tx.clone();
    let shutdown = inner.shutdown.clone();
    let command_id = cmd.id();
    tokio::spawn(async move {
        tokio::time::sleep(RECIRCULATE_DELAY).await;
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!(command = command_id, "dropping recirculating command on shutdown");
            }
            sent = download_tx.send(cmd) => {
                if sent.is_err() {
                    debug!(command = command_id, "download queue closed; dropping recirculating command");
                }
            }
        }
    });
}

/// Replaces, under the exclusive fleet lock, every downloader that is over
/// its error budget or banned by `host`. Replacements are appended at the
/// tail and draw proxies excluding everything still in use; evicted proxies
/// are retired. Slots that cannot be refilled are dropped.
async fn fleet_clean(inner: &Arc<ManagerInner>, host: &str) {
    let mut fleet = inner.fleet.write().await;

    let (evicted, mut kept): (Vec<_>, Vec<_>) = fleet.drain(..).partition(|d| {
        d.exceeded_err_budget(inner.config.err_limit) || d.is_banned(host)
    });
    if evicted.is_empty() {
        *fleet = kept;
        return;
    }

    let mut in_use: Vec<Proxy> = kept.iter().filter_map(|d| d.proxy().cloned()).collect();
    let mut replaced = 0_usize;
    for old in &evicted {
        match inner
            .factory
            .make(&in_use, inner.config.concurrency, inner.config.host_interval)
            .await
        {
            Ok(fresh) => {
                if let Some(proxy) = fresh.proxy() {
                    in_use.push(proxy.clone());
                }
                kept.push(fresh);
                replaced += 1;
            }
            Err(e) => {
                warn!(error = %e, "fleet starved: dropping slot without replacement");
            }
        }
        if let Some(proxy) = old.proxy() {
            inner.factory.retire(proxy).await;
        }
    }

    info!(
        host,
        evicted = evicted.len(),
        replaced,
        fleet = kept.len(),
        "fleet cleaned"
    );
    *fleet = kept;
}
