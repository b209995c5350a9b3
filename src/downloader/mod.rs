//! Downloaders: one HTTP client bound to at most one proxy.
//!
//! A downloader tracks per-host scheduling state: the time of the last
//! request to each host (with a pre-request backup for rollback), the hosts
//! that banned it, a concurrency semaphore, and a consecutive-error counter.
//!
//! The acquire/release cycle implements a commit/rollback pattern: a failed
//! attempt restores the host's previous request timestamp, so the per-host
//! interval is only "paid" by accepted requests. Without the rollback, a
//! failing downloader would hold every retry hostage to an interval spent
//! on a request that never succeeded.
//!
//! Host timestamps use `tokio::time::Instant` so tests can pause and
//! advance time.

mod fleet;

pub use fleet::{DirectFactory, DownloaderFactory, FleetError, ProxyFactory};
pub(crate) use fleet::{DownloaderManager, FleetConfig};

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::command::Command;
use crate::error::DownloadError;
use crate::fetch::FetchResponse;
use crate::proxy::Proxy;

/// Host entries idle longer than this are dropped by the sweep, which also
/// clears their bans.
const HOST_IDLE_TTL: Duration = Duration::from_secs(300);

/// How often the idle sweep runs.
const SWEEP_PERIOD: Duration = Duration::from_secs(300);

/// Connect timeout for the underlying client; whole-request deadlines come
/// from each command.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct HostTable {
    last_request: HashMap<String, Instant>,
    backup: HashMap<String, Instant>,
    banned: HashSet<String>,
}

/// HTTP client with per-host scheduling state, bound to at most one proxy.
pub struct Downloader {
    client: reqwest::Client,
    proxy: Option<Proxy>,
    semaphore: Semaphore,
    host_interval: Duration,
    hosts: std::sync::Arc<Mutex<HostTable>>,
    err_count: AtomicU32,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("proxy", &self.proxy)
            .field("err_count", &self.err_count.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Downloader {
    /// Creates a downloader. With `proxy` set, every request is dialed
    /// through it; otherwise the client connects directly.
    ///
    /// Must be called inside a Tokio runtime: the idle sweep is spawned
    /// here.
    ///
    /// # Errors
    ///
    /// Returns the underlying client-builder error when the proxy URL is
    /// unusable or the TLS backend fails to initialise.
    #[instrument(skip_all, fields(proxy = proxy.as_ref().map(|p| p.proxy_url())))]
    pub fn new(
        proxy: Option<Proxy>,
        concurrency: usize,
        host_interval: Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(proxy) = &proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.proxy_url())?);
        }
        let client = builder.build()?;

        let downloader = Self {
            client,
            proxy,
            semaphore: Semaphore::new(concurrency.max(1)),
            host_interval,
            hosts: std::sync::Arc::new(Mutex::new(HostTable::default())),
            err_count: AtomicU32::new(0),
            sweep: Mutex::new(None),
        };
        downloader.spawn_sweep();
        Ok(downloader)
    }

    fn spawn_sweep(&self) {
        let hosts = std::sync::Arc::clone(&self.hosts);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                sweep_idle_hosts(&hosts);
            }
        });
        *self.lock_sweep() = Some(handle);
    }

    fn lock_sweep(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweep
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_hosts(&self) -> std::sync::MutexGuard<'_, HostTable> {
        self.hosts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The proxy this downloader dials through, if any.
    #[must_use]
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// Current consecutive-error count.
    #[must_use]
    pub fn err_count(&self) -> u32 {
        self.err_count.load(Ordering::SeqCst)
    }

    /// Whether the error budget is spent.
    #[must_use]
    pub fn exceeded_err_budget(&self, err_limit: u32) -> bool {
        self.err_count() >= err_limit
    }

    /// Marks this downloader banned by `host` until the idle sweep clears
    /// the entry.
    pub fn be_banned(&self, host: &str) {
        debug!(proxy = ?self.proxy, host, "downloader banned by host");
        self.lock_hosts().banned.insert(host.to_string());
    }

    /// Whether `host` has banned this downloader.
    #[must_use]
    pub fn is_banned(&self, host: &str) -> bool {
        self.lock_hosts().banned.contains(host)
    }

    /// Attempts to reserve this downloader for one request to `host`.
    ///
    /// Checks run in order: error budget, ban, concurrency, per-host
    /// interval. On success the host timestamp is advanced (with a backup
    /// snapshot for rollback) and a semaphore permit stays held until
    /// [`Downloader::download`] releases it.
    ///
    /// # Errors
    ///
    /// The refusal reason; see [`DownloadError`].
    pub fn try_acquire(&self, host: &str, err_limit: u32) -> Result<(), DownloadError> {
        if self.exceeded_err_budget(err_limit) {
            return Err(DownloadError::BadState);
        }
        if self.is_banned(host) {
            return Err(DownloadError::HostBanned);
        }

        let Ok(permit) = self.semaphore.try_acquire() else {
            return Err(DownloadError::ConcurrentLimit);
        };

        let mut hosts = self.lock_hosts();
        let now = Instant::now();
        if let Some(last) = hosts.last_request.get(host).copied() {
            if now < last + self.host_interval {
                // The permit drops here and frees the slot.
                drop(permit);
                return Err(DownloadError::RequestTooOften);
            }
            hosts.backup.insert(host.to_string(), last);
        } else {
            hosts.backup.remove(host);
        }
        hosts.last_request.insert(host.to_string(), now);

        permit.forget();
        Ok(())
    }

    /// Commits or rolls back the state reserved by a successful
    /// `try_acquire`: frees the semaphore slot, and on success commits the
    /// host timestamp and resets the error count, while on failure restores
    /// the backup timestamp and increments the error count.
    fn release(&self, host: &str, success: bool) {
        self.semaphore.add_permits(1);

        let mut hosts = self.lock_hosts();
        if success {
            hosts.last_request.insert(host.to_string(), Instant::now());
            self.err_count.store(0, Ordering::SeqCst);
        } else {
            match hosts.backup.get(host).copied() {
                Some(backup) => hosts.last_request.insert(host.to_string(), backup),
                None => hosts.last_request.remove(host),
            };
            self.err_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Issues the command's request. Must be preceded by a successful
    /// [`Downloader::try_acquire`] for the command's host.
    ///
    /// The result is valid iff the transport succeeded and the status is
    /// 200; anything else rolls back the host timestamp and counts one
    /// error.
    ///
    /// # Errors
    ///
    /// [`DownloadError::Request`] on an invalid result.
    #[instrument(skip_all, fields(command = cmd.id(), url = %cmd.request().url))]
    pub async fn download(&self, cmd: &mut Command) -> Result<(), DownloadError> {
        let host = cmd.host();
        let request = cmd.request().clone();

        let mut builder = self
            .client
            .get(request.url.clone())
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(cookie) = request.cookie_header() {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }
        if let Some(user_agent) = &request.user_agent {
            builder = builder.header(reqwest::header::USER_AGENT, user_agent);
        }

        let outcome = match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let final_url = response.url().clone();
                match response.bytes().await {
                    Ok(body) => Ok(FetchResponse {
                        status,
                        body: body.to_vec(),
                        final_url,
                    }),
                    Err(e) => Err(e.to_string()),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(response) if response.status == 200 => {
                debug!(status = response.status, bytes = response.body.len(), "download valid");
                cmd.set_response(response);
                self.release(&host, true);
                Ok(())
            }
            Ok(response) => {
                let status = response.status;
                cmd.set_response(response);
                self.release(&host, false);
                Err(DownloadError::request(
                    request.url.as_str(),
                    format!("HTTP {status}"),
                ))
            }
            Err(reason) => {
                warn!(error = %reason, "download transport failure");
                cmd.set_transport_error(&reason);
                self.release(&host, false);
                Err(DownloadError::request(request.url.as_str(), reason))
            }
        }
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_sweep().take() {
            handle.abort();
        }
    }
}

/// Drops host entries (and their bans) idle longer than [`HOST_IDLE_TTL`].
fn sweep_idle_hosts(hosts: &Mutex<HostTable>) {
    let mut table = hosts
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let now = Instant::now();
    let stale: Vec<String> = table
        .last_request
        .iter()
        .filter(|(_, last)| now.duration_since(**last) > HOST_IDLE_TTL)
        .map(|(host, _)| host.clone())
        .collect();
    for host in stale {
        table.last_request.remove(&host);
        table.backup.remove(&host);
        table.banned.remove(&host);
        debug!(host, "idle host entry swept");
    }
}
