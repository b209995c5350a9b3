//! Periodic proxy health probing.
//!
//! [`ProxyProbe`] sweeps every stored proxy on an interval: each proxy is
//! used to fetch a probe URL, and the store score is updated from the
//! outcome (activate on success, deactivate on failure). An optional
//! origin-echo check verifies the probe response reports the proxy's own
//! address, which filters out transparent forwarders.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Proxy, ProxyStore};

/// Configuration for the proxy health probe.
#[derive(Debug, Clone)]
pub struct ProxyProbeConfig {
    /// URL fetched through each proxy.
    pub probe_url: String,
    /// Per-probe request timeout.
    pub timeout: Duration,
    /// How often to sweep the store.
    pub interval: Duration,
    /// Maximum concurrent probe requests.
    pub concurrency: usize,
    /// When set, the probe response must be JSON with an `origin` field
    /// equal to the proxy host.
    pub verify_origin: bool,
}

impl Default for ProxyProbeConfig {
    fn default() -> Self {
        Self {
            probe_url: "https://httpbin.org/ip".to_string(),
            timeout: Duration::from_secs(10),
            interval: Duration::from_secs(300),
            concurrency: 16,
            verify_origin: true,
        }
    }
}

/// Background sweeper that keeps proxy scores current.
pub struct ProxyProbe {
    store: Arc<dyn ProxyStore>,
    config: ProxyProbeConfig,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProxyProbe {
    /// Creates a probe over the given store. Call [`ProxyProbe::start`] to
    /// begin sweeping.
    #[must_use]
    pub fn new(store: Arc<dyn ProxyStore>, config: ProxyProbeConfig) -> Self {
        Self {
            store,
            config,
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    /// Starts the periodic sweep. Subsequent calls are no-ops.
    #[instrument(skip(self))]
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&store, &config, &shutdown).await;
                    }
                    () = shutdown.cancelled() => break,
                }
            }
            debug!("proxy probe stopped");
        }));
    }

    /// Stops the sweep and waits for the background task to exit.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "proxy probe task panicked");
            }
        }
    }

    /// Runs a single sweep immediately, outside the periodic schedule.
    pub async fn sweep_once(&self) {
        sweep(&self.store, &self.config, &self.shutdown).await;
    }
}

async fn sweep(
    store: &Arc<dyn ProxyStore>,
    config: &ProxyProbeConfig,
    shutdown: &CancellationToken,
) {
    let proxies = match store.all().await {
        Ok(proxies) => proxies,
        Err(e) => {
            warn!(error = %e, "proxy sweep could not list proxies");
            return;
        }
    };

    let started = std::time::Instant::now();
    let limiter = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut handles = Vec::with_capacity(proxies.len());
    let mut activated = 0_usize;

    for proxy in proxies {
        if shutdown.is_cancelled() {
            break;
        }
        let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
            break;
        };
        let store = Arc::clone(store);
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let healthy = probe_proxy(&proxy, &config).await;
            let result = if healthy {
                store.activate(&proxy).await
            } else {
                store.deactivate(&proxy).await
            };
            if let Err(e) = result {
                warn!(proxy = %proxy, error = %e, "proxy score update failed");
            }
            healthy
        }));
    }

    let total = handles.len();
    for handle in handles {
        if matches!(handle.await, Ok(true)) {
            activated += 1;
        }
    }

    info!(
        total,
        activated,
        elapsed_ms = started.elapsed().as_millis(),
        "proxy sweep finished"
    );
}

/// Fetches the probe URL through the proxy and judges health.
async fn probe_proxy(proxy: &Proxy, config: &ProxyProbeConfig) -> bool {
    let Ok(upstream) = reqwest::Proxy::all(proxy.proxy_url()) else {
        return false;
    };
    let Ok(client) = reqwest::Client::builder()
        .proxy(upstream)
        .timeout(config.timeout)
        .build()
    else {
        return false;
    };

    let response = match client.get(&config.probe_url).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(proxy = %proxy, error = %e, "probe request failed");
            return false;
        }
    };
    if response.status() != reqwest::StatusCode::OK {
        return false;
    }

    if !config.verify_origin {
        return true;
    }

    match response.json::<serde_json::Value>().await {
        Ok(body) => body
            .get("origin")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|origin| origin == proxy.host),
        Err(e) => {
            debug!(proxy = %proxy, error = %e, "probe response was not JSON");
            false
        }
    }
}
