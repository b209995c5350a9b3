//! The proxy reputation storage interface and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;

use super::{ACTIVE_SCORE, Proxy};

/// Errors from proxy store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The proxy already exists in the store.
    #[error("proxy {host}:{port} already exists")]
    AlreadyExists {
        /// Proxy host.
        host: String,
        /// Proxy port.
        port: u16,
    },

    /// The proxy is not in the store.
    #[error("proxy {host}:{port} not found")]
    NotFound {
        /// Proxy host.
        host: String,
        /// Proxy port.
        port: u16,
    },

    /// The backing database failed.
    #[error("proxy store database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub(crate) fn already_exists(proxy: &Proxy) -> Self {
        Self::AlreadyExists {
            host: proxy.host.clone(),
            port: proxy.port,
        }
    }

    pub(crate) fn not_found(proxy: &Proxy) -> Self {
        Self::NotFound {
            host: proxy.host.clone(),
            port: proxy.port,
        }
    }
}

/// Persistent set of scored proxies.
///
/// Implementations must be safe to call concurrently from every worker in
/// the fleet manager. The trait is object-safe so the engine can hold a
/// `dyn ProxyStore` chosen at construction time.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Looks up the stored record for the given `(host, port)` identity.
    async fn get(&self, proxy: &Proxy) -> Result<Option<Proxy>, StoreError>;

    /// Returns whether the proxy is known to the store.
    async fn contains(&self, proxy: &Proxy) -> Result<bool, StoreError>;

    /// Inserts a newly discovered proxy with the initial score.
    ///
    /// Fails with [`StoreError::AlreadyExists`] on duplicate identity.
    async fn create(&self, proxy: &Proxy) -> Result<(), StoreError>;

    /// Inserts a batch of proxies, skipping duplicates.
    ///
    /// Returns how many were actually created.
    async fn create_many(&self, proxies: &[Proxy]) -> usize;

    /// Marks a proxy healthy: score becomes the active score.
    async fn activate(&self, proxy: &Proxy) -> Result<(), StoreError>;

    /// Demotes a proxy: score is decremented by one.
    async fn deactivate(&self, proxy: &Proxy) -> Result<(), StoreError>;

    /// The `k` highest-scored proxies, best first.
    async fn top_by_score(&self, k: usize) -> Result<Vec<Proxy>, StoreError>;

    /// A uniformly random proxy among the top `k` by score.
    async fn random_top(&self, k: usize) -> Result<Option<Proxy>, StoreError>;

    /// Every stored proxy.
    async fn all(&self) -> Result<Vec<Proxy>, StoreError>;

    /// The `k` highest-scored proxies whose identity is not in `refuse`.
    async fn top_excluding(&self, refuse: &[Proxy], k: usize) -> Result<Vec<Proxy>, StoreError>;

    /// A random proxy among the top candidates not in `refuse`.
    async fn random_excluding(&self, refuse: &[Proxy]) -> Result<Option<Proxy>, StoreError>;
}

/// Candidate window used by [`ProxyStore::random_excluding`].
pub(crate) const RANDOM_DRAW_WINDOW: usize = 10;

pub(crate) fn pick_random(candidates: &[Proxy]) -> Option<Proxy> {
    if candidates.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..candidates.len());
    candidates.get(index).cloned()
}

/// In-memory proxy store.
///
/// Used by the test suite and by embedders that manage proxies themselves.
/// All operations take an internal mutex; contention is negligible at fleet
/// sizes.
#[derive(Debug, Default)]
pub struct MemoryProxyStore {
    entries: Mutex<HashMap<(String, u16), Proxy>>,
}

impl MemoryProxyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with the given proxies.
    #[must_use]
    pub fn with_proxies(proxies: impl IntoIterator<Item = Proxy>) -> Self {
        let entries = proxies
            .into_iter()
            .map(|p| ((p.host.clone(), p.port), p))
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, u16), Proxy>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn sorted_by_score(&self) -> Vec<Proxy> {
        let mut proxies: Vec<Proxy> = self.lock().values().cloned().collect();
        proxies.sort_by(|a, b| b.score.cmp(&a.score));
        proxies
    }
}

#[async_trait]
impl ProxyStore for MemoryProxyStore {
    async fn get(&self, proxy: &Proxy) -> Result<Option<Proxy>, StoreError> {
        Ok(self.lock().get(&(proxy.host.clone(), proxy.port)).cloned())
    }

    async fn contains(&self, proxy: &Proxy) -> Result<bool, StoreError> {
        Ok(self.lock().contains_key(&(proxy.host.clone(), proxy.port)))
    }

    async fn create(&self, proxy: &Proxy) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let key = (proxy.host.clone(), proxy.port);
        if entries.contains_key(&key) {
            return Err(StoreError::already_exists(proxy));
        }
        let mut stored = proxy.clone();
        stored.score = super::INITIAL_SCORE;
        entries.insert(key, stored);
        Ok(())
    }

    async fn create_many(&self, proxies: &[Proxy]) -> usize {
        let mut created = 0;
        for proxy in proxies {
            if self.create(proxy).await.is_ok() {
                created += 1;
            }
        }
        created
    }

    async fn activate(&self, proxy: &Proxy) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(&(proxy.host.clone(), proxy.port))
            .ok_or_else(|| StoreError::not_found(proxy))?;
        entry.score = ACTIVE_SCORE;
        Ok(())
    }

    async fn deactivate(&self, proxy: &Proxy) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(&(proxy.host.clone(), proxy.port))
            .ok_or_else(|| StoreError::not_found(proxy))?;
        entry.score -= 1;
        Ok(())
    }

    async fn top_by_score(&self, k: usize) -> Result<Vec<Proxy>, StoreError> {
        let mut proxies = self.sorted_by_score();
        proxies.truncate(k);
        Ok(proxies)
    }

    async fn random_top(&self, k: usize) -> Result<Option<Proxy>, StoreError> {
        let candidates = self.top_by_score(k).await?;
        Ok(pick_random(&candidates))
    }

    async fn all(&self) -> Result<Vec<Proxy>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn top_excluding(&self, refuse: &[Proxy], k: usize) -> Result<Vec<Proxy>, StoreError> {
        let mut proxies: Vec<Proxy> = self
            .sorted_by_score()
            .into_iter()
            .filter(|p| !refuse.iter().any(|r| r.same_endpoint(p)))
            .collect();
        proxies.truncate(k);
        Ok(proxies)
    }

    async fn random_excluding(&self, refuse: &[Proxy]) -> Result<Option<Proxy>, StoreError> {
        let candidates = self.top_excluding(refuse, RANDOM_DRAW_WINDOW).await?;
        Ok(pick_random(&candidates))
    }
}
