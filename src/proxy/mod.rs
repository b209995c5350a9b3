//! Proxy model and reputation storage.
//!
//! A [`Proxy`] is identified by `(host, port)` and carries a mutable
//! reputation score. Scores follow a fixed policy: a newly discovered proxy
//! starts at [`INITIAL_SCORE`], a proxy that passes a health probe is set to
//! [`ACTIVE_SCORE`], and every failure decrements the score by one. Proxies
//! are never deleted, only demoted.
//!
//! Storage is abstracted behind the [`ProxyStore`] trait so the engine can
//! run against the default SQLite-backed store, the in-memory store, or any
//! other backend. Stores are injected into the executor at construction;
//! there is no global singleton.

mod db;
mod pool;
mod store;

pub use db::SqliteProxyStore;
pub use pool::{ProxyProbe, ProxyProbeConfig};
pub use store::{MemoryProxyStore, ProxyStore, StoreError};

use serde::{Deserialize, Serialize};

/// Score assigned to a proxy on creation.
pub const INITIAL_SCORE: i64 = 80;

/// Score assigned to a proxy when a health probe succeeds.
pub const ACTIVE_SCORE: i64 = 100;

/// How anonymous a proxy is towards the origin server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnonymityLevel {
    /// Forwards the client address.
    Transparent,
    /// Hides the client address but identifies itself as a proxy.
    Anonymous,
    /// Indistinguishable from a direct client.
    Elite,
}

impl AnonymityLevel {
    /// Integer representation used by the SQLite store.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Transparent => 0,
            Self::Anonymous => 1,
            Self::Elite => 2,
        }
    }

    /// Parses the integer representation, defaulting to `Transparent` for
    /// unknown values.
    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Anonymous,
            2 => Self::Elite,
            _ => Self::Transparent,
        }
    }
}

/// One HTTP proxy with its reputation score.
///
/// Equality is by `(host, port)` only; transport capability, anonymity and
/// score do not participate in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    /// Proxy host (IP or name).
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Whether the proxy speaks TLS itself.
    pub https: bool,
    /// Anonymity label.
    pub anonymity: AnonymityLevel,
    /// Mutable reputation score.
    pub score: i64,
}

impl Proxy {
    /// Creates a proxy with the initial reputation score.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            https: false,
            anonymity: AnonymityLevel::Transparent,
            score: INITIAL_SCORE,
        }
    }

    /// Sets the TLS capability flag.
    #[must_use]
    pub fn with_https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    /// Sets the anonymity label.
    #[must_use]
    pub fn with_anonymity(mut self, anonymity: AnonymityLevel) -> Self {
        self.anonymity = anonymity;
        self
    }

    /// URL suitable for `reqwest::Proxy::all`.
    #[must_use]
    pub fn proxy_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Identity comparison by `(host, port)`.
    #[must_use]
    pub fn same_endpoint(&self, other: &Proxy) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.same_endpoint(other)
    }
}

impl Eq for Proxy {}

impl std::hash::Hash for Proxy {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (score {})", self.host, self.port, self.score)
    }
}
