//! Request and response value types for the download stage.
//!
//! The engine consumes its HTTP client through this minimal contract: a
//! [`FetchRequest`] describes one GET (URL, headers, cookies, user-agent,
//! timeout) and a [`FetchResponse`] carries the buffered outcome. Bodies are
//! buffered rather than streamed because every response is handed to a parse
//! callback.

use std::time::Duration;

use url::Url;

/// Default download timeout applied when a rule does not override it.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(20);

/// One scheduled HTTP GET.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Absolute request URL.
    pub url: Url,
    /// Extra request headers, applied in order.
    pub headers: Vec<(String, String)>,
    /// Cookie pairs sent with the request.
    pub cookies: Vec<(String, String)>,
    /// User-Agent override; the client default is used when absent.
    pub user_agent: Option<String>,
    /// Whole-request timeout.
    pub timeout: Duration,
}

impl FetchRequest {
    /// Creates a request with default timeout and no extra headers.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
            cookies: Vec::new(),
            user_agent: None,
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    /// The request host, used as the per-host scheduling key.
    ///
    /// Requests whose URL has no host (which cannot be fetched anyway) fall
    /// back to the full URL string so they still get a stable key.
    #[must_use]
    pub fn host(&self) -> String {
        self.url
            .host_str()
            .map_or_else(|| self.url.to_string(), str::to_string)
    }

    /// Renders the cookie pairs as a single `Cookie` header value.
    #[must_use]
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Buffered outcome of a fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Buffered response body.
    pub body: Vec<u8>,
    /// Final URL after redirects.
    pub final_url: Url,
}

impl FetchResponse {
    /// The body decoded as UTF-8, lossily.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
