//! Commands: one scheduled fetch plus its parse callback and context data.
//!
//! Commands are created from a rule's seed links or by `follow` calls inside
//! parse callbacks. A command is owned by whichever queue or worker holds it
//! at the moment; the task only observes it through counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::downloader::Downloader;
use crate::error::{ParseError, ParseResult};
use crate::fetch::{FetchRequest, FetchResponse};
use crate::task::Task;

/// Parse callback signature: synchronous, may fail, may buffer follows and
/// items on the context.
pub type ParseCallback =
    Arc<dyn Fn(&mut crate::context::Context<'_>) -> ParseResult<()> + Send + Sync>;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// One scheduled HTTP fetch with its parse callback.
pub struct Command {
    id: u64,
    task: Arc<Task>,
    request: FetchRequest,
    callback: ParseCallback,
    data: HashMap<String, Value>,
    response: Option<FetchResponse>,
    last_error: Option<String>,
    downloader: Option<Arc<Downloader>>,
    failures: u32,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("url", &self.request.url.as_str())
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

impl Command {
    /// Unique id, assigned at creation from a process-wide counter.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The task this command belongs to.
    #[must_use]
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// The request this command will issue.
    #[must_use]
    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    /// The per-host scheduling key.
    #[must_use]
    pub fn host(&self) -> String {
        self.request.host()
    }

    /// Context data inherited by follow commands.
    #[must_use]
    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    /// The response of the last download attempt, if any.
    #[must_use]
    pub fn response(&self) -> Option<&FetchResponse> {
        self.response.as_ref()
    }

    /// Text of the last transport error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// How many download attempts or parse retries have failed so far.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn callback(&self) -> ParseCallback {
        Arc::clone(&self.callback)
    }

    pub(crate) fn set_response(&mut self, response: FetchResponse) {
        self.last_error = None;
        self.response = Some(response);
    }

    pub(crate) fn set_transport_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub(crate) fn set_downloader(&mut self, downloader: Arc<Downloader>) {
        self.downloader = Some(downloader);
    }

    pub(crate) fn downloader(&self) -> Option<&Arc<Downloader>> {
        self.downloader.as_ref()
    }

    /// Records one failed attempt and returns the new count.
    pub(crate) fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }
}

/// Builder for commands; also the surface exposed by follow-with-builder.
pub struct CommandBuilder {
    task: Arc<Task>,
    url: Option<Url>,
    callback: Option<ParseCallback>,
    data: HashMap<String, Value>,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    user_agent: Option<String>,
    timeout: Duration,
}

impl CommandBuilder {
    /// Starts a builder for the given task, with the task's download
    /// timeout.
    #[must_use]
    pub fn new(task: Arc<Task>) -> Self {
        let timeout = task.download_timeout();
        Self {
            task,
            url: None,
            callback: None,
            data: HashMap::new(),
            headers: Vec::new(),
            cookies: Vec::new(),
            user_agent: None,
            timeout,
        }
    }

    /// Sets the request URL.
    #[must_use]
    pub fn url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Parses and sets the request URL.
    ///
    /// # Errors
    ///
    /// [`ParseError::Unknown`] if the link is not an absolute URL.
    pub fn link(self, link: &str) -> ParseResult<Self> {
        let url = Url::parse(link)
            .map_err(|e| ParseError::unknown(format!("invalid link {link:?}: {e}")))?;
        Ok(self.url(url))
    }

    /// Sets the parse callback.
    #[must_use]
    pub fn callback(mut self, callback: ParseCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Replaces the context data map.
    #[must_use]
    pub fn context_data(mut self, data: HashMap<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Merges entries into the context data map, overriding duplicates.
    #[must_use]
    pub fn extend_context_data(mut self, data: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.data.extend(data);
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds a cookie pair.
    #[must_use]
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Overrides the request User-Agent.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Overrides the download timeout for this command only.
    #[must_use]
    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the command.
    ///
    /// # Errors
    ///
    /// [`ParseError::Unknown`] if the URL or callback was never set.
    pub fn build(self) -> ParseResult<Command> {
        let url = self
            .url
            .ok_or_else(|| ParseError::unknown("command built without a URL"))?;
        let callback = self
            .callback
            .ok_or_else(|| ParseError::unknown("command built without a callback"))?;

        let mut request = FetchRequest::new(url);
        request.headers = self.headers;
        request.cookies = self.cookies;
        request.user_agent = self.user_agent;
        request.timeout = self.timeout;

        Ok(Command {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            task: self.task,
            request,
            callback,
            data: self.data,
            response: None,
            last_error: None,
            downloader: None,
            failures: 0,
        })
    }
}
