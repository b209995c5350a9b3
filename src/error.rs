//! Error types for the three pipeline stages.
//!
//! Errors are split by the stage that produces them:
//! - [`DownloadError`] - downloader acquisition and request failures,
//!   handled entirely inside the fleet manager and never surfaced to rules.
//! - [`ParseError`] - failures raised by parse callbacks, dispatched to the
//!   rule's parse-error handler.
//! - [`PipeError`] - failures raised by output pipelines, dispatched to the
//!   rule's pipe-error handler.

use thiserror::Error;

/// Errors produced while acquiring a downloader or issuing a request.
///
/// The first four variants drive downloader selection and fleet cleaning;
/// only [`DownloadError::Request`] represents an actual failed attempt and
/// counts against a command's failure budget.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The downloader's consecutive-error count reached the configured limit.
    #[error("downloader error budget exhausted")]
    BadState,

    /// The request host has banned this downloader.
    #[error("host has banned this downloader")]
    HostBanned,

    /// The downloader is already running its maximum number of requests.
    #[error("downloader concurrent request limit reached")]
    ConcurrentLimit,

    /// The per-host request interval has not elapsed yet.
    #[error("request to host too soon after the previous one")]
    RequestTooOften,

    /// The request was issued but failed: transport error or non-200 status.
    #[error("request to {url} failed: {reason}")]
    Request {
        /// The URL that was requested.
        url: String,
        /// Transport error text or the offending HTTP status.
        reason: String,
    },
}

impl DownloadError {
    /// Creates a request-failure error.
    pub fn request(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Request {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Chain of selector lookups attempted before a strict HTML miss.
///
/// Each entry records what was looked up (a CSS selector or an attribute
/// name) in the order the callback descended into the document, so a
/// [`ParseError::NodeNotFound`] pinpoints the step that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectorTrail {
    steps: Vec<(&'static str, String)>,
}

impl SelectorTrail {
    /// Creates an empty trail.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new trail with one more lookup step appended.
    #[must_use]
    pub fn push(&self, kind: &'static str, value: impl Into<String>) -> Self {
        let mut steps = self.steps.clone();
        steps.push((kind, value.into()));
        Self { steps }
    }

    /// The recorded lookup steps, oldest first.
    #[must_use]
    pub fn steps(&self) -> &[(&'static str, String)] {
        &self.steps
    }
}

impl std::fmt::Display for SelectorTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (kind, value) in &self.steps {
            if !first {
                write!(f, " > ")?;
            }
            write!(f, "{kind}={value:?}")?;
            first = false;
        }
        Ok(())
    }
}

/// Errors raised during parse-callback execution.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The response body could not be parsed as an HTML document, or a CSS
    /// selector string was malformed.
    #[error("HTML parse failure: {message}")]
    Html {
        /// What went wrong.
        message: String,
    },

    /// A strict selector operation matched nothing.
    #[error("no HTML node matched [{trail}]")]
    NodeNotFound {
        /// The chain of selector rules attempted.
        trail: SelectorTrail,
    },

    /// An emitted item's structural shape is not pipelinable.
    #[error("item type {type_name} is invalid: {detail}")]
    ItemTypeInvalid {
        /// Rust type name of the offending item.
        type_name: &'static str,
        /// Which part of the shape rule was violated.
        detail: String,
    },

    /// The callback requested a re-download of the current command.
    ///
    /// Not a real failure: the parse worker intercepts it and recirculates
    /// the command. Produced by `Context::retry` so callbacks can abort with
    /// `?`.
    #[error("command re-download requested")]
    NeedRetry,

    /// Any other callback failure, including caught panics.
    #[error("parse callback failed: {message}")]
    Unknown {
        /// Stringified failure.
        message: String,
    },
}

impl ParseError {
    /// Creates an HTML parse failure.
    pub fn html(message: impl Into<String>) -> Self {
        Self::Html {
            message: message.into(),
        }
    }

    /// Creates a strict-selector miss carrying the attempted trail.
    #[must_use]
    pub fn node_not_found(trail: SelectorTrail) -> Self {
        Self::NodeNotFound { trail }
    }

    /// Creates an invalid-item-shape error.
    pub fn item_type_invalid(type_name: &'static str, detail: impl Into<String>) -> Self {
        Self::ItemTypeInvalid {
            type_name,
            detail: detail.into(),
        }
    }

    /// Creates an unknown callback failure.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Kind tag used by error handlers to pick an action.
    #[must_use]
    pub fn kind(&self) -> ParseErrorKind {
        match self {
            Self::Html { .. } => ParseErrorKind::Html,
            Self::NodeNotFound { .. } => ParseErrorKind::NodeNotFound,
            Self::ItemTypeInvalid { .. } => ParseErrorKind::ItemTypeInvalid,
            Self::NeedRetry => ParseErrorKind::NeedRetry,
            Self::Unknown { .. } => ParseErrorKind::Unknown,
        }
    }
}

/// Discriminant of [`ParseError`], exposed to parse-error handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Document would not parse.
    Html,
    /// Strict selector missed.
    NodeNotFound,
    /// Emitted item failed shape validation.
    ItemTypeInvalid,
    /// Callback asked for a re-download.
    NeedRetry,
    /// Anything else.
    Unknown,
}

/// Result alias used throughout parse callbacks.
pub type ParseResult<T> = Result<T, ParseError>;

/// Errors raised by output pipelines.
#[derive(Debug, Error)]
pub enum PipeError {
    /// Writing the item to the sink failed.
    #[error("pipeline I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing the item failed.
    #[error("pipeline serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Any other pipeline failure, including caught panics.
    #[error("pipeline failed: {message}")]
    Unknown {
        /// Stringified failure.
        message: String,
    },
}

impl PipeError {
    /// Creates an unknown pipeline failure.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }
}

/// Renders a caught panic payload into a message string.
#[must_use]
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
