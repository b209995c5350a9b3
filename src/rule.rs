//! The rule-authoring contract.
//!
//! A [`Rule`] is the user-supplied specification of one scrape: its seed
//! URLs, the callback that parses the seed responses, and optional
//! configuration hooks. Every hook has a default, so the minimal rule
//! implements only [`Rule::seed_links`] and [`Rule::parse`]:
//!
//! ```
//! use spinneret::{Context, ParseResult, Rule};
//!
//! struct Quotes;
//!
//! impl Rule for Quotes {
//!     fn seed_links(&self) -> Vec<String> {
//!         vec!["http://quotes.example/page/1".to_string()]
//!     }
//!
//!     fn parse(&self, ctx: &mut Context<'_>) -> ParseResult<()> {
//!         ctx.html("div.quote", |ctx, quote| {
//!             let text = quote.child_text("span.text")?;
//!             ctx.item(serde_json::json!({ "text": text }))
//!         })?;
//!         Ok(())
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::context::Context;
use crate::error::{ParseError, ParseErrorKind, ParseResult, PipeError};
use crate::fetch::DEFAULT_DOWNLOAD_TIMEOUT;
use crate::item::Item;
use crate::pipeline::{JsonStdoutPipeline, Pipeline};

/// What to do with a command whose parse callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Re-download the command (counts against its failure budget).
    Retry,
    /// Record the command as failed.
    Fail,
}

/// Context handed to [`Rule::on_parse_error`].
#[derive(Debug)]
pub struct ParseErrorInfo<'a> {
    /// Id of the failed command.
    pub command_id: u64,
    /// URL of the failed command.
    pub url: &'a Url,
    /// Failed attempts so far, including this one.
    pub failures: u32,
    /// The error the callback raised.
    pub error: &'a ParseError,
}

/// Context handed to [`Rule::on_pipe_error`].
#[derive(Debug)]
pub struct PipeErrorInfo<'a> {
    /// The item that failed to pipe.
    pub item: &'a Item,
    /// The error the pipeline raised.
    pub error: &'a PipeError,
}

/// Default parse-error policy: recoverable document trouble is retried,
/// everything else fails the command.
#[must_use]
pub fn default_parse_error_action(kind: ParseErrorKind) -> ErrorAction {
    match kind {
        ParseErrorKind::Html | ParseErrorKind::NodeNotFound => ErrorAction::Retry,
        ParseErrorKind::ItemTypeInvalid
        | ParseErrorKind::NeedRetry
        | ParseErrorKind::Unknown => ErrorAction::Fail,
    }
}

/// User-supplied scraping specification.
///
/// Only `seed_links` and `parse` are required; the remaining methods are
/// optional capabilities with engine defaults.
pub trait Rule: Send + Sync + 'static {
    /// The URLs the task starts from. An empty list completes the task
    /// immediately.
    fn seed_links(&self) -> Vec<String>;

    /// Parse callback applied to every seed response.
    ///
    /// # Errors
    ///
    /// Any [`ParseError`]; the engine routes it through
    /// [`Rule::on_parse_error`].
    fn parse(&self, ctx: &mut Context<'_>) -> ParseResult<()>;

    /// Task display name. Defaults to the rule's type name.
    fn task_name(&self) -> Option<String> {
        None
    }

    /// Download timeout for the task's commands. Defaults to 20 seconds.
    fn download_timeout(&self) -> Duration {
        DEFAULT_DOWNLOAD_TIMEOUT
    }

    /// Output sinks for emitted items. Defaults to a stdout JSON printer.
    fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
        vec![Arc::new(JsonStdoutPipeline::new())]
    }

    /// Decides what happens to a command whose parse callback failed.
    fn on_parse_error(&self, info: &ParseErrorInfo<'_>) -> ErrorAction {
        default_parse_error_action(info.error.kind())
    }

    /// Observes pipeline failures. The item is recorded as failed either
    /// way; the default does nothing.
    fn on_pipe_error(&self, _info: &PipeErrorInfo<'_>) {}

    /// Runs on the command's context right before its parse callback.
    fn on_download_finish(&self, _ctx: &mut Context<'_>) {}
}

/// Derives a short task name from a rule type's full path.
#[must_use]
pub(crate) fn short_type_name<R>() -> String {
    std::any::type_name::<R>()
        .rsplit("::")
        .next()
        .unwrap_or("task")
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_action_retries_document_trouble() {
        assert_eq!(
            default_parse_error_action(ParseErrorKind::Html),
            ErrorAction::Retry
        );
        assert_eq!(
            default_parse_error_action(ParseErrorKind::NodeNotFound),
            ErrorAction::Retry
        );
    }

    #[test]
    fn test_default_action_fails_everything_else() {
        assert_eq!(
            default_parse_error_action(ParseErrorKind::ItemTypeInvalid),
            ErrorAction::Fail
        );
        assert_eq!(
            default_parse_error_action(ParseErrorKind::Unknown),
            ErrorAction::Fail
        );
    }

    #[test]
    fn test_short_type_name_strips_path() {
        struct ListRule;
        let _ = ListRule;
        assert_eq!(short_type_name::<ListRule>(), "ListRule");
        assert_eq!(short_type_name::<u32>(), "u32");
    }
}
