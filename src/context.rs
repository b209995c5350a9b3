//! The per-parse context exposed to rule callbacks.
//!
//! A [`Context`] exists for exactly one command execution. It gives the
//! callback read access to the fetched response, read/write access to the
//! command's context-data map, HTML navigation entry points, and buffers
//! for newly produced follow commands and items. The parse worker drains
//! the buffers after the callback returns.
//!
//! The parsed document is cached inside the context and is not `Send`; a
//! context never crosses an await point.

use std::any::TypeId;
use std::collections::HashMap;
use std::rc::Rc;

use scraper::Html;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::command::{Command, CommandBuilder, ParseCallback};
use crate::error::{ParseError, ParseResult, SelectorTrail};
use crate::fetch::FetchResponse;
use crate::html::{HtmlElement, parse_selector};
use crate::item::Item;

/// Context-data key carrying the target path of a `save_resource` follow.
const SAVE_PATH_KEY: &str = "save-resource-path";

/// Ephemeral view of one command execution, handed to parse callbacks.
pub struct Context<'a> {
    cmd: &'a Command,
    response: &'a FetchResponse,
    data: HashMap<String, Value>,
    doc: Option<Rc<Html>>,
    follows: Vec<Command>,
    items: Vec<Item>,
    retry_requested: bool,
}

impl<'a> Context<'a> {
    pub(crate) fn new(cmd: &'a Command) -> ParseResult<Self> {
        let response = cmd
            .response()
            .ok_or_else(|| ParseError::unknown("command reached parse without a response"))?;
        Ok(Self {
            cmd,
            response,
            data: cmd.data().clone(),
            doc: None,
            follows: Vec::new(),
            items: Vec::new(),
            retry_requested: false,
        })
    }

    /// The URL this command was fetched from.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.cmd.request().url
    }

    /// The fetched response.
    #[must_use]
    pub fn response(&self) -> &FetchResponse {
        self.response
    }

    /// Response body bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.response.body
    }

    /// Reads a context-data entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Writes a context-data entry. Follow commands inherit the current map.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Marks the current command for re-download and returns the error the
    /// callback should abort with:
    ///
    /// ```ignore
    /// return Err(ctx.retry());
    /// ```
    ///
    /// The retry counts against the command's failure budget, and the
    /// downloader that served this response is banned for the host.
    pub fn retry(&mut self) -> ParseError {
        self.retry_requested = true;
        ParseError::NeedRetry
    }

    /// A command builder pre-seeded with this task and the current context
    /// data, for [`Context::follow_with`].
    #[must_use]
    pub fn follow_builder(&self) -> CommandBuilder {
        CommandBuilder::new(std::sync::Arc::clone(self.cmd.task()))
            .context_data(self.data.clone())
    }

    /// Enqueues a follow command for `link`, resolved against the current
    /// command's URL.
    ///
    /// # Errors
    ///
    /// [`ParseError::Unknown`] if the link does not resolve to a URL.
    pub fn follow<F>(&mut self, link: &str, callback: F) -> ParseResult<()>
    where
        F: Fn(&mut Context<'_>) -> ParseResult<()> + Send + Sync + 'static,
    {
        let builder = self.follow_builder();
        self.follow_with(link, std::sync::Arc::new(callback), builder)
    }

    /// Like [`Context::follow`], with extra context data merged over the
    /// inherited map.
    ///
    /// # Errors
    ///
    /// [`ParseError::Unknown`] if the link does not resolve to a URL.
    pub fn follow_with_data<F>(
        &mut self,
        link: &str,
        callback: F,
        data: impl IntoIterator<Item = (String, Value)>,
    ) -> ParseResult<()>
    where
        F: Fn(&mut Context<'_>) -> ParseResult<()> + Send + Sync + 'static,
    {
        let builder = self.follow_builder().extend_context_data(data);
        self.follow_with(link, std::sync::Arc::new(callback), builder)
    }

    /// Enqueues a follow command from an explicit builder, which may carry
    /// user-agent, cookie and timeout overrides.
    ///
    /// # Errors
    ///
    /// [`ParseError::Unknown`] if the link does not resolve to a URL.
    pub fn follow_with(
        &mut self,
        link: &str,
        callback: ParseCallback,
        builder: CommandBuilder,
    ) -> ParseResult<()> {
        let url = self
            .cmd
            .request()
            .url
            .join(link)
            .map_err(|e| ParseError::unknown(format!("invalid follow link {link:?}: {e}")))?;
        let cmd = builder.url(url).callback(callback).build()?;
        debug!(parent = self.cmd.id(), follow = cmd.id(), url = %cmd.request().url, "follow enqueued");
        self.follows.push(cmd);
        Ok(())
    }

    /// Records a structured item for pipelining.
    ///
    /// The item's shape is validated once per Rust type: the serialized
    /// form must be a map of strings, string sequences, or nested maps
    /// satisfying the same rule.
    ///
    /// # Errors
    ///
    /// [`ParseError::ItemTypeInvalid`] when validation fails.
    pub fn item<T: Serialize + 'static>(&mut self, value: T) -> ParseResult<()> {
        let serialized = serde_json::to_value(&value).map_err(|e| {
            ParseError::item_type_invalid(std::any::type_name::<T>(), e.to_string())
        })?;

        if TypeId::of::<T>() == TypeId::of::<Value>() {
            // Dynamic JSON values have no stable per-type shape; validate
            // each instance instead of memoising.
            crate::item::validate_item_shape(&serialized)
                .map_err(|detail| ParseError::item_type_invalid(std::any::type_name::<T>(), detail))?;
        } else {
            self.cmd.task().check_item_type(
                TypeId::of::<T>(),
                std::any::type_name::<T>(),
                &serialized,
            )?;
        }

        self.items
            .push(Item::new(std::sync::Arc::clone(self.cmd.task()), serialized));
        Ok(())
    }

    /// Downloads `link` and saves its body under
    /// `<task folder>/<file_relative_path>`. Non-200 responses are retried.
    ///
    /// # Errors
    ///
    /// [`ParseError::Unknown`] if the link does not resolve to a URL.
    pub fn save_resource(&mut self, link: &str, file_relative_path: &str) -> ParseResult<()> {
        self.follow_with_data(
            link,
            save_resource_callback,
            [(
                SAVE_PATH_KEY.to_string(),
                Value::String(file_relative_path.to_string()),
            )],
        )
    }

    /// The parsed response document, cached after the first call.
    fn document(&mut self) -> Rc<Html> {
        if let Some(doc) = &self.doc {
            return Rc::clone(doc);
        }
        let doc = Rc::new(Html::parse_document(&self.response.text()));
        self.doc = Some(Rc::clone(&doc));
        doc
    }

    /// Invokes `f` on every element matching `selector` in the response
    /// document. An empty selector selects the document root.
    ///
    /// # Errors
    ///
    /// [`ParseError::NodeNotFound`] if nothing matches, [`ParseError::Html`]
    /// on a malformed selector; errors from `f` propagate.
    pub fn html<F>(&mut self, selector: &str, f: F) -> ParseResult<usize>
    where
        F: FnMut(&mut Context<'a>, &HtmlElement<'_>) -> ParseResult<()>,
    {
        let count = self.may_html(selector, f)?;
        if count == 0 {
            return Err(ParseError::node_not_found(
                SelectorTrail::new().push("selector", selector),
            ));
        }
        Ok(count)
    }

    /// Like [`Context::html`], but zero matches is not an error.
    ///
    /// # Errors
    ///
    /// [`ParseError::Html`] on a malformed selector; errors from `f`
    /// propagate.
    pub fn may_html<F>(&mut self, selector: &str, mut f: F) -> ParseResult<usize>
    where
        F: FnMut(&mut Context<'a>, &HtmlElement<'_>) -> ParseResult<()>,
    {
        let selector = if selector.is_empty() { "html" } else { selector };
        let sel = parse_selector(selector)?;
        let doc = self.document();
        let trail = SelectorTrail::new().push("selector", selector);

        let mut count = 0;
        for element in doc.select(&sel) {
            count += 1;
            f(self, &HtmlElement::new(element, &trail))?;
        }
        Ok(count)
    }

    pub(crate) fn into_buffers(self) -> ContextBuffers {
        ContextBuffers {
            follows: self.follows,
            items: self.items,
            retry_requested: self.retry_requested,
        }
    }
}

/// What a callback left behind on its context.
pub(crate) struct ContextBuffers {
    pub follows: Vec<Command>,
    pub items: Vec<Item>,
    pub retry_requested: bool,
}

/// Built-in callback behind [`Context::save_resource`].
fn save_resource_callback(ctx: &mut Context<'_>) -> ParseResult<()> {
    if ctx.response().status != 200 {
        return Err(ctx.retry());
    }

    let Some(Value::String(relative)) = ctx.get(SAVE_PATH_KEY).cloned() else {
        warn!(url = %ctx.url(), "save_resource follow lost its target path");
        return Ok(());
    };

    let path = ctx.cmd.task().folder_path().join(&relative);
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return Err(ParseError::unknown(format!(
                "could not create {}: {e}",
                parent.display()
            )));
        }
    }
    std::fs::write(&path, ctx.body())
        .map_err(|e| ParseError::unknown(format!("could not write {}: {e}", path.display())))?;

    debug!(path = %path.display(), bytes = ctx.body().len(), "resource saved");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::command::CommandBuilder;
    use crate::task::Task;
    use serde_json::json;
    use std::sync::Arc;

    const PAGE: &str = r#"
        <html><body>
          <div class="list">
            <a href="/detail/1">One</a>
            <a href="/detail/2">Two</a>
          </div>
        </body></html>
    "#;

    fn fetched_command(body: &str, status: u16) -> Command {
        let mut cmd = CommandBuilder::new(Task::for_tests())
            .link("http://fixture.test/list")
            .unwrap()
            .callback(Arc::new(|_| Ok(())))
            .build()
            .unwrap();
        cmd.set_response(FetchResponse {
            status,
            body: body.as_bytes().to_vec(),
            final_url: Url::parse("http://fixture.test/list").unwrap(),
        });
        cmd
    }

    #[test]
    fn test_context_requires_response() {
        let cmd = CommandBuilder::new(Task::for_tests())
            .link("http://fixture.test/list")
            .unwrap()
            .callback(Arc::new(|_| Ok(())))
            .build()
            .unwrap();
        assert!(Context::new(&cmd).is_err());
    }

    #[test]
    fn test_get_set_round_trip() {
        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        assert!(ctx.get("page").is_none());
        ctx.set("page", json!(2));
        assert_eq!(ctx.get("page").unwrap(), &json!(2));
    }

    #[test]
    fn test_html_strict_miss_and_lenient_zero() {
        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        assert!(matches!(
            ctx.html("div.absent", |_, _| Ok(())),
            Err(ParseError::NodeNotFound { .. })
        ));
        assert_eq!(ctx.may_html("div.absent", |_, _| Ok(())).unwrap(), 0);
    }

    #[test]
    fn test_html_iterates_and_allows_context_mutation() {
        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        let count = ctx
            .html("div.list a", |ctx, a| {
                let href = a.attr("href")?;
                ctx.follow(&href, |_| Ok(()))?;
                ctx.item(json!({"title": a.text()}))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 2);

        let buffers = ctx.into_buffers();
        assert_eq!(buffers.follows.len(), 2);
        assert_eq!(buffers.items.len(), 2);
        assert!(!buffers.retry_requested);
    }

    #[test]
    fn test_follow_resolves_relative_links() {
        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        ctx.follow("/detail/7", |_| Ok(())).unwrap();
        ctx.follow("relative", |_| Ok(())).unwrap();
        ctx.follow("http://other.test/abs", |_| Ok(())).unwrap();

        let buffers = ctx.into_buffers();
        let urls: Vec<String> = buffers
            .follows
            .iter()
            .map(|c| c.request().url.to_string())
            .collect();
        assert_eq!(
            urls,
            vec![
                "http://fixture.test/detail/7",
                "http://fixture.test/relative",
                "http://other.test/abs",
            ]
        );
    }

    #[test]
    fn test_follow_inherits_and_extends_data() {
        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        ctx.set("depth", json!(1));
        ctx.follow_with_data("/next", |_| Ok(()), [("extra".to_string(), json!("x"))])
            .unwrap();

        let buffers = ctx.into_buffers();
        let data = buffers.follows[0].data();
        assert_eq!(data["depth"], json!(1));
        assert_eq!(data["extra"], json!("x"));
    }

    #[test]
    fn test_follow_with_builder_overrides() {
        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        let builder = ctx
            .follow_builder()
            .user_agent("probe/2.0")
            .download_timeout(std::time::Duration::from_secs(5));
        ctx.follow_with("/next", Arc::new(|_| Ok(())), builder)
            .unwrap();

        let buffers = ctx.into_buffers();
        let req = buffers.follows[0].request();
        assert_eq!(req.user_agent.as_deref(), Some("probe/2.0"));
        assert_eq!(req.timeout, std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_item_shape_validation_rejects_numbers() {
        #[derive(serde::Serialize)]
        struct Bad {
            year: u32,
        }

        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        assert!(matches!(
            ctx.item(Bad { year: 1999 }),
            Err(ParseError::ItemTypeInvalid { .. })
        ));
        assert!(ctx.into_buffers().items.is_empty());
    }

    #[test]
    fn test_item_struct_accepted_and_memoised() {
        #[derive(serde::Serialize)]
        struct Movie {
            title: String,
            tags: Vec<String>,
        }

        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        for i in 0..2 {
            ctx.item(Movie {
                title: format!("T{i}"),
                tags: vec!["a".into()],
            })
            .unwrap();
        }
        assert_eq!(ctx.into_buffers().items.len(), 2);
    }

    #[test]
    fn test_dynamic_value_items_validate_each_time() {
        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        ctx.item(json!({"ok": "yes"})).unwrap();
        assert!(ctx.item(json!({"bad": 1})).is_err());
    }

    #[test]
    fn test_retry_sets_flag_and_returns_need_retry() {
        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        let err = ctx.retry();
        assert!(matches!(err, ParseError::NeedRetry));
        assert!(ctx.into_buffers().retry_requested);
    }

    #[test]
    fn test_save_resource_callback_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let task = Task::for_tests_in(dir.path());

        let mut cmd = CommandBuilder::new(Arc::clone(&task))
            .link("http://fixture.test/img.png")
            .unwrap()
            .callback(Arc::new(|_| Ok(())))
            .context_data(HashMap::from([(
                SAVE_PATH_KEY.to_string(),
                json!("img/cover.png"),
            )]))
            .build()
            .unwrap();
        cmd.set_response(FetchResponse {
            status: 200,
            body: b"PNG".to_vec(),
            final_url: Url::parse("http://fixture.test/img.png").unwrap(),
        });

        let mut ctx = Context::new(&cmd).unwrap();
        save_resource_callback(&mut ctx).unwrap();

        let saved = task.folder_path().join("img/cover.png");
        assert_eq!(std::fs::read(saved).unwrap(), b"PNG");
    }

    #[test]
    fn test_save_resource_callback_retries_non_200() {
        let dir = tempfile::tempdir().unwrap();
        let task = Task::for_tests_in(dir.path());
        let mut cmd = CommandBuilder::new(task)
            .link("http://fixture.test/img.png")
            .unwrap()
            .callback(Arc::new(|_| Ok(())))
            .context_data(HashMap::from([(
                SAVE_PATH_KEY.to_string(),
                json!("cover.png"),
            )]))
            .build()
            .unwrap();
        cmd.set_response(FetchResponse {
            status: 503,
            body: Vec::new(),
            final_url: Url::parse("http://fixture.test/img.png").unwrap(),
        });

        let mut ctx = Context::new(&cmd).unwrap();
        assert!(matches!(
            save_resource_callback(&mut ctx),
            Err(ParseError::NeedRetry)
        ));
        assert!(ctx.into_buffers().retry_requested);
    }

    #[test]
    fn test_save_resource_enqueues_follow_with_path() {
        let cmd = fetched_command(PAGE, 200);
        let mut ctx = Context::new(&cmd).unwrap();
        ctx.save_resource("/img/1.png", "one.png").unwrap();

        let buffers = ctx.into_buffers();
        assert_eq!(buffers.follows.len(), 1);
        assert_eq!(buffers.follows[0].data()[SAVE_PATH_KEY], json!("one.png"));
    }
}
