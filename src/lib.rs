//! Spinneret - a concurrent web-scraping engine.
//!
//! Rules declare seed URLs, parse callbacks and output sinks; the executor
//! drives them through a three-stage pipeline built for adversarial hosts:
//!
//! 1. **download** - a fleet of proxy-bound downloaders with per-host
//!    request spacing, ban tracking, error budgets and automatic
//!    replacement from a proxy reputation store;
//! 2. **parse** - user callbacks navigate the fetched HTML, emit structured
//!    items and follow links, with typed errors and a bounded retry loop;
//! 3. **pipe** - items flow through the task's pipelines (stdout JSON, a
//!    JSON file, or anything implementing [`Pipeline`]).
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`executor`] - the top-level engine: queues, worker pools, shutdown
//! - [`rule`] - the contract scraping rules implement
//! - [`context`] - the per-parse callback surface (follow/item/html/retry)
//! - [`html`] - strict and lenient CSS-selector navigation
//! - [`downloader`] - the proxy-bound downloader and its fleet manager
//! - [`proxy`] - proxy model, reputation stores, health probing
//! - [`pipeline`] - output sinks
//! - [`task`] - per-rule lifecycle counters and termination
//!
//! # Example
//!
//! ```no_run
//! use spinneret::{Context, Executor, ExecutorConfig, ParseResult, Rule};
//!
//! struct MovieList;
//!
//! impl Rule for MovieList {
//!     fn seed_links(&self) -> Vec<String> {
//!         vec!["https://movies.example/top".to_string()]
//!     }
//!
//!     fn parse(&self, ctx: &mut Context<'_>) -> ParseResult<()> {
//!         ctx.html("li.movie", |ctx, movie| {
//!             let title = movie.child_text("span.title")?;
//!             ctx.item(serde_json::json!({ "title": title }))
//!         })?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() {
//! let executor = Executor::direct(ExecutorConfig::direct()).await;
//! if let Some(task) = executor.accept(MovieList).await {
//!     task.wait().await;
//!     println!("done: {:?}", task.counters());
//! }
//! executor.stop().await;
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod command;
pub mod context;
pub mod downloader;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod html;
pub mod item;
mod parser;
pub mod pipeline;
mod pipeliner;
pub mod proxy;
pub mod rule;
pub mod task;

// Re-export commonly used types
pub use command::{Command, CommandBuilder, ParseCallback};
pub use context::Context;
pub use downloader::{
    DirectFactory, Downloader, DownloaderFactory, FleetError, ProxyFactory,
};
pub use error::{
    DownloadError, ParseError, ParseErrorKind, ParseResult, PipeError, SelectorTrail,
};
pub use executor::{Executor, ExecutorConfig};
pub use fetch::{DEFAULT_DOWNLOAD_TIMEOUT, FetchRequest, FetchResponse};
pub use html::HtmlElement;
pub use item::Item;
pub use pipeline::{JsonFilePipeline, JsonStdoutPipeline, Pipeline};
pub use proxy::{
    AnonymityLevel, MemoryProxyStore, Proxy, ProxyProbe, ProxyProbeConfig, ProxyStore,
    SqliteProxyStore, StoreError,
};
pub use rule::{ErrorAction, ParseErrorInfo, PipeErrorInfo, Rule};
pub use task::{Task, TaskCounters};
