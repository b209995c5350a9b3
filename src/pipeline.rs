//! Output pipelines: sinks consuming structured items.
//!
//! Pipelines are called concurrently from multiple pipeliner workers, so
//! implementations must be internally synchronized. `close` is invoked
//! exactly once per task, after all `pipe` calls for that task and before
//! the task's completion channel closes; buffered sinks flush there.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::PipeError;
use crate::item::Item;

/// Output sink for structured items.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Consumes one item.
    ///
    /// # Errors
    ///
    /// Any [`PipeError`]; the engine records the item as failed and informs
    /// the rule's pipe-error hook.
    async fn pipe(&self, item: &Item) -> Result<(), PipeError>;

    /// Flushes and releases the sink. Called exactly once per task.
    async fn close(&self);
}

/// Prints each item as a JSON line on stdout. The engine default.
#[derive(Debug, Default)]
pub struct JsonStdoutPipeline;

impl JsonStdoutPipeline {
    /// Creates the pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Pipeline for JsonStdoutPipeline {
    async fn pipe(&self, item: &Item) -> Result<(), PipeError> {
        let line = serde_json::to_string(item.data())?;
        println!("{line}");
        Ok(())
    }

    async fn close(&self) {}
}

/// Buffers items and writes them as one JSON array at close.
///
/// The buffer mutex serialises concurrent `pipe` calls; the file is touched
/// only at close.
#[derive(Debug)]
pub struct JsonFilePipeline {
    path: Option<PathBuf>,
    buffer: Mutex<Vec<Item>>,
}

impl JsonFilePipeline {
    /// Writes the array to an explicit path at close.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Writes the array to `<task folder>/items.json` of the task the
    /// buffered items belong to.
    #[must_use]
    pub fn in_task_folder() -> Self {
        Self {
            path: None,
            buffer: Mutex::new(Vec::new()),
        }
    }

    fn drain(&self) -> Vec<Item> {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *buffer)
    }
}

#[async_trait]
impl Pipeline for JsonFilePipeline {
    async fn pipe(&self, item: &Item) -> Result<(), PipeError> {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        buffer.push(item.clone());
        Ok(())
    }

    async fn close(&self) {
        let items = self.drain();
        if items.is_empty() {
            return;
        }

        let path = self.path.clone().unwrap_or_else(|| {
            items[0].task().folder_path().join("items.json")
        });

        let data: Vec<&serde_json::Value> = items.iter().map(Item::data).collect();
        let rendered = match serde_json::to_vec_pretty(&data) {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(path = %path.display(), error = %e, "item array serialization failed");
                return;
            }
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(path = %path.display(), error = %e, "could not create pipeline directory");
                return;
            }
        }
        match tokio::fs::write(&path, rendered).await {
            Ok(()) => {
                info!(path = %path.display(), items = items.len(), "item file written");
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "item file write failed");
            }
        }
    }
}
