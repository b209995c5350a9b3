//! The pipe-stage worker pool.
//!
//! Workers pull items from the pipe queue and feed each one through every
//! pipeline configured on the item's task, inside a panic frame. A pipeline
//! error or panic is reported to the rule's pipe-error hook and the item is
//! recorded failed; otherwise completed. Either way the item is done —
//! pipelining is never retried.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{PipeError, panic_message};
use crate::item::Item;
use crate::rule::PipeErrorInfo;

struct PipelinerInner {
    pipe_rx: async_channel::Receiver<Item>,
    shutdown: CancellationToken,
}

/// Owns the pipe worker pool.
pub(crate) struct Pipeliner {
    inner: Arc<PipelinerInner>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeliner {
    /// Spawns two workers per available CPU; pipelines are I/O sinks, so
    /// the pool runs wider than the parser's.
    pub(crate) fn start(pipe_rx: async_channel::Receiver<Item>) -> Self {
        let inner = Arc::new(PipelinerInner {
            pipe_rx,
            shutdown: CancellationToken::new(),
        });

        let worker_count =
            2 * std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        let workers = (0..worker_count)
            .map(|worker_id| {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { pipe_worker(worker_id, inner).await })
            })
            .collect();

        Self { inner, workers }
    }

    /// Signals every worker and joins them.
    #[instrument(skip(self))]
    pub(crate) async fn stop(&mut self) {
        self.inner.shutdown.cancel();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "pipe worker panicked");
            }
        }
        info!("pipeliner stopped");
    }
}

async fn pipe_worker(worker_id: usize, inner: Arc<PipelinerInner>) {
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            received = inner.pipe_rx.recv() => match received {
                Ok(item) => handle_item(item).await,
                Err(_) => break,
            },
        }
    }
    debug!(worker_id, "pipe worker stopped");
}

async fn handle_item(item: Item) {
    let task = Arc::clone(item.task());
    let mut failed = false;

    for pipeline in task.pipelines() {
        let outcome = AssertUnwindSafe(pipeline.pipe(&item)).catch_unwind().await;
        let error = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => error,
            Err(payload) => PipeError::unknown(panic_message(payload.as_ref())),
        };

        failed = true;
        warn!(task = %task.name(), error = %error, "pipeline failed");
        task.rule().on_pipe_error(&PipeErrorInfo {
            item: &item,
            error: &error,
        });
    }

    if failed {
        task.record_failed_item().await;
    } else {
        task.record_completed_item().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::task::Task;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingPipeline;

    #[async_trait]
    impl Pipeline for FailingPipeline {
        async fn pipe(&self, _item: &Item) -> Result<(), PipeError> {
            Err(PipeError::unknown("sink unavailable"))
        }

        async fn close(&self) {}
    }

    struct PanickingPipeline;

    #[async_trait]
    impl Pipeline for PanickingPipeline {
        async fn pipe(&self, _item: &Item) -> Result<(), PipeError> {
            panic!("pipeline exploded");
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_handle_item_records_completed() {
        let task = Task::for_tests();
        task.record_new_items(1);

        handle_item(Item::new(Arc::clone(&task), json!({"k": "v"}))).await;

        let counters = task.counters();
        assert_eq!(counters.completed_items, 1);
        assert_eq!(counters.failed_items, 0);
    }

    #[tokio::test]
    async fn test_failing_pipeline_records_failed_item() {
        struct FailRule;
        impl crate::rule::Rule for FailRule {
            fn seed_links(&self) -> Vec<String> {
                Vec::new()
            }
            fn parse(&self, _ctx: &mut crate::context::Context<'_>) -> crate::ParseResult<()> {
                Ok(())
            }
            fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
                vec![Arc::new(FailingPipeline)]
            }
        }

        let task = Task::from_rule(FailRule, crate::task::TaskSettings::default());
        task.record_new_items(1);

        handle_item(Item::new(Arc::clone(&task), json!({"k": "v"}))).await;
        assert_eq!(task.counters().failed_items, 1);
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_panicking_pipeline_is_caught() {
        struct PanicRule;
        impl crate::rule::Rule for PanicRule {
            fn seed_links(&self) -> Vec<String> {
                Vec::new()
            }
            fn parse(&self, _ctx: &mut crate::context::Context<'_>) -> crate::ParseResult<()> {
                Ok(())
            }
            fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
                vec![Arc::new(PanickingPipeline)]
            }
        }

        let task = Task::from_rule(PanicRule, crate::task::TaskSettings::default());
        task.record_new_items(1);

        handle_item(Item::new(Arc::clone(&task), json!({"k": "v"}))).await;
        assert_eq!(task.counters().failed_items, 1);
    }
}
