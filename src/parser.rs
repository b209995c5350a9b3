//! The parse-stage worker pool.
//!
//! Workers pull downloaded commands from the parse queue and run their
//! callbacks inside a panic-catching frame. Callback failures are routed
//! through the rule's parse-error handler; the resulting action either
//! recirculates the command to the download queue (banning the downloader
//! that served it) or records it failed.
//!
//! On success the new follow commands and items are recorded on the task's
//! counters *before* the parent command completes, so the termination
//! predicate can never observe an intermediate zero. The actual channel
//! sends happen from detached tasks to keep a saturated downstream queue
//! from blocking a parse slot.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::command::Command;
use crate::context::{Context, ContextBuffers};
use crate::error::{ParseError, panic_message};
use crate::item::Item;
use crate::rule::ErrorAction;

struct ParserInner {
    parse_rx: async_channel::Receiver<Command>,
    download_tx: async_channel::Sender<Command>,
    pipe_tx: async_channel::Sender<Item>,
    err_limit: u32,
    shutdown: CancellationToken,
}

/// Owns the parse worker pool.
pub(crate) struct Parser {
    inner: Arc<ParserInner>,
    workers: Vec<JoinHandle<()>>,
}

impl Parser {
    /// Spawns one worker per available CPU.
    pub(crate) fn start(
        parse_rx: async_channel::Receiver<Command>,
        download_tx: async_channel::Sender<Command>,
        pipe_tx: async_channel::Sender<Item>,
        err_limit: u32,
    ) -> Self {
        let inner = Arc::new(ParserInner {
            parse_rx,
            download_tx,
            pipe_tx,
            err_limit,
            shutdown: CancellationToken::new(),
        });

        let worker_count =
            std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        let workers = (0..worker_count)
            .map(|worker_id| {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { parse_worker(worker_id, inner).await })
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
                warn!(error = %e, "parse worker panicked");
            }
        }
        info!("parser stopped");
    }
}

async fn parse_worker(worker_id: usize, inner: Arc<ParserInner>) {
    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            received = inner.parse_rx.recv() => match received {
                Ok(cmd) => handle_command(&inner, cmd).await,
                Err(_) => break,
            },
        }
    }
    debug!(worker_id, "parse worker stopped");
}

enum ParseOutcome {
    Complete(ContextBuffers),
    Retry,
    Fail(ParseError),
}

async fn handle_command(inner: &Arc<ParserInner>, cmd: Command) {
    match evaluate(&cmd) {
        ParseOutcome::Complete(buffers) => {
            let task = Arc::clone(cmd.task());
            task.record_new_commands(buffers.follows.len() as u64);
            task.record_new_items(buffers.items.len() as u64);
            task.record_completed_command().await;
            dispatch_follows(inner, buffers.follows);
            dispatch_items(inner, buffers.items);
        }
        ParseOutcome::Retry => retry_command(inner, cmd).await,
        ParseOutcome::Fail(error) => {
            warn!(command = cmd.id(), url = %cmd.request().url, error = %error, "command failed in parse");
            cmd.task().record_failed_command().await;
        }
    }
}

/// Runs the callback inside a panic frame and folds the result, the
/// context buffers and the rule's error handler into one outcome.
///
/// Synchronous on purpose: the context caches a parsed document that must
/// not live across an await point.
fn evaluate(cmd: &Command) -> ParseOutcome {
    let caught = catch_unwind(AssertUnwindSafe(|| {
        let mut ctx = Context::new(cmd)?;
        cmd.task().rule().on_download_finish(&mut ctx);
        let callback = cmd.callback();
        let result = callback(&mut ctx);
        Ok::<_, ParseError>((result, ctx.into_buffers()))
    }));

    match caught {
        Err(payload) => {
            let error = ParseError::unknown(panic_message(payload.as_ref()));
            dispatch_error(cmd, error)
        }
        Ok(Err(setup_error)) => dispatch_error(cmd, setup_error),
        Ok(Ok((result, buffers))) => {
            if buffers.retry_requested {
                // Open question resolved: buffered follows and items are
                // dropped on retry; the re-parse will re-emit them.
                return ParseOutcome::Retry;
            }
            match result {
                Ok(()) => ParseOutcome::Complete(buffers),
                Err(ParseError::NeedRetry) => ParseOutcome::Retry,
                Err(error) => dispatch_error(cmd, error),
            }
        }
    }
}

fn dispatch_error(cmd: &Command, error: ParseError) -> ParseOutcome {
    let task = cmd.task();
    if task.dumps_parse_failures() {
        task.dump_parse_failure(cmd, &error);
    }
    match task.parse_error_action(cmd, &error) {
        ErrorAction::Retry => ParseOutcome::Retry,
        ErrorAction::Fail => ParseOutcome::Fail(error),
    }
}

/// Bans the serving downloader for the command's host and sends the
/// command back to the download queue, unless its failure budget is spent.
async fn retry_command(inner: &Arc<ParserInner>, mut cmd: Command) {
    if let Some(downloader) = cmd.downloader() {
        downloader.be_banned(&cmd.host());
    }

    let failures = cmd.record_failure();
    if failures >= inner.err_limit {
        warn!(command = cmd.id(), failures, "retry budget exhausted; command failed");
        cmd.task().record_failed_command().await;
        return;
    }

    debug!(command = cmd.id(), failures, "command recirculated for retry");
    let download_tx = inner.download_tx.clone();
    tokio::spawn(async move {
        if download_tx.send(cmd).await.is_err() {
            debug!("download queue closed; dropping retried command");
        }
    });
}

fn dispatch_follows(inner: &Arc<ParserInner>, follows: Vec<Command>) {
    if follows.is_empty() {
        return;
    }
    let download_tx = inner.download_tx.clone();
    tokio::spawn(async move {
        for cmd in follows {
            if download_tx.send(cmd).await.is_err() {
                debug!("download queue closed; dropping follow command");
            }
        }
    });
}

fn dispatch_items(inner: &Arc<ParserInner>, items: Vec<Item>) {
    if items.is_empty() {
        return;
    }
    let pipe_tx = inner.pipe_tx.clone();
    tokio::spawn(async move {
        for item in items {
            if pipe_tx.send(item).await.is_err() {
                debug!("pipe queue closed; dropping item");
            }
        }
    });
}
