//! The executor: the engine's top-level object.
//!
//! An executor owns the three bounded pipeline queues and the three worker
//! pools (downloader manager, parser, pipeliner). Rules enter through
//! [`Executor::accept`], which builds a task and enqueues one command per
//! seed URL; [`Executor::stop`] shuts the pools down in an order that
//! guarantees no worker pushes to a closed channel, draining whatever is
//! left in flight.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::command::{Command, CommandBuilder};
use crate::downloader::{
    DirectFactory, DownloaderFactory, DownloaderManager, FleetConfig, ProxyFactory,
};
use crate::item::Item;
use crate::parser::Parser;
use crate::pipeliner::Pipeliner;
use crate::proxy::ProxyStore;
use crate::rule::Rule;
use crate::task::{DEFAULT_INSTANCE_ROOT, Task, TaskSettings};

/// Capacity of each pipeline queue.
const CHANNEL_CAPACITY: usize = 500;

/// Executor construction parameters.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of downloaders in the fleet.
    pub fleet_size: usize,
    /// Concurrent requests per downloader.
    pub concurrency: usize,
    /// Consecutive-error budget per downloader, and the failure budget per
    /// command.
    pub err_limit: u32,
    /// Minimum spacing between accepted requests to one host, per
    /// downloader.
    pub host_interval: Duration,
    /// Root directory for per-task folders.
    pub instance_root: PathBuf,
    /// Dump parse failures under `<task folder>/debug/parse/`.
    pub dump_parse_failures: bool,
}

impl ExecutorConfig {
    /// Preset for proxyless scraping: one direct downloader with wide
    /// concurrency.
    #[must_use]
    pub fn direct() -> Self {
        Self {
            fleet_size: 1,
            concurrency: 20,
            err_limit: 10,
            host_interval: Duration::from_secs(2),
            instance_root: PathBuf::from(DEFAULT_INSTANCE_ROOT),
            dump_parse_failures: false,
        }
    }

    /// Preset for proxy-backed scraping: a wide fleet with narrow
    /// per-downloader concurrency.
    #[must_use]
    pub fn proxied() -> Self {
        Self {
            fleet_size: 100,
            concurrency: 2,
            err_limit: 10,
            host_interval: Duration::from_secs(3),
            ..Self::direct()
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::direct()
    }
}

struct Pools {
    manager: DownloaderManager,
    parser: Parser,
    pipeliner: Pipeliner,
}

/// The scraping engine. See the crate docs for the pipeline it drives.
pub struct Executor {
    config: ExecutorConfig,
    running: AtomicBool,

    download_tx: async_channel::Sender<Command>,
    download_rx: async_channel::Receiver<Command>,
    parse_tx: async_channel::Sender<Command>,
    parse_rx: async_channel::Receiver<Command>,
    pipe_tx: async_channel::Sender<Item>,
    pipe_rx: async_channel::Receiver<Item>,

    pools: tokio::sync::Mutex<Option<Pools>>,
}

impl Executor {
    /// Builds an executor over the given downloader factory.
    #[instrument(skip(factory), fields(fleet = config.fleet_size))]
    pub async fn new(factory: Arc<dyn DownloaderFactory>, config: ExecutorConfig) -> Self {
        let (download_tx, download_rx) = async_channel::bounded(CHANNEL_CAPACITY);
        let (parse_tx, parse_rx) = async_channel::bounded(CHANNEL_CAPACITY);
        let (pipe_tx, pipe_rx) = async_channel::bounded(CHANNEL_CAPACITY);

        let manager = DownloaderManager::start(
            factory,
            FleetConfig {
                fleet_size: config.fleet_size,
                concurrency: config.concurrency,
                err_limit: config.err_limit,
                host_interval: config.host_interval,
            },
            download_tx.clone(),
            download_rx.clone(),
            parse_tx.clone(),
        )
        .await;
        let parser = Parser::start(
            parse_rx.clone(),
            download_tx.clone(),
            pipe_tx.clone(),
            config.err_limit,
        );
        let pipeliner = Pipeliner::start(pipe_rx.clone());

        info!(
            fleet = config.fleet_size,
            concurrency = config.concurrency,
            err_limit = config.err_limit,
            host_interval_ms = config.host_interval.as_millis(),
            "executor started"
        );

        Self {
            config,
            running: AtomicBool::new(true),
            download_tx,
            download_rx,
            parse_tx,
            parse_rx,
            pipe_tx,
            pipe_rx,
            pools: tokio::sync::Mutex::new(Some(Pools {
                manager,
                parser,
                pipeliner,
            })),
        }
    }

    /// An executor with no proxies: every downloader connects directly.
    pub async fn direct(config: ExecutorConfig) -> Self {
        Self::new(Arc::new(DirectFactory::new()), config).await
    }

    /// An executor whose fleet draws proxies from the given store.
    pub async fn with_proxy_store(store: Arc<dyn ProxyStore>, config: ExecutorConfig) -> Self {
        Self::new(Arc::new(ProxyFactory::new(store)), config).await
    }

    /// Whether the executor still accepts rules.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Accepts a rule: builds its task, enqueues one command per seed URL
    /// and returns the task handle. Returns `None` when the executor has
    /// been stopped.
    ///
    /// A rule with no seed links (or none that parse as URLs) completes
    /// immediately.
    #[instrument(skip_all)]
    pub async fn accept<R: Rule>(&self, rule: R) -> Option<Arc<Task>> {
        if !self.is_running() {
            return None;
        }

        let task = Task::from_rule(
            rule,
            TaskSettings {
                instance_root: self.config.instance_root.clone(),
                dump_parse_failures: self.config.dump_parse_failures,
            },
        );

        let rule = Arc::clone(task.rule());
        let callback: crate::command::ParseCallback = {
            let rule = Arc::clone(&rule);
            Arc::new(move |ctx| rule.parse(ctx))
        };

        let mut commands = Vec::new();
        for link in rule.seed_links() {
            let built = CommandBuilder::new(Arc::clone(&task))
                .link(&link)
                .and_then(|b| b.callback(Arc::clone(&callback)).build());
            match built {
                Ok(cmd) => commands.push(cmd),
                Err(e) => warn!(link = %link, error = %e, "seed link skipped"),
            }
        }

        info!(task = %task.name(), id = %task.id(), seeds = commands.len(), "rule accepted");

        if commands.is_empty() {
            task.finish().await;
            return Some(task);
        }

        task.record_new_commands(commands.len() as u64);
        for cmd in commands {
            if self.download_tx.send(cmd).await.is_err() {
                warn!(task = %task.name(), "download queue closed; seed dropped");
                task.record_failed_command().await;
            }
        }

        Some(task)
    }

    /// Stops the engine: refuses further rules, drains the queues, joins
    /// every worker pool and closes the channels. Idempotent; concurrent
    /// and repeated calls return once the first shutdown completes.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let mut pools_slot = self.pools.lock().await;
        let Some(mut pools) = pools_slot.take() else {
            return;
        };
        info!("executor stopping");

        // Drainers unblock any producer still mid-send while the pools
        // wind down, and consume whatever the workers leave behind.
        let drainers = vec![
            spawn_drainer("download", self.download_rx.clone()),
            spawn_drainer("parse", self.parse_rx.clone()),
            spawn_drainer("pipe", self.pipe_rx.clone()),
        ];

        // Stop order guarantees nobody pushes to a closed channel: the
        // manager feeds parse, the parser feeds download and pipe, the
        // pipeliner feeds nothing.
        pools.manager.stop().await;
        pools.parser.stop().await;
        pools.pipeliner.stop().await;

        self.download_tx.close();
        self.parse_tx.close();
        self.pipe_tx.close();

        for drainer in drainers {
            if let Err(e) = drainer.await {
                warn!(error = %e, "drainer panicked");
            }
        }
        info!("executor stopped");
    }
}

fn spawn_drainer<T: Send + 'static>(
    label: &'static str,
    rx: async_channel::Receiver<T>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut dropped = 0_u64;
        while rx.recv().await.is_ok() {
            dropped += 1;
        }
        info!(queue = label, dropped, "queue drained");
    })
}
