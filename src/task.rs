//! Tasks: the runtime instance of a rule.
//!
//! A task aggregates every command and item produced for one rule. It owns
//! the lifecycle counters, the output pipelines and the completion channel.
//! Termination fires exactly once, when running commands and piping items
//! both reach zero; at that point every pipeline is closed and waiters are
//! released.
//!
//! Counter updates take two mutexes (command counts, then item counts —
//! always in that order) so the termination predicate is evaluated
//! atomically with respect to both families of counters.

use std::any::TypeId;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::{ParseError, ParseResult};
use crate::pipeline::Pipeline;
use crate::rule::{ErrorAction, ParseErrorInfo, Rule, short_type_name};

/// Default root directory for per-task folders.
pub const DEFAULT_INSTANCE_ROOT: &str = "instance";

/// Engine-level settings a task inherits from the executor.
#[derive(Debug, Clone)]
pub(crate) struct TaskSettings {
    pub instance_root: PathBuf,
    pub dump_parse_failures: bool,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            instance_root: PathBuf::from(DEFAULT_INSTANCE_ROOT),
            dump_parse_failures: false,
        }
    }
}

#[derive(Debug, Default)]
struct CommandCounts {
    running: u64,
    completed: u64,
    failed: u64,
}

#[derive(Debug, Default)]
struct ItemCounts {
    piping: u64,
    completed: u64,
    failed: u64,
}

/// Snapshot of a task's lifecycle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCounters {
    /// Commands enqueued but not yet completed or failed.
    pub running_commands: u64,
    /// Commands whose parse finished successfully.
    pub completed_commands: u64,
    /// Commands that exhausted their failure budget.
    pub failed_commands: u64,
    /// Items emitted but not yet piped.
    pub piping_items: u64,
    /// Items piped through every pipeline.
    pub completed_items: u64,
    /// Items whose pipelining failed.
    pub failed_items: u64,
}

impl TaskCounters {
    /// Total commands ever enqueued for the task.
    #[must_use]
    pub fn total_commands(&self) -> u64 {
        self.running_commands + self.completed_commands + self.failed_commands
    }

    /// Total items ever emitted for the task.
    #[must_use]
    pub fn total_items(&self) -> u64 {
        self.piping_items + self.completed_items + self.failed_items
    }
}

/// The runtime instance of a [`Rule`].
pub struct Task {
    name: String,
    id: String,
    rule: Arc<dyn Rule>,
    download_timeout: Duration,
    pipelines: Vec<Arc<dyn Pipeline>>,
    settings: TaskSettings,

    cmd_counts: Mutex<CommandCounts>,
    item_counts: Mutex<ItemCounts>,
    seen_item_types: DashMap<TypeId, ()>,

    finished: AtomicBool,
    done: CancellationToken,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("counters", &self.counters())
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(crate) fn from_rule<R: Rule>(rule: R, settings: TaskSettings) -> Arc<Self> {
        let name = rule.task_name().unwrap_or_else(short_type_name::<R>);
        Self::build(Arc::new(rule), name, settings)
    }

    fn build(rule: Arc<dyn Rule>, name: String, settings: TaskSettings) -> Arc<Self> {
        let download_timeout = rule.download_timeout();
        let pipelines = rule.pipelines();
        Arc::new(Self {
            name,
            id: format!("{:08x}", rand::random::<u32>()),
            rule,
            download_timeout,
            pipelines,
            settings,
            cmd_counts: Mutex::new(CommandCounts::default()),
            item_counts: Mutex::new(ItemCounts::default()),
            seen_item_types: DashMap::new(),
            finished: AtomicBool::new(false),
            done: CancellationToken::new(),
        })
    }

    /// Task display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique task id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The rule this task runs.
    #[must_use]
    pub fn rule(&self) -> &Arc<dyn Rule> {
        &self.rule
    }

    /// Download timeout applied to the task's commands.
    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        self.download_timeout
    }

    /// The task's output pipelines.
    #[must_use]
    pub fn pipelines(&self) -> &[Arc<dyn Pipeline>] {
        &self.pipelines
    }

    /// Per-task folder for saved resources and debug dumps:
    /// `<instance_root>/<name> - <id>/`.
    #[must_use]
    pub fn folder_path(&self) -> PathBuf {
        self.settings
            .instance_root
            .join(format!("{} - {}", self.name, self.id))
    }

    /// Whether parse failures are dumped to the task folder.
    #[must_use]
    pub fn dumps_parse_failures(&self) -> bool {
        self.settings.dump_parse_failures
    }

    /// Current counter snapshot.
    #[must_use]
    pub fn counters(&self) -> TaskCounters {
        let cmds = self.lock_cmds();
        let items = self.lock_items();
        TaskCounters {
            running_commands: cmds.running,
            completed_commands: cmds.completed,
            failed_commands: cmds.failed,
            piping_items: items.piping,
            completed_items: items.completed,
            failed_items: items.failed,
        }
    }

    /// Whether the task has terminated.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Waits until the task terminates.
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    fn lock_cmds(&self) -> MutexGuard<'_, CommandCounts> {
        self.cmd_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_items(&self) -> MutexGuard<'_, ItemCounts> {
        self.item_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn record_new_commands(&self, count: u64) {
        if count == 0 {
            return;
        }
        let mut cmds = self.lock_cmds();
        cmds.running += count;
    }

    pub(crate) async fn record_completed_command(&self) {
        let terminated = {
            let mut cmds = self.lock_cmds();
            cmds.running = cmds.running.saturating_sub(1);
            cmds.completed += 1;
            let items = self.lock_items();
            cmds.running == 0 && items.piping == 0
        };
        if terminated {
            self.finish().await;
        }
    }

    pub(crate) async fn record_failed_command(&self) {
        let terminated = {
            let mut cmds = self.lock_cmds();
            cmds.running = cmds.running.saturating_sub(1);
            cmds.failed += 1;
            let items = self.lock_items();
            cmds.running == 0 && items.piping == 0
        };
        if terminated {
            self.finish().await;
        }
    }

    pub(crate) fn record_new_items(&self, count: u64) {
        if count == 0 {
            return;
        }
        // Lock order: command counts before item counts, everywhere.
        let _cmds = self.lock_cmds();
        let mut items = self.lock_items();
        items.piping += count;
    }

    pub(crate) async fn record_completed_item(&self) {
        let terminated = {
            let cmds = self.lock_cmds();
            let mut items = self.lock_items();
            items.piping = items.piping.saturating_sub(1);
            items.completed += 1;
            cmds.running == 0 && items.piping == 0
        };
        if terminated {
            self.finish().await;
        }
    }

    pub(crate) async fn record_failed_item(&self) {
        let terminated = {
            let cmds = self.lock_cmds();
            let mut items = self.lock_items();
            items.piping = items.piping.saturating_sub(1);
            items.failed += 1;
            cmds.running == 0 && items.piping == 0
        };
        if terminated {
            self.finish().await;
        }
    }

    /// Closes every pipeline and releases waiters. Idempotent.
    pub(crate) async fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        for pipeline in &self.pipelines {
            pipeline.close().await;
        }
        self.done.cancel();
        info!(task = %self.name, id = %self.id, counters = ?self.counters(), "task finished");
    }

    /// Validates an emitted item's shape, memoised by the item's Rust type.
    ///
    /// # Errors
    ///
    /// [`ParseError::ItemTypeInvalid`] when the shape rule is violated.
    pub(crate) fn check_item_type(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        value: &serde_json::Value,
    ) -> ParseResult<()> {
        if self.seen_item_types.contains_key(&type_id) {
            return Ok(());
        }
        crate::item::validate_item_shape(value)
            .map_err(|detail| ParseError::item_type_invalid(type_name, detail))?;
        self.seen_item_types.insert(type_id, ());
        Ok(())
    }

    /// Routes a parse failure to the rule's handler.
    pub(crate) fn parse_error_action(&self, cmd: &Command, error: &ParseError) -> ErrorAction {
        let info = ParseErrorInfo {
            command_id: cmd.id(),
            url: &cmd.request().url,
            failures: cmd.failures(),
            error,
        };
        self.rule.on_parse_error(&info)
    }

    /// Writes the failed command's diagnostics and response body under
    /// `<task folder>/debug/parse/command-<id>/`.
    pub(crate) fn dump_parse_failure(&self, cmd: &Command, error: &ParseError) {
        let dir = self
            .folder_path()
            .join("debug")
            .join("parse")
            .join(format!("command-{}", cmd.id()));
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(path = %dir.display(), error = %e, "could not create debug dump directory");
            return;
        }

        let info = serde_json::json!({
            "command_id": cmd.id(),
            "url": cmd.request().url.as_str(),
            "failures": cmd.failures(),
            "error": error.to_string(),
        });
        let rendered = serde_json::to_vec_pretty(&info).unwrap_or_default();
        if let Err(e) = std::fs::write(dir.join("info.json"), rendered) {
            warn!(path = %dir.display(), error = %e, "could not write debug info");
        }
        let body = cmd.response().map(|r| r.body.clone()).unwrap_or_default();
        if let Err(e) = std::fs::write(dir.join("resource"), body) {
            warn!(path = %dir.display(), error = %e, "could not write debug resource");
        }
        debug!(command = cmd.id(), path = %dir.display(), "parse failure dumped");
    }
}
