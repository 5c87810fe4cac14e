//! The scheduling worker and its control surface.
//!
//! One [`TaskRunner`] owns the entire run: readiness gating, task
//! selection under the configured policy, purchase attempts, restart
//! coordination. All of it executes on a single worker future; control
//! signals (pause/resume/stop, per-task pause/resume/terminate) are
//! observed only at loop-top checkpoints, so an in-flight attempt always
//! completes through detail-close before a signal takes effect.
//!
//! ```text
//! TaskRunner::run
//!     ReadinessGate::ensure_ready
//!     +-- RoundRobin: queue -> segment -> attempts -> cursor
//!     +-- TimeWindow: select window -> attempts -> reselect
//!             both: RestartCoordinator at safe checkpoints
//! ```
//!
//! Observers subscribe to broadcast events; task state is owned by the
//! worker and published as snapshots, never shared for mutation.

mod round_robin;
mod time_window;

pub use time_window::{parse_hhmm, window_contains};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{error, info};

use crate::capability::{OcrEngine, OcrService, ProcessControl, ScreenDriver};
use crate::config::{AppConfig, GoodsEntry, SchedulerMode, TasksConfig};
use crate::error::Result;
use crate::market::{AttemptResult, Market};
use crate::readiness::ReadinessGate;
use crate::registry::{ResolvedTask, TaskRegistry, TaskRuntimeState, TaskStatus};
use crate::restart::{DowntimePolicy, RestartCoordinator};

/// Throttle for repeated idle notices.
const IDLE_LOG_THROTTLE: Duration = Duration::from_secs(5);

/// Worker run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not started yet.
    Idle,
    /// Worker running.
    Running,
    /// Worker paused; attempts frozen.
    Paused,
    /// Stop requested, worker draining.
    Stopping,
    /// Worker finished.
    Stopped,
}

/// Per-task control command, drained at checkpoints.
#[derive(Debug, Clone)]
enum TaskCommand {
    Pause(String),
    Resume(String),
    Terminate(String),
}

/// Snapshot published on every purchased change and at segment/window
/// transitions.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub task_id: String,
    pub item_name: String,
    pub purchased: i64,
    pub target_total: i64,
    pub executed_ms: u64,
    pub status: TaskStatus,
    pub message: String,
}

/// Events emitted by the worker.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// Worker started.
    Started { run_id: String },
    /// Task state snapshot.
    TaskUpdate(StatusUpdate),
    /// Fatal condition; all task execution terminated.
    Fatal { message: String },
    /// Worker finished.
    Stopped,
}

/// Everything the schedulers need from the outside world, behind one
/// seam: readiness, search context, attempts, restarts.
#[async_trait]
pub(crate) trait AttemptDriver: Send {
    async fn ensure_ready(&mut self) -> Result<()>;

    /// Establish the search context for a task; false means the context
    /// could not be built right now (recoverable).
    async fn establish_context(&mut self, task: &ResolvedTask) -> Result<bool>;

    /// One purchase attempt with the established context.
    async fn attempt(&mut self, task: &ResolvedTask, purchased: i64) -> Result<AttemptResult>;

    /// Run a restart when one is due; returns the downtime of a restart
    /// that ran. The search context is stale afterwards.
    async fn restart_if_due(&mut self) -> Result<Option<Duration>>;

    fn downtime_policy(&self) -> DowntimePolicy;

    /// The worker observed a pause; cached navigation state may go stale
    /// while frozen.
    async fn on_pause(&mut self);
}

/// Production driver: market + readiness gate + restart coordinator.
pub(crate) struct MarketDriver {
    market: Market,
    gate: ReadinessGate,
    restart: RestartCoordinator,
}

#[async_trait]
impl AttemptDriver for MarketDriver {
    async fn ensure_ready(&mut self) -> Result<()> {
        self.gate.ensure_ready().await
    }

    async fn establish_context(&mut self, task: &ResolvedTask) -> Result<bool> {
        self.market.invalidate(Some(&task.goods.id));
        Ok(self.market.ensure_search_context(task).await)
    }

    async fn attempt(&mut self, task: &ResolvedTask, purchased: i64) -> Result<AttemptResult> {
        self.market.purchase_cycle(task, purchased, true).await
    }

    async fn restart_if_due(&mut self) -> Result<Option<Duration>> {
        if !self.restart.is_due() {
            return Ok(None);
        }
        // Safe checkpoint: nothing uncommitted may stay on screen.
        self.market.close_held_detail().await;
        let downtime = self.restart.restart().await?;
        self.market.invalidate(None);
        Ok(Some(downtime))
    }

    fn downtime_policy(&self) -> DowntimePolicy {
        self.restart.policy()
    }

    async fn on_pause(&mut self) {
        self.market.invalidate(None);
    }
}

/// The scheduling worker. Construct it, subscribe for events, then drive
/// `run()` on a task (or use [`TaskRunner::start`]).
pub struct TaskRunner {
    config: Arc<AppConfig>,
    registry: TaskRegistry,
    mode: SchedulerMode,
    state: Arc<RwLock<RunState>>,
    commands: StdMutex<Vec<TaskCommand>>,
    event_tx: broadcast::Sender<RunnerEvent>,
    driver: Mutex<Box<dyn AttemptDriver>>,
}

impl TaskRunner {
    /// Wire a runner against real capabilities. Custom OCR engines may be
    /// passed in; the configured engine name picks one, defaulting to the
    /// bundled HTTP client.
    pub fn new(
        app_config: AppConfig,
        tasks_config: TasksConfig,
        goods: Vec<GoodsEntry>,
        screen: Arc<dyn ScreenDriver>,
        process: Arc<dyn ProcessControl>,
        ocr_engines: Vec<Box<dyn OcrEngine>>,
    ) -> Self {
        let config = Arc::new(app_config);
        let registry = TaskRegistry::build(&tasks_config.tasks, &goods, &config.quantity);
        let ocr = OcrService::resolve(&config.ocr, ocr_engines);

        let market = Market::new(screen.clone(), config.clone(), ocr);
        let gate = ReadinessGate::new(screen.clone(), process.clone(), config.clone());
        let policy = match tasks_config.mode {
            SchedulerMode::Round => DowntimePolicy::ExcludeFromTimer,
            SchedulerMode::Time => DowntimePolicy::CountAgainstTimer,
        };
        let restart = RestartCoordinator::new(
            tasks_config.restart_every_min,
            screen,
            process,
            config.clone(),
            policy,
        );

        Self::with_driver(
            config,
            registry,
            tasks_config.mode,
            Box::new(MarketDriver {
                market,
                gate,
                restart,
            }),
        )
    }

    pub(crate) fn with_driver(
        config: Arc<AppConfig>,
        registry: TaskRegistry,
        mode: SchedulerMode,
        driver: Box<dyn AttemptDriver>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            registry,
            mode,
            state: Arc::new(RwLock::new(RunState::Idle)),
            commands: StdMutex::new(Vec::new()),
            event_tx,
            driver: Mutex::new(driver),
        }
    }

    /// Subscribe to worker events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.event_tx.subscribe()
    }

    /// Issues recorded while resolving the configured tasks.
    pub fn config_issues(&self) -> &[crate::registry::ConfigIssue] {
        self.registry.issues()
    }

    /// Current run state.
    pub async fn state(&self) -> RunState {
        *self.state.read().await
    }

    /// Pause all attempts. Takes effect at the next checkpoint; the
    /// in-flight attempt completes first.
    pub async fn pause(&self) {
        let mut state = self.state.write().await;
        if *state == RunState::Running {
            *state = RunState::Paused;
            info!("Runner paused");
        }
    }

    /// Resume after a pause.
    pub async fn resume(&self) {
        let mut state = self.state.write().await;
        if *state == RunState::Paused {
            *state = RunState::Running;
            info!("Runner resumed");
        }
    }

    /// Stop the worker entirely.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        if matches!(*state, RunState::Running | RunState::Paused) {
            *state = RunState::Stopping;
            info!("Runner stopping");
        }
    }

    /// Pause one task; others keep running.
    pub fn pause_task(&self, task_id: &str) {
        self.push_command(TaskCommand::Pause(task_id.to_string()));
    }

    /// Resume one paused task.
    pub fn resume_task(&self, task_id: &str) {
        self.push_command(TaskCommand::Resume(task_id.to_string()));
    }

    /// Terminate one task: its timer resets, its purchases stay.
    pub fn terminate_task(&self, task_id: &str) {
        self.push_command(TaskCommand::Terminate(task_id.to_string()));
    }

    fn push_command(&self, command: TaskCommand) {
        self.commands.lock().unwrap().push(command);
    }

    /// Spawn the worker onto the runtime.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.run().await })
    }

    /// Run the worker to completion.
    ///
    /// Returns the fatal error when one aborted the run; committed
    /// purchases are never rolled back either way.
    pub async fn run(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            *state = RunState::Running;
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        let _ = self.event_tx.send(RunnerEvent::Started {
            run_id: run_id.clone(),
        });
        info!(
            run_id = %run_id,
            mode = ?self.mode,
            tasks = self.registry.tasks().len(),
            issues = self.registry.issues().len(),
            "Task runner started"
        );

        let mut driver = self.driver.lock().await;
        let result = self.drive(driver.as_mut()).await;

        {
            let mut state = self.state.write().await;
            *state = RunState::Stopped;
        }
        match result {
            Ok(()) => {
                info!("Task runner stopped");
                let _ = self.event_tx.send(RunnerEvent::Stopped);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Fatal error, all task execution terminated");
                let _ = self.event_tx.send(RunnerEvent::Fatal {
                    message: e.to_string(),
                });
                let _ = self.event_tx.send(RunnerEvent::Stopped);
                Err(e)
            }
        }
    }

    async fn drive(&self, driver: &mut dyn AttemptDriver) -> Result<()> {
        driver.ensure_ready().await?;

        match self.mode {
            SchedulerMode::Round => self.run_round_robin(driver).await,
            SchedulerMode::Time => self.run_time_window(driver).await,
        }
    }

    // ------------------------------------------------------------------
    // Shared checkpoint helpers
    // ------------------------------------------------------------------

    pub(crate) async fn is_stopping(&self) -> bool {
        matches!(
            *self.state.read().await,
            RunState::Stopping | RunState::Stopped
        )
    }

    pub(crate) async fn is_paused_globally(&self) -> bool {
        *self.state.read().await == RunState::Paused
    }

    /// Drain and apply per-task commands to the state map, publishing a
    /// snapshot for each transition.
    pub(crate) fn apply_commands(&self, states: &mut HashMap<String, TaskRuntimeState>) {
        let commands = std::mem::take(&mut *self.commands.lock().unwrap());
        for command in commands {
            let task_id = match &command {
                TaskCommand::Pause(id) | TaskCommand::Resume(id) | TaskCommand::Terminate(id) => {
                    id.clone()
                }
            };
            let Some(task) = self
                .registry
                .tasks()
                .iter()
                .find(|t| t.def.id == task_id)
            else {
                continue;
            };
            let Some(state) = states.get_mut(&task_id) else {
                continue;
            };

            let message = match command {
                TaskCommand::Pause(_)
                    if matches!(state.status, TaskStatus::Running | TaskStatus::Idle) =>
                {
                    state.status = TaskStatus::Paused;
                    Some("pause requested")
                }
                TaskCommand::Resume(_) if state.status == TaskStatus::Paused => {
                    state.status = TaskStatus::Idle;
                    Some("resume requested")
                }
                TaskCommand::Terminate(_) => {
                    state.terminate();
                    Some("terminate requested")
                }
                _ => None,
            };

            if let Some(message) = message {
                let snapshot = state.clone();
                self.emit_task(task, &snapshot, message);
            }
        }
    }

    pub(crate) fn emit_task(
        &self,
        task: &ResolvedTask,
        state: &TaskRuntimeState,
        message: impl Into<String>,
    ) {
        let _ = self.event_tx.send(RunnerEvent::TaskUpdate(StatusUpdate {
            task_id: task.def.id.clone(),
            item_name: task.display_name().to_string(),
            purchased: state.purchased,
            target_total: task.def.target_total,
            executed_ms: state.executed_ms,
            status: state.status,
            message: message.into(),
        }));
    }

    pub(crate) fn fresh_states(&self) -> HashMap<String, TaskRuntimeState> {
        self.registry
            .tasks()
            .iter()
            .map(|t| (t.def.id.clone(), TaskRuntimeState::default()))
            .collect()
    }

    pub(crate) fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.config.timing.idle_poll_ms)
    }

    pub(crate) fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.config.timing.pause_poll_ms)
    }

    pub(crate) fn attempt_gap(&self) -> Duration {
        Duration::from_millis(self.config.timing.attempt_gap_ms)
    }
}

/// Throttled idle notice: true at most once per [`IDLE_LOG_THROTTLE`].
pub(crate) fn idle_notice_due(last: &mut Option<Instant>) -> bool {
    let now = Instant::now();
    match last {
        Some(prev) if now.duration_since(*prev) < IDLE_LOG_THROTTLE => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted driver for exercising the schedulers under paused time.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct MockDriver {
        /// Wall time one attempt consumes.
        pub attempt_len: Duration,
        /// Quantity every attempt reports purchased.
        pub qty: u32,
        /// (item_id, minute-since-origin) per attempt, recorded at start.
        pub attempts: Arc<StdMutex<Vec<(String, u64)>>>,
        /// item_id per context establishment.
        pub contexts: Arc<StdMutex<Vec<String>>>,
        /// Attempt index (0-based) that fails fatally, if any.
        pub fatal_at: Option<usize>,
        /// Scripted restart downtimes; each is slept then reported.
        pub restarts: StdMutex<VecDeque<Duration>>,
        pub policy: DowntimePolicy,
        origin: Instant,
        counter: AtomicUsize,
    }

    impl MockDriver {
        pub(crate) fn new(attempt_len: Duration, qty: u32) -> Self {
            Self {
                attempt_len,
                qty,
                attempts: Arc::new(StdMutex::new(Vec::new())),
                contexts: Arc::new(StdMutex::new(Vec::new())),
                fatal_at: None,
                restarts: StdMutex::new(VecDeque::new()),
                policy: DowntimePolicy::ExcludeFromTimer,
                origin: Instant::now(),
                counter: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AttemptDriver for MockDriver {
        async fn ensure_ready(&mut self) -> Result<()> {
            Ok(())
        }

        async fn establish_context(&mut self, task: &ResolvedTask) -> Result<bool> {
            self.contexts
                .lock()
                .unwrap()
                .push(task.def.item_id.clone());
            Ok(true)
        }

        async fn attempt(&mut self, task: &ResolvedTask, _purchased: i64) -> Result<AttemptResult> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            if let Some(fatal_at) = self.fatal_at {
                if n >= fatal_at {
                    return Err(crate::error::FatalError::ServiceFatal(
                        "OCR backend gone".to_string(),
                    ));
                }
            }
            let minute = self.origin.elapsed().as_secs() / 60;
            self.attempts
                .lock()
                .unwrap()
                .push((task.def.item_id.clone(), minute));
            tokio::time::sleep(self.attempt_len).await;
            Ok(AttemptResult::purchased(self.qty))
        }

        async fn restart_if_due(&mut self) -> Result<Option<Duration>> {
            let next = self.restarts.lock().unwrap().pop_front();
            match next {
                Some(downtime) => {
                    tokio::time::sleep(downtime).await;
                    Ok(Some(downtime))
                }
                None => Ok(None),
            }
        }

        fn downtime_policy(&self) -> DowntimePolicy {
            self.policy
        }

        async fn on_pause(&mut self) {}
    }

    /// Registry fixture: tasks bound to trivially-valid goods entries.
    pub(crate) fn registry_of(defs: Vec<crate::config::TaskDefinition>) -> TaskRegistry {
        let files: Vec<tempfile::NamedTempFile> = defs
            .iter()
            .map(|_| tempfile::NamedTempFile::new().unwrap())
            .collect();
        let goods: Vec<GoodsEntry> = defs
            .iter()
            .zip(&files)
            .map(|(d, f)| GoodsEntry {
                id: d.item_id.clone(),
                name: d.item_id.clone(),
                search_name: d.item_id.clone(),
                image_path: f.path().to_string_lossy().into_owned(),
                ..Default::default()
            })
            .collect();
        let registry =
            TaskRegistry::build(&defs, &goods, &crate::config::QuantityConfig::default());
        // The temp files may drop now; the registry never re-checks them.
        assert_eq!(registry.tasks().len(), defs.len());
        registry
    }

    pub(crate) fn task_def(item_id: &str, order: i32, duration_min: u32) -> crate::config::TaskDefinition {
        let mut def: crate::config::TaskDefinition = serde_json::from_str("{}").unwrap();
        def.id = item_id.to_string();
        def.item_id = item_id.to_string();
        def.item_name = item_id.to_string();
        def.order = order;
        def.duration_min = duration_min;
        def
    }
}
