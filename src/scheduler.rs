//! Bounded pool of workers that claim pending executions and run each one
//! in its own sandbox on a blocking thread.

use crate::backtester::BacktestSession;
use crate::config::SchedulerConfig;
use crate::errors::{SandboxTimeoutError, ScheduleError, StoreError};
use crate::job_status::JobStatus;
use crate::models::{
    BtExecution, BtStrategy, ExecutionError, ExecutionId, ExecutionStatus, ProgressUpdate,
    StrategyId, TerminalUpdate,
};
use crate::repository::{MarketDataSource, StrategyRepository};
use crate::retry::retry_db_operation;
use crate::sandbox::{ExecutionOutcome, Sandbox, SandboxConfig, SandboxEvent};
use crate::store::ExecutionStore;
use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// How long a stopped sandbox gets to unwind before its worker writes the
/// terminal state without it.
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Deadline,
    Canceled,
    Shutdown,
}

#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    executions: Arc<dyn ExecutionStore>,
    strategies: Arc<dyn StrategyRepository>,
    market_data: Arc<dyn MarketDataSource>,
    config: SchedulerConfig,
    prelude: Option<String>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    status: JobStatus,
}

impl JobScheduler {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        strategies: Arc<dyn StrategyRepository>,
        market_data: Arc<dyn MarketDataSource>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let prelude = match &config.prelude_path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read prelude {}", path.display()))?,
            ),
            None => None,
        };
        // Fail at start-up rather than on every job when limits or prelude are bad.
        Sandbox::start(SandboxConfig {
            limits: config.sandbox.clone(),
            deadline: config.job_timeout,
            prelude: prelude.clone(),
        })
        .context("sandbox configuration rejected")?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                executions,
                strategies,
                market_data,
                config,
                prelude,
                wake: Notify::new(),
                shutdown,
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                status: JobStatus::new(),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn status(&self) -> JobStatus {
        self.inner.status.clone()
    }

    /// Spawns the recovery sweep and `job_concurrency` workers. Later calls
    /// are no-ops.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = Vec::with_capacity(self.inner.config.job_concurrency + 1);
        handles.push(tokio::spawn(recovery_loop(self.inner.clone())));
        for worker in 0..self.inner.config.job_concurrency {
            handles.push(tokio::spawn(worker_loop(self.inner.clone(), worker)));
        }
        info!(
            "Job scheduler started with {} worker{} (timeout {} ms)",
            self.inner.config.job_concurrency,
            if self.inner.config.job_concurrency == 1 { "" } else { "s" },
            self.inner.config.job_timeout.as_millis()
        );
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.extend(handles);
        }
    }

    /// Stops claiming, stops running sandboxes and waits for every worker.
    /// Jobs cut short stay `running` for the recovery sweep.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for joined in join_all(handles).await {
            if let Err(err) = joined {
                warn!("Scheduler task ended abnormally: {}", err);
            }
        }
        info!("Job scheduler stopped");
    }

    pub async fn schedule(&self, strategy_id: &StrategyId) -> Result<ExecutionId, ScheduleError> {
        let inner = &self.inner;
        let exists = retry_db_operation!(format!("checking strategy {}", strategy_id), async {
            inner.strategies.exists_by_id(strategy_id).await
        })
        .map_err(ScheduleError::Store)?;
        if !exists {
            return Err(ScheduleError::StrategyNotFound(strategy_id.clone()));
        }

        let record = retry_db_operation!(
            format!("creating execution for strategy {}", strategy_id),
            async { inner.executions.create(strategy_id).await }
        )
        .map_err(ScheduleError::Store)?;
        inner.wake.notify_one();
        info!(
            "Scheduled execution {} for strategy {}",
            record.id, strategy_id
        );
        Ok(record.id)
    }

    /// Returns the status after the request, `None` for unknown ids.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<Option<ExecutionStatus>, StoreError> {
        let inner = &self.inner;
        let status = retry_db_operation!(format!("canceling execution {}", id), async {
            inner.executions.request_cancellation(id).await
        })?;
        if let Some(status) = status {
            info!("Cancellation requested for execution {} ({})", id, status);
        }
        Ok(status)
    }

    pub async fn recover_now(&self) -> Result<Vec<ExecutionId>, StoreError> {
        self.inner.sweep().await
    }
}

impl SchedulerInner {
    async fn sweep(&self) -> Result<Vec<ExecutionId>, StoreError> {
        let grace = chrono::Duration::from_std(self.config.recovery_grace)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - grace;
        let interrupted = retry_db_operation!("recovering expired executions", async {
            self.executions.interrupt_expired(cutoff).await
        })?;
        for id in &interrupted {
            warn!("Execution {} outlived its worker; marked interrupted", id);
        }
        Ok(interrupted)
    }

    async fn run_job(&self, record: BtExecution, shutdown: &mut watch::Receiver<bool>) {
        let id = record.id.clone();
        self.status.job_started(&id);
        info!(
            "Execution {} started for strategy {}",
            id, record.bt_strategy_id
        );

        let Some(terminal) = self.execute_claimed(&record, shutdown).await else {
            warn!(
                "Execution {} left running during shutdown; recovery will close it",
                id
            );
            self.status.job_released(&id);
            return;
        };

        let status = terminal.status();
        let written = retry_db_operation!(format!("finishing execution {}", id), async {
            self.executions.set_terminal(&id, &terminal).await
        });
        match written {
            Ok(true) => info!("Execution {} {}", id, status),
            Ok(false) => warn!(
                "Execution {} was no longer running; {} not recorded",
                id, status
            ),
            Err(err) => error!("Failed to record {} for execution {}: {}", status, id, err),
        }
        self.status.job_finished(&id, status);
    }

    async fn load_strategy(&self, record: &BtExecution) -> Result<BtStrategy, ExecutionError> {
        let strategy_id = &record.bt_strategy_id;
        match retry_db_operation!(format!("loading strategy {}", strategy_id), async {
            self.strategies.get_by_id(strategy_id).await
        }) {
            Ok(Some(strategy)) => Ok(strategy),
            Ok(None) => Err(ExecutionError::new(
                "StrategyNotFoundError",
                format!("strategy {} does not exist", strategy_id),
            )),
            Err(err) => Err(ExecutionError::new("StoreError", err.to_string())),
        }
    }

    async fn load_session(&self, strategy: &BtStrategy) -> Result<BacktestSession> {
        let klines = self.market_data.klines(strategy).await?;
        let symbol = self
            .market_data
            .symbol(&strategy.exchange, &strategy.symbol)
            .await?;
        debug!(
            "Loaded {} klines of {} {} for strategy {}",
            klines.len(),
            strategy.symbol,
            strategy.timeframe.as_str(),
            strategy.id
        );
        Ok(BacktestSession::new(strategy, symbol, klines))
    }

    /// `None` when the job was abandoned because of shutdown.
    async fn execute_claimed(
        &self,
        record: &BtExecution,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<TerminalUpdate> {
        let strategy = match self.load_strategy(record).await {
            Ok(strategy) => strategy,
            Err(error) => return Some(TerminalUpdate::Failed(error)),
        };
        let session = match self.load_session(&strategy).await {
            Ok(session) => session,
            Err(err) => {
                return Some(TerminalUpdate::Failed(ExecutionError::new(
                    "DataLoadError",
                    format!("{:#}", err),
                )))
            }
        };

        let remaining = record
            .deadline_at
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(self.config.job_timeout);
        if remaining.is_zero() {
            return Some(self.timeout_update());
        }

        let mut sandbox = match Sandbox::start(SandboxConfig {
            limits: self.config.sandbox.clone(),
            deadline: remaining,
            prelude: self.prelude.clone(),
        }) {
            Ok(sandbox) => sandbox,
            Err(err) => {
                return Some(TerminalUpdate::Failed(ExecutionError::new(
                    "SandboxCreationError",
                    err.to_string(),
                )))
            }
        };
        let handle = sandbox.handle();
        let Some(mut events) = sandbox.take_events() else {
            return Some(TerminalUpdate::Failed(ExecutionError::new(
                "SandboxCreationError",
                "sandbox event stream unavailable",
            )));
        };

        let body = strategy.body.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let mut session = session;
            let outcome = sandbox.execute(&body, &mut session);
            let logs = sandbox.logs();
            (outcome, session, logs)
        });

        let deadline = tokio::time::sleep(remaining);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut progress = ProgressBuffer::default();
        let mut stop_reason: Option<StopReason> = None;
        let mut abandon_at: Option<Instant> = None;

        let joined = loop {
            tokio::select! {
                biased;
                joined = &mut task => break Some(joined),
                Some(event) = events.recv() => progress.apply(event),
                _ = &mut deadline, if stop_reason.is_none() => {
                    handle.stop_for_timeout();
                    stop_reason = Some(StopReason::Deadline);
                    abandon_at = Some(Instant::now() + STOP_GRACE);
                }
                _ = poll.tick() => {
                    self.flush_progress(&record.id, &mut progress).await;
                    if stop_reason.is_none() && self.cancellation_requested(&record.id).await {
                        handle.stop();
                        stop_reason = Some(StopReason::Canceled);
                        abandon_at = Some(Instant::now() + STOP_GRACE);
                    }
                }
                changed = shutdown.changed(), if stop_reason.is_none() => {
                    if changed.is_err() || *shutdown.borrow() {
                        handle.stop();
                        stop_reason = Some(StopReason::Shutdown);
                        abandon_at = Some(Instant::now() + STOP_GRACE);
                    }
                }
                _ = wait_until(abandon_at), if abandon_at.is_some() => {
                    warn!("Sandbox for execution {} did not stop in time", record.id);
                    break None;
                }
            }
        };

        while let Ok(event) = events.try_recv() {
            progress.apply(event);
        }
        self.flush_progress(&record.id, &mut progress).await;

        match joined {
            Some(Ok((outcome, session, logs))) => match outcome {
                ExecutionOutcome::Completed(value) => {
                    Some(TerminalUpdate::Finished(session.into_result(logs, value)))
                }
                ExecutionOutcome::Threw(message) => Some(TerminalUpdate::Failed(
                    ExecutionError::new("ProgramError", message),
                )),
                ExecutionOutcome::TimedOut => Some(self.timeout_update()),
                ExecutionOutcome::Stopped => self.stopped_update(stop_reason),
            },
            Some(Err(join_err)) => Some(TerminalUpdate::Failed(ExecutionError::new(
                "SandboxPanicError",
                join_err.to_string(),
            ))),
            None => match stop_reason {
                Some(StopReason::Deadline) => Some(self.timeout_update()),
                other => self.stopped_update(other),
            },
        }
    }

    fn timeout_update(&self) -> TerminalUpdate {
        TerminalUpdate::Timeout(ExecutionError::new(
            "TimeoutError",
            SandboxTimeoutError {
                limit: self.config.job_timeout,
            }
            .to_string(),
        ))
    }

    fn stopped_update(&self, reason: Option<StopReason>) -> Option<TerminalUpdate> {
        match reason {
            Some(StopReason::Shutdown) => None,
            Some(StopReason::Deadline) => Some(self.timeout_update()),
            Some(StopReason::Canceled) | None => Some(TerminalUpdate::Canceled(
                ExecutionError::new("CanceledError", "execution was canceled"),
            )),
        }
    }

    async fn cancellation_requested(&self, id: &ExecutionId) -> bool {
        match self.executions.is_cancellation_requested(id).await {
            Ok(requested) => requested,
            Err(err) => {
                warn!("Could not read cancellation flag of {}: {}", id, err);
                false
            }
        }
    }

    async fn flush_progress(&self, id: &ExecutionId, progress: &mut ProgressBuffer) {
        let Some(update) = progress.pending_update() else {
            return;
        };
        let written = retry_db_operation!(format!("saving progress of {}", id), async {
            self.executions.update_progress(id, &update).await
        });
        match written {
            Ok(_) => progress.mark_persisted(&update),
            Err(err) => warn!("Progress of execution {} not saved: {}", id, err),
        }
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn worker_loop(inner: Arc<SchedulerInner>, worker: usize) {
    let mut shutdown = inner.shutdown.subscribe();
    debug!("Worker {} waiting for executions", worker);
    loop {
        if *shutdown.borrow() {
            break;
        }
        let claimed = retry_db_operation!(format!("claiming execution (worker {})", worker), async {
            inner
                .executions
                .claim_next_pending(inner.config.job_timeout)
                .await
        });
        match claimed {
            Ok(Some(record)) => {
                inner.run_job(record, &mut shutdown).await;
                continue;
            }
            Ok(None) => {}
            Err(err) => error!("Worker {} could not claim an execution: {}", worker, err),
        }

        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
    debug!("Worker {} stopped", worker);
}

async fn recovery_loop(inner: Arc<SchedulerInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut ticker = tokio::time::interval(inner.config.recovery_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = inner.sweep().await {
                    error!("Recovery sweep failed: {}", err);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Progress not yet persisted, in emission order.
#[derive(Debug, Default)]
struct ProgressBuffer {
    percentage: u8,
    persisted_lines: usize,
    pending: Vec<String>,
    dirty: bool,
}

impl ProgressBuffer {
    fn apply(&mut self, event: SandboxEvent) {
        match event {
            SandboxEvent::Log { offset, line } => {
                if offset >= self.persisted_lines + self.pending.len() {
                    self.pending.push(line);
                }
            }
            SandboxEvent::Progress(percentage) => {
                self.percentage = self.percentage.max(percentage.min(100));
            }
        }
        self.dirty = true;
    }

    fn pending_update(&self) -> Option<ProgressUpdate> {
        self.dirty.then(|| ProgressUpdate {
            percentage: self.percentage,
            log_offset: self.persisted_lines,
            lines: self.pending.clone(),
        })
    }

    fn mark_persisted(&mut self, update: &ProgressUpdate) {
        let written = update.lines.len().min(self.pending.len());
        self.pending.drain(..written);
        self.persisted_lines += written;
        self.dirty = !self.pending.is_empty() || self.percentage > update.percentage;
    }
}
