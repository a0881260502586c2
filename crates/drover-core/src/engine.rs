use crate::checkpoint::Checkpoint;
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEventKind, EventSink};
use crate::executor::{
    Selector, SharedActionExecutor, SharedRestartHost, WaitOutcome,
};
use crate::heartbeat::{HeartbeatMonitor, StallAction};
use crate::persist::{self, keys};
use crate::recovery::{RecoveryController, ResumeAction};
use crate::state::{RunState, StateMachine};
use crate::stats::StatisticsAggregator;
use crate::types::{OutcomeRecord, Progress, Statistics, StatisticsSummary, now_ms};
use drover_store::SharedStateStore;
use regex::Regex;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Why the run loop returned control to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every item resolved; final statistics were emitted.
    Completed,
    /// The run was paused; `resume()` + `continue_processing()`
    /// picks it back up.
    Paused,
    /// The run was stopped or declared failed.
    Stopped,
    /// A checkpoint was written and a forced restart requested; the
    /// host is expected to come back through `initialize()`.
    RestartPending,
}

/// What a cold start found in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColdStart {
    /// A run is live (or a checkpoint was just consumed); the host
    /// should await `continue_processing()`.
    ResumeProcessing,
    /// The run is paused; wait for an explicit `resume()`.
    AwaitResume,
    /// Nothing to do.
    Idle,
}

/// How a single item resolved inside the run loop.
enum ItemOutcome {
    Completed { id: String, amount: f64 },
    /// A business rule aborted the item; recovery already holds the
    /// skip checkpoint and the restart is in flight.
    PolicySkipped,
    Failed(String),
    /// Pause or stop was observed mid-item; nothing was recorded.
    Interrupted,
}

fn amount_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$?(\d+(?:\.\d+)?)").expect("amount pattern is valid"))
}

/// Extract the first monetary amount from free-form element text,
/// with or without a currency sign.
pub fn parse_amount(text: &str) -> Option<f64> {
    amount_pattern()
        .captures(text)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Drives the scripted workflow: owns the run loop, wires the
/// heartbeat and recovery controller together, and exposes the
/// start/pause/resume/stop control surface.
///
/// Shared as `Arc<WorkEngine>`; every piece of mutable run context is
/// an owned field behind its own lock, so two hosts over the same
/// store never fight through globals.
pub struct WorkEngine {
    store: SharedStateStore,
    executor: SharedActionExecutor,
    events: EventSink,
    config: RwLock<EngineConfig>,
    progress: Mutex<Progress>,
    state: StateMachine,
    stats: StatisticsAggregator,
    recovery: RecoveryController,
    heartbeat: HeartbeatMonitor,
}

impl WorkEngine {
    pub fn new(
        store: SharedStateStore,
        executor: SharedActionExecutor,
        host: SharedRestartHost,
        events: EventSink,
    ) -> Arc<Self> {
        let state = StateMachine::new(Arc::clone(&store), events.clone());
        let stats = StatisticsAggregator::new(Arc::clone(&store), events.clone());
        let recovery = RecoveryController::new(
            Arc::clone(&store),
            state.clone(),
            stats.clone(),
            events.clone(),
            host,
        );
        Arc::new(Self {
            store,
            executor,
            events,
            config: RwLock::new(EngineConfig::default()),
            progress: Mutex::new(Progress::default()),
            state,
            stats,
            recovery,
            heartbeat: HeartbeatMonitor::new(),
        })
    }

    /// Begin a fresh run over `total_items` items. Persists the
    /// config and zeroed progress before the Running transition, so
    /// a crash between the two leaves a resumable store.
    pub async fn start(
        self: &Arc<Self>,
        total_items: u32,
        config: EngineConfig,
    ) -> EngineResult<Progress> {
        if self.state.current().await != RunState::NotRunning {
            return Err(EngineError::InvalidTransition(format!(
                "start requires notRunning, found {}",
                self.state.current().await.as_str()
            )));
        }

        let mut config = config;
        if total_items > 0 {
            config.total_items = total_items;
        }
        persist::save(&self.store, keys::CONFIG, &config).await?;
        let progress = Progress::new(config.total_items);
        *self.config.write().expect("config lock poisoned") = config;
        *self.progress.lock().await = progress;
        persist::save(&self.store, keys::PROGRESS, &progress).await?;

        self.recovery.reset();
        Checkpoint::clear(&self.store).await?;
        self.stats.reset(Uuid::new_v4().to_string()).await?;

        self.state.start().await?;
        self.start_heartbeat();
        Ok(progress)
    }

    pub async fn pause(&self) -> EngineResult<()> {
        self.state.pause().await
    }

    /// Paused -> Running. State change only; the host owns the run
    /// loop and is expected to await `continue_processing()` next.
    pub async fn resume(self: &Arc<Self>) -> EngineResult<Progress> {
        self.state.resume().await?;
        self.start_heartbeat();
        Ok(self.progress().await)
    }

    /// Stop the run wherever it is and finalize statistics. Progress
    /// is left in the store so an inspection still sees where the run
    /// ended.
    pub async fn stop(&self) -> EngineResult<StatisticsSummary> {
        self.heartbeat.stop();
        self.recovery.reset();
        Checkpoint::clear(&self.store).await?;
        let summary = self.stats.finalize().await?;
        self.state.stop().await?;
        Ok(summary)
    }

    pub async fn state(&self) -> RunState {
        self.state.current().await
    }

    pub async fn progress(&self) -> Progress {
        *self.progress.lock().await
    }

    pub async fn statistics(&self) -> Statistics {
        self.stats.snapshot().await
    }

    pub async fn summary(&self) -> StatisticsSummary {
        self.stats.summary().await
    }

    /// The item loop. Returns once the run completes, is interrupted,
    /// or hands off to a forced restart; the caller decides what to
    /// do with the outcome.
    pub async fn run(self: &Arc<Self>) -> EngineResult<RunOutcome> {
        let mut first_of_session = true;
        loop {
            match self.state.current().await {
                RunState::Running => {}
                RunState::Paused => return Ok(RunOutcome::Paused),
                RunState::NotRunning => return Ok(RunOutcome::Stopped),
                RunState::Retrying => return Ok(RunOutcome::RestartPending),
            }

            let progress = self.progress().await;
            if progress.is_complete() {
                self.complete().await?;
                return Ok(RunOutcome::Completed);
            }

            self.heartbeat.record_activity();
            let started = now_ms();
            match self.execute_item(progress.current, first_of_session).await? {
                ItemOutcome::Completed { id, amount } => {
                    let retries = self.recovery.retry_count();
                    self.stats
                        .record_success(OutcomeRecord::success(
                            id,
                            amount,
                            now_ms().saturating_sub(started),
                            retries,
                        ))
                        .await?;
                    self.recovery.set_retry_count(0);
                    self.recovery.set_skip_pending(false);
                    self.advance_progress(progress.current + 1).await?;
                    first_of_session = false;

                    let delay = self.config_snapshot().inter_item_delay_ms;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                ItemOutcome::PolicySkipped | ItemOutcome::Interrupted => {
                    // The loop header reads the new state and maps it
                    // to the right outcome.
                    first_of_session = false;
                }
                ItemOutcome::Failed(reason) => {
                    let config = self.config_snapshot();
                    self.recovery
                        .handle_error(&reason, progress.current, &config, self.resume_action())
                        .await?;
                    first_of_session = false;
                }
            }
        }
    }

    /// Re-enter the run loop with fresh context from the store. The
    /// entry point after `resume()` and after a cold start.
    pub async fn continue_processing(self: &Arc<Self>) -> EngineResult<RunOutcome> {
        self.heartbeat.record_activity();
        self.hydrate_run_context().await?;
        self.run().await
    }

    /// Consume a pending checkpoint: restore position and retry
    /// bookkeeping from it, delete it, then Running. Total and
    /// idempotent; with no checkpoint present it does nothing and
    /// reports `false`.
    pub async fn resume_from_checkpoint(self: &Arc<Self>) -> EngineResult<bool> {
        let Some(checkpoint) = Checkpoint::take(&self.store).await? else {
            return Ok(false);
        };
        let iteration = self.recovery.apply(&checkpoint);
        self.recovery.cancel_verification();
        self.hydrate_run_context().await?;
        self.advance_progress(iteration).await?;
        // The checkpoint is consumed, so the Retrying leg exits the
        // validated way; a store seeded with a checkpoint but no
        // Retrying state still lands on Running.
        if self.state.current().await == RunState::Retrying {
            self.state.exit_recovery().await?;
        } else {
            self.state.set_state(RunState::Running).await?;
        }
        self.start_heartbeat();
        Ok(true)
    }

    /// Cold-start recovery: re-hydrate every piece of run context
    /// from the store, consume a pending checkpoint if one survived
    /// the restart, and report what the host should do next.
    pub async fn initialize(self: &Arc<Self>) -> EngineResult<ColdStart> {
        let state = self.state.hydrate().await?;
        self.stats.hydrate().await?;
        self.hydrate_run_context().await?;

        match state {
            RunState::Retrying => {
                if self.resume_from_checkpoint().await? {
                    Ok(ColdStart::ResumeProcessing)
                } else {
                    // Retrying with no checkpoint is a torn leftover;
                    // the run cannot be placed, so treat it as over.
                    self.state.set_state(RunState::NotRunning).await?;
                    Ok(ColdStart::Idle)
                }
            }
            RunState::Running => {
                self.start_heartbeat();
                Ok(ColdStart::ResumeProcessing)
            }
            RunState::Paused => Ok(ColdStart::AwaitResume),
            RunState::NotRunning => Ok(ColdStart::Idle),
        }
    }

    fn config_snapshot(&self) -> EngineConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    async fn hydrate_run_context(&self) -> EngineResult<()> {
        if let Some(config) = persist::load::<EngineConfig>(&self.store, keys::CONFIG).await? {
            *self.config.write().expect("config lock poisoned") = config;
        }
        let total = self.config_snapshot().total_items;
        let stored: Option<Progress> = persist::load(&self.store, keys::PROGRESS).await?;
        *self.progress.lock().await = stored.unwrap_or_else(|| Progress::new(total));
        Ok(())
    }

    async fn advance_progress(&self, next: u32) -> EngineResult<Progress> {
        let mut progress = self.progress.lock().await;
        progress.advance_to(next);
        let updated = *progress;
        persist::save(&self.store, keys::PROGRESS, &updated).await?;
        drop(progress);
        self.events.emit(EngineEventKind::ProgressUpdate {
            progress: updated,
            summary: self.stats.summary().await,
        });
        Ok(updated)
    }

    async fn complete(&self) -> EngineResult<StatisticsSummary> {
        self.heartbeat.stop();
        self.recovery.reset();
        Checkpoint::clear(&self.store).await?;
        let summary = self.stats.finalize().await?;
        self.state.stop().await?;
        self.events.emit(EngineEventKind::ProcessingComplete {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// One item, start to finish. Run state is re-checked before
    /// every step and immediately after every wait; an interruption
    /// observed anywhere abandons the item without recording it.
    async fn execute_item(
        self: &Arc<Self>,
        index: u32,
        first_of_session: bool,
    ) -> EngineResult<ItemOutcome> {
        let config = self.config_snapshot();

        // The first item of a session starts on the queue already;
        // later items navigate back to it and must wait for it.
        if !first_of_session {
            match self
                .executor
                .wait_for(Selector::QueueTab, true, config.step_wait_ms)
                .await
            {
                WaitOutcome::Found(_) => {}
                WaitOutcome::TimedOut => {
                    return Ok(ItemOutcome::Failed("queue tab never appeared".to_string()));
                }
            }
            if !self.state.is_running().await {
                return Ok(ItemOutcome::Interrupted);
            }
        }

        let Some(queue_tab) = self.executor.locate(Selector::QueueTab).await else {
            return Ok(ItemOutcome::Failed("queue tab not found".to_string()));
        };
        if !self.executor.invoke(&queue_tab).await {
            return Ok(ItemOutcome::Failed(
                "opening the queue tab was rejected".to_string(),
            ));
        }
        self.heartbeat.record_activity();

        let buttons = match self
            .executor
            .wait_for(Selector::ItemButtons, true, config.step_wait_ms)
            .await
        {
            WaitOutcome::Found(handle) => handle,
            WaitOutcome::TimedOut => {
                return Ok(ItemOutcome::Failed(
                    "no actionable item buttons appeared".to_string(),
                ));
            }
        };
        if !self.state.is_running().await {
            return Ok(ItemOutcome::Interrupted);
        }
        if !self.executor.invoke(&buttons).await {
            return Ok(ItemOutcome::Failed(
                "opening the current item was rejected".to_string(),
            ));
        }

        let detail = match self
            .executor
            .wait_for(Selector::DetailTag, true, config.step_wait_ms)
            .await
        {
            WaitOutcome::Found(handle) => handle,
            WaitOutcome::TimedOut => {
                return Ok(ItemOutcome::Failed("item detail never appeared".to_string()));
            }
        };
        tokio::time::sleep(Duration::from_millis(config.settle_delay_ms)).await;
        if !self.state.is_running().await {
            return Ok(ItemOutcome::Interrupted);
        }
        if let Some(banner) = self.executor.locate(Selector::FailureBanner).await {
            return Ok(ItemOutcome::Failed(format!(
                "target rejected the item: {}",
                banner.text
            )));
        }
        let item_id = if detail.text.is_empty() {
            format!("item-{index}")
        } else {
            detail.text.clone()
        };

        let sub_steps = self
            .executor
            .locate(Selector::SubStepList)
            .await
            .map(|handle| handle.count.max(1))
            .unwrap_or(1);

        let mut item_amount = 0.0_f64;
        for _ in 0..sub_steps {
            if !self.state.is_running().await {
                return Ok(ItemOutcome::Interrupted);
            }
            self.heartbeat.record_activity();

            // Amount policy check happens before anything is
            // committed; a violation must leave the sub-step
            // untouched.
            if let Some(field) = self.executor.locate(Selector::AmountField).await {
                if let Some(amount) = parse_amount(&field.text) {
                    item_amount = amount;
                    if amount >= config.amount_limit {
                        self.policy_skip_item(index, &item_id, amount, &config).await?;
                        return Ok(ItemOutcome::PolicySkipped);
                    }
                }
            }

            if let Some(outcome) = self.commit_sub_step(&config).await {
                return Ok(outcome);
            }
        }

        Ok(ItemOutcome::Completed {
            id: item_id,
            amount: item_amount,
        })
    }

    /// One confirm/finalize pass, plus the credit-fill fallback when
    /// the primary channel leaves an uncovered remainder.
    async fn commit_sub_step(&self, config: &EngineConfig) -> Option<ItemOutcome> {
        if let Some(outcome) = self.confirm_and_finalize(config).await {
            return Some(outcome);
        }

        if let Some(remainder) = self.executor.locate(Selector::RemainderField).await {
            if parse_amount(&remainder.text).is_some_and(|left| left > 0.0) {
                let Some(fill) = self.executor.locate(Selector::CreditFill).await else {
                    return Some(ItemOutcome::Failed(
                        "remainder left but no credit fill control".to_string(),
                    ));
                };
                if !self.executor.invoke(&fill).await {
                    return Some(ItemOutcome::Failed(
                        "credit fill was rejected".to_string(),
                    ));
                }
                if let Some(outcome) = self.confirm_and_finalize(config).await {
                    return Some(outcome);
                }
            }
        }
        None
    }

    async fn confirm_and_finalize(&self, config: &EngineConfig) -> Option<ItemOutcome> {
        let confirm = match self
            .executor
            .wait_for(Selector::ConfirmButton, true, config.step_wait_ms)
            .await
        {
            WaitOutcome::Found(handle) => handle,
            WaitOutcome::TimedOut => {
                return Some(ItemOutcome::Failed(
                    "confirm button never appeared".to_string(),
                ));
            }
        };
        if !self.state.is_running().await {
            return Some(ItemOutcome::Interrupted);
        }
        if !self.executor.invoke(&confirm).await {
            return Some(ItemOutcome::Failed(
                "confirming the sub-step was rejected".to_string(),
            ));
        }

        let finalize = match self
            .executor
            .wait_for(Selector::FinalizeButton, true, config.step_wait_ms)
            .await
        {
            WaitOutcome::Found(handle) => handle,
            WaitOutcome::TimedOut => {
                return Some(ItemOutcome::Failed(
                    "finalize button never appeared".to_string(),
                ));
            }
        };
        if !self.executor.invoke(&finalize).await {
            return Some(ItemOutcome::Failed(
                "finalizing the sub-step was rejected".to_string(),
            ));
        }
        self.heartbeat.record_activity();

        tokio::time::sleep(Duration::from_millis(config.settle_delay_ms)).await;
        if !self.state.is_running().await {
            return Some(ItemOutcome::Interrupted);
        }
        if let Some(banner) = self.executor.locate(Selector::FailureBanner).await {
            return Some(ItemOutcome::Failed(format!(
                "target rejected the sub-step: {}",
                banner.text
            )));
        }
        None
    }

    /// The amount rule fired: record the skip with full item details,
    /// advance past the item, then hand off to recovery for the
    /// checkpoint-and-restart. Never charges the retry budget.
    async fn policy_skip_item(
        self: &Arc<Self>,
        index: u32,
        item_id: &str,
        amount: f64,
        config: &EngineConfig,
    ) -> EngineResult<()> {
        let reason = format!(
            "amount {amount:.2} at or over limit {:.2}",
            config.amount_limit
        );
        self.stats
            .record_skip(OutcomeRecord::skipped(item_id, amount, 0, reason.clone()))
            .await?;
        self.advance_progress(index + 1).await?;
        self.recovery
            .policy_skip(index + 1, &reason, config, self.resume_action())
            .await
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let config = self.config_snapshot();
        let engine = Arc::clone(self);
        let on_stall: StallAction = Arc::new(move || {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                let position = engine.progress().await.current;
                let config = engine.config_snapshot();
                let resume = engine.resume_action();
                if let Err(error) = engine
                    .recovery
                    .handle_stall(position, &config, resume)
                    .await
                {
                    let summary = engine.stats.summary().await;
                    engine.events.emit(EngineEventKind::RunFailed {
                        reason: format!("stall recovery failed: {error}"),
                        summary,
                    });
                }
            })
        });
        self.heartbeat.start(
            config.heartbeat_interval_ms,
            config.initial_timeout_ms,
            self.state.clone(),
            on_stall,
        );
    }

    /// Force-resume fallback handed to the recovery controller: when
    /// a forced restart never came back through `initialize()`, the
    /// verification timer re-enters the engine with this.
    fn resume_action(self: &Arc<Self>) -> ResumeAction {
        let engine = Arc::clone(self);
        Arc::new(move || {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                match engine.resume_from_checkpoint().await {
                    Ok(true) => {
                        if let Err(error) = engine.continue_processing().await {
                            let summary = engine.stats.summary().await;
                            engine.events.emit(EngineEventKind::RunFailed {
                                reason: format!("forced resume failed: {error}"),
                                summary,
                            });
                        }
                    }
                    Ok(false) => {}
                    Err(error) => {
                        let summary = engine.stats.summary().await;
                        engine.events.emit(EngineEventKind::RunFailed {
                            reason: format!("forced resume failed: {error}"),
                            summary,
                        });
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EngineEvent, SharedEngineEventObserver};
    use crate::executor::{ActionExecutor, ElementHandle, RestartHost};
    use crate::types::OutcomeStatus;
    use async_trait::async_trait;
    use drover_store::MemoryStateStore;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeItem {
        amount: f64,
        /// Confirm-button waits that time out before the item starts
        /// cooperating. `u32::MAX` means it never does.
        failing_waits: AtomicU32,
    }

    /// Simulated target. The item under work is derived from the
    /// persisted progress, same as a real target would present
    /// whatever the queue currently points at.
    struct FakeTarget {
        store: SharedStateStore,
        items: Vec<FakeItem>,
        invoked: StdMutex<Vec<Selector>>,
        restarts: AtomicU32,
        remainder_once: AtomicBool,
        pause_on_detail: StdMutex<Option<StateMachine>>,
    }

    impl FakeTarget {
        fn new(store: SharedStateStore, amounts: &[f64]) -> Arc<Self> {
            Arc::new(Self {
                store,
                items: amounts
                    .iter()
                    .map(|amount| FakeItem {
                        amount: *amount,
                        failing_waits: AtomicU32::new(0),
                    })
                    .collect(),
                invoked: StdMutex::new(Vec::new()),
                restarts: AtomicU32::new(0),
                remainder_once: AtomicBool::new(false),
                pause_on_detail: StdMutex::new(None),
            })
        }

        async fn current_index(&self) -> usize {
            persist::load::<Progress>(&self.store, keys::PROGRESS)
                .await
                .ok()
                .flatten()
                .map(|progress| progress.current as usize)
                .unwrap_or(0)
        }

        fn invoked(&self, selector: Selector) -> usize {
            self.invoked
                .lock()
                .expect("invoked mutex should lock")
                .iter()
                .filter(|seen| **seen == selector)
                .count()
        }
    }

    #[async_trait]
    impl ActionExecutor for FakeTarget {
        async fn locate(&self, selector: Selector) -> Option<ElementHandle> {
            match selector {
                Selector::AmountField => {
                    let index = self.current_index().await;
                    let amount = self.items.get(index).map(|item| item.amount).unwrap_or(0.0);
                    Some(ElementHandle::with_text(selector, format!("${amount:.2} due")))
                }
                Selector::RemainderField => {
                    if self.remainder_once.swap(false, Ordering::SeqCst) {
                        Some(ElementHandle::with_text(selector, "$3.50 remaining"))
                    } else {
                        Some(ElementHandle::with_text(selector, "$0.00 remaining"))
                    }
                }
                Selector::FailureBanner => None,
                _ => Some(ElementHandle::new(selector)),
            }
        }

        async fn invoke(&self, handle: &ElementHandle) -> bool {
            self.invoked
                .lock()
                .expect("invoked mutex should lock")
                .push(handle.selector);
            true
        }

        async fn wait_for(&self, selector: Selector, exists: bool, _timeout_ms: u64) -> WaitOutcome {
            if selector == Selector::DetailTag {
                let hooked = self
                    .pause_on_detail
                    .lock()
                    .expect("pause hook mutex should lock")
                    .take();
                if let Some(state) = hooked {
                    state.pause().await.expect("pause should succeed");
                }
            }
            if selector == Selector::ConfirmButton {
                let index = self.current_index().await;
                if let Some(item) = self.items.get(index) {
                    let failing = item.failing_waits.load(Ordering::SeqCst);
                    if failing > 0 {
                        if failing != u32::MAX {
                            item.failing_waits.store(failing - 1, Ordering::SeqCst);
                        }
                        return WaitOutcome::TimedOut;
                    }
                }
            }
            if exists {
                WaitOutcome::Found(ElementHandle::new(selector))
            } else {
                WaitOutcome::TimedOut
            }
        }
    }

    #[async_trait]
    impl RestartHost for FakeTarget {
        async fn force_restart(&self, _target: &str) -> EngineResult<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        engine: Arc<WorkEngine>,
        target: Arc<FakeTarget>,
        store: SharedStateStore,
        events: Arc<StdMutex<Vec<EngineEvent>>>,
    }

    fn harness(amounts: &[f64]) -> Harness {
        let store: SharedStateStore = Arc::new(MemoryStateStore::new());
        let target = FakeTarget::new(Arc::clone(&store), amounts);
        let events = Arc::new(StdMutex::new(Vec::new()));
        let observed = Arc::clone(&events);
        let observer: SharedEngineEventObserver = Arc::new(move |event: &EngineEvent| {
            observed
                .lock()
                .expect("events mutex should lock")
                .push(event.clone());
        });
        let engine = WorkEngine::new(
            Arc::clone(&store),
            Arc::clone(&target) as SharedActionExecutor,
            Arc::clone(&target) as SharedRestartHost,
            EventSink::with_observer(observer),
        );
        Harness {
            engine,
            target,
            store,
            events,
        }
    }

    fn quick_config(total_items: u32) -> EngineConfig {
        EngineConfig {
            total_items,
            max_retries: 2,
            step_wait_ms: 5,
            inter_item_delay_ms: 1,
            settle_delay_ms: 1,
            retry_timeout_ms: 30,
            extended_timeout_ms: 60,
            ..EngineConfig::default()
        }
    }

    /// Re-enter the engine after each forced restart the way a host
    /// coming back through a cold start would.
    async fn drive(engine: &Arc<WorkEngine>) -> RunOutcome {
        let mut outcome = engine.run().await.expect("run should succeed");
        let mut restarts = 0;
        while outcome == RunOutcome::RestartPending {
            restarts += 1;
            assert!(restarts < 32, "run never settled");
            if engine
                .resume_from_checkpoint()
                .await
                .expect("resume should succeed")
            {
                outcome = engine
                    .continue_processing()
                    .await
                    .expect("continue should succeed");
            } else {
                break;
            }
        }
        outcome
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn clean_run_expected_completed_with_final_statistics() {
        let fixture = harness(&[10.0, 25.5]);
        fixture
            .engine
            .start(2, quick_config(2))
            .await
            .expect("start should succeed");

        let outcome = drive(&fixture.engine).await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(fixture.engine.state().await, RunState::NotRunning);
        assert!(fixture.engine.progress().await.is_complete());

        let stats = fixture.engine.statistics().await;
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.successful, 2);
        assert!(stats.end_time.is_some());

        let events = fixture.events.lock().expect("events mutex should lock");
        assert!(matches!(
            events.first().map(|event| &event.kind),
            Some(EngineEventKind::StateChanged {
                state: RunState::Running
            })
        ));
        assert!(matches!(
            events.last().map(|event| &event.kind),
            Some(EngineEventKind::ProcessingComplete { .. })
        ));
        assert!(events
            .iter()
            .any(|event| matches!(event.kind, EngineEventKind::ProgressUpdate { .. })));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn amount_over_limit_expected_policy_skip_without_retry_charge() {
        // Amount exactly at the limit must already trigger the skip.
        let fixture = harness(&[10.0, 500.0, 20.0]);
        fixture
            .engine
            .start(3, quick_config(3))
            .await
            .expect("start should succeed");

        let outcome = drive(&fixture.engine).await;

        assert_eq!(outcome, RunOutcome::Completed);
        let stats = fixture.engine.statistics().await;
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.retry_attempts, 0, "policy skip never charges retries");
        assert_eq!(stats.records[1].status, OutcomeStatus::Skipped);
        assert_eq!(stats.records[1].amount, 500.0);
        assert_eq!(fixture.engine.progress().await.current, 3);
        assert!(fixture.target.restarts.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn transient_failure_expected_retry_then_success() {
        let fixture = harness(&[10.0]);
        fixture.target.items[0].failing_waits.store(1, Ordering::SeqCst);
        fixture
            .engine
            .start(1, quick_config(1))
            .await
            .expect("start should succeed");

        let outcome = drive(&fixture.engine).await;

        assert_eq!(outcome, RunOutcome::Completed);
        let stats = fixture.engine.statistics().await;
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.retry_attempts, 1);
        assert_eq!(stats.records[0].retries, 1);
        assert_eq!(fixture.target.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn permanent_failure_expected_bounded_retries_then_skip() {
        let fixture = harness(&[10.0]);
        fixture.target.items[0]
            .failing_waits
            .store(u32::MAX, Ordering::SeqCst);
        fixture
            .engine
            .start(1, quick_config(1))
            .await
            .expect("start should succeed");

        let outcome = drive(&fixture.engine).await;

        assert_eq!(outcome, RunOutcome::Completed, "skip of the only item completes the run");
        let stats = fixture.engine.statistics().await;
        assert_eq!(stats.retry_attempts, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.successful, 0);
        assert_eq!(fixture.engine.recovery.retry_count(), 0);
        assert_eq!(fixture.target.restarts.load(Ordering::SeqCst), 3);
        assert_eq!(
            Checkpoint::load(&fixture.store)
                .await
                .expect("load should succeed"),
            None
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn initialize_with_pending_checkpoint_expected_resume_at_iteration() {
        let fixture = harness(&[5.0, 5.0]);

        // Seed the store the way a crashed run would have left it.
        persist::save(&fixture.store, keys::RUN_STATE, &RunState::Retrying)
            .await
            .expect("save should succeed");
        persist::save(&fixture.store, keys::CHECKPOINT, &Checkpoint::retry(1, 1))
            .await
            .expect("save should succeed");
        persist::save(
            &fixture.store,
            keys::PROGRESS,
            &Progress { current: 1, total: 2 },
        )
        .await
        .expect("save should succeed");
        persist::save(&fixture.store, keys::CONFIG, &quick_config(2))
            .await
            .expect("save should succeed");
        persist::save(&fixture.store, keys::STATISTICS, &{
            let mut stats = Statistics::new_run("run-interrupted");
            stats.total_processed = 1;
            stats.successful = 1;
            stats
        })
        .await
        .expect("save should succeed");

        let cold_start = fixture
            .engine
            .initialize()
            .await
            .expect("initialize should succeed");

        assert_eq!(cold_start, ColdStart::ResumeProcessing);
        assert_eq!(fixture.engine.state().await, RunState::Running);
        assert_eq!(fixture.engine.progress().await.current, 1);
        assert_eq!(fixture.engine.recovery.retry_count(), 1);
        assert_eq!(
            Checkpoint::load(&fixture.store)
                .await
                .expect("load should succeed"),
            None,
            "checkpoint is consumed exactly once"
        );

        let outcome = drive(&fixture.engine).await;
        assert_eq!(outcome, RunOutcome::Completed);
        let stats = fixture.engine.statistics().await;
        assert_eq!(stats.run_id, "run-interrupted");
        assert_eq!(stats.total_processed, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn initialize_retrying_without_checkpoint_expected_idle() {
        let fixture = harness(&[]);
        persist::save(&fixture.store, keys::RUN_STATE, &RunState::Retrying)
            .await
            .expect("save should succeed");

        let cold_start = fixture
            .engine
            .initialize()
            .await
            .expect("initialize should succeed");

        assert_eq!(cold_start, ColdStart::Idle);
        assert_eq!(fixture.engine.state().await, RunState::NotRunning);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn resume_from_checkpoint_expected_second_call_noop() {
        let fixture = harness(&[5.0]);
        persist::save(&fixture.store, keys::CONFIG, &quick_config(1))
            .await
            .expect("save should succeed");
        persist::save(&fixture.store, keys::CHECKPOINT, &Checkpoint::retry(0, 2))
            .await
            .expect("save should succeed");

        let first = fixture
            .engine
            .resume_from_checkpoint()
            .await
            .expect("resume should succeed");
        let second = fixture
            .engine
            .resume_from_checkpoint()
            .await
            .expect("resume should succeed");

        assert!(first);
        assert!(!second, "consumed checkpoint must not resume twice");
        assert_eq!(fixture.engine.state().await, RunState::Running);
        assert_eq!(fixture.engine.recovery.retry_count(), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn pause_mid_item_expected_nothing_recorded_then_resume_finishes() {
        let fixture = harness(&[10.0, 10.0]);
        fixture
            .engine
            .start(2, quick_config(2))
            .await
            .expect("start should succeed");
        *fixture
            .target
            .pause_on_detail
            .lock()
            .expect("pause hook mutex should lock") = Some(fixture.engine.state.clone());

        let outcome = fixture.engine.run().await.expect("run should succeed");

        assert_eq!(outcome, RunOutcome::Paused);
        assert_eq!(fixture.engine.progress().await.current, 0);
        assert_eq!(fixture.engine.statistics().await.total_processed, 0);

        fixture.engine.resume().await.expect("resume should succeed");
        let outcome = fixture
            .engine
            .continue_processing()
            .await
            .expect("continue should succeed");
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(fixture.engine.statistics().await.successful, 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn remainder_after_finalize_expected_credit_fill_pass() {
        let fixture = harness(&[10.0]);
        fixture.target.remainder_once.store(true, Ordering::SeqCst);
        fixture
            .engine
            .start(1, quick_config(1))
            .await
            .expect("start should succeed");

        let outcome = drive(&fixture.engine).await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(fixture.target.invoked(Selector::CreditFill), 1);
        assert_eq!(
            fixture.target.invoked(Selector::ConfirmButton),
            2,
            "remainder triggers a second confirm pass"
        );
        assert_eq!(fixture.engine.statistics().await.successful, 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_mid_run_expected_finalized_statistics_and_cleared_checkpoint() {
        let fixture = harness(&[10.0, 10.0]);
        fixture
            .engine
            .start(2, quick_config(2))
            .await
            .expect("start should succeed");

        let summary = fixture.engine.stop().await.expect("stop should succeed");

        assert_eq!(fixture.engine.state().await, RunState::NotRunning);
        assert!(summary.end_time >= summary.start_time);
        let outcome = fixture.engine.run().await.expect("run should succeed");
        assert_eq!(outcome, RunOutcome::Stopped);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn start_while_running_expected_invalid_transition() {
        let fixture = harness(&[10.0]);
        fixture
            .engine
            .start(1, quick_config(1))
            .await
            .expect("start should succeed");

        let error = fixture
            .engine
            .start(1, quick_config(1))
            .await
            .expect_err("second start should fail");
        assert!(matches!(error, EngineError::InvalidTransition(_)));
    }

    #[test]
    fn parse_amount_expected_currency_forms_accepted() {
        assert_eq!(parse_amount("$512.50 due"), Some(512.5));
        assert_eq!(parse_amount("total 40"), Some(40.0));
        assert_eq!(parse_amount("no amount here"), None);
    }
}
