use crate::checkpoint::Checkpoint;
use crate::config::EngineConfig;
use crate::errors::EngineResult;
use crate::events::{EngineEventKind, EventSink};
use crate::executor::SharedRestartHost;
use crate::state::{RunState, StateMachine};
use crate::stats::StatisticsAggregator;
use crate::types::OutcomeRecord;
use drover_store::SharedStateStore;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Re-enters the engine when a forced restart silently failed to
/// re-initialize it: consume the checkpoint, then continue processing.
pub type ResumeAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Consecutive verification firings that still find an unconsumed
/// checkpoint before the run is declared unrecoverable.
pub const MAX_UNVERIFIED_RESTARTS: u32 = 3;

/// Owns the retry/skip decision policy and the checkpoint-then-restart
/// mechanism used whenever an error, stall, or policy violation is
/// detected.
pub struct RecoveryController {
    store: SharedStateStore,
    state: StateMachine,
    stats: StatisticsAggregator,
    events: EventSink,
    host: SharedRestartHost,
    retry_count: Arc<AtomicU32>,
    skip_pending: Arc<AtomicBool>,
    unverified_restarts: Arc<AtomicU32>,
    verify_timer: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryController {
    pub fn new(
        store: SharedStateStore,
        state: StateMachine,
        stats: StatisticsAggregator,
        events: EventSink,
        host: SharedRestartHost,
    ) -> Self {
        Self {
            store,
            state,
            stats,
            events,
            host,
            retry_count: Arc::new(AtomicU32::new(0)),
            skip_pending: Arc::new(AtomicBool::new(false)),
            unverified_restarts: Arc::new(AtomicU32::new(0)),
            verify_timer: Mutex::new(None),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn set_retry_count(&self, count: u32) {
        self.retry_count.store(count, Ordering::SeqCst);
    }

    /// True while the restart in flight carries a skip checkpoint;
    /// cleared once that checkpoint is consumed.
    pub fn skip_pending(&self) -> bool {
        self.skip_pending.load(Ordering::SeqCst)
    }

    pub fn set_skip_pending(&self, pending: bool) {
        self.skip_pending.store(pending, Ordering::SeqCst);
    }

    /// Reset all recovery bookkeeping for a fresh run or a full stop.
    pub fn reset(&self) {
        self.set_retry_count(0);
        self.set_skip_pending(false);
        self.unverified_restarts.store(0, Ordering::SeqCst);
        self.cancel_verification();
    }

    /// A non-timeout failure was observed while processing `position`.
    pub async fn handle_error(
        &self,
        reason: &str,
        position: u32,
        config: &EngineConfig,
        resume: ResumeAction,
    ) -> EngineResult<()> {
        self.recover(reason, position, config, resume).await
    }

    /// The heartbeat found no activity past the liveness threshold.
    pub async fn handle_stall(
        &self,
        position: u32,
        config: &EngineConfig,
        resume: ResumeAction,
    ) -> EngineResult<()> {
        self.recover("processing stalled: no activity past liveness threshold", position, config, resume)
            .await
    }

    /// A business rule deliberately aborted the item: not a fault,
    /// never charged against the retry budget. The caller has already
    /// recorded the skip with full item details.
    pub async fn policy_skip(
        &self,
        next_position: u32,
        reason: &str,
        config: &EngineConfig,
        resume: ResumeAction,
    ) -> EngineResult<()> {
        if !self.state.is_running().await {
            return Ok(());
        }
        self.cancel_verification();
        self.set_skip_pending(true);
        self.set_retry_count(0);

        let checkpoint = Checkpoint::skip(next_position, Some(reason.to_string()));
        self.state.enter_recovery(&checkpoint).await?;
        self.host.force_restart(&config.redirect_target).await?;
        self.arm_verification(self.verification_delay(config), resume);
        Ok(())
    }

    async fn recover(
        &self,
        reason: &str,
        position: u32,
        config: &EngineConfig,
        resume: ResumeAction,
    ) -> EngineResult<()> {
        // Timers race against user-initiated pause/stop; by the time
        // one fires the run may no longer be live.
        if !self.state.is_running().await {
            return Ok(());
        }
        self.cancel_verification();

        let attempts = self.retry_count();
        if attempts >= config.max_retries {
            self.set_retry_count(0);
            self.set_skip_pending(true);
            self.stats
                .record_skip(OutcomeRecord::skipped(
                    format!("item-{position}"),
                    0.0,
                    config.max_retries,
                    reason,
                ))
                .await?;

            // The skip checkpoint always names the next unprocessed
            // item; resuming at the broken one would loop forever.
            let checkpoint = Checkpoint::skip(position + 1, Some(reason.to_string()));
            self.state.enter_recovery(&checkpoint).await?;
            self.host.force_restart(&config.redirect_target).await?;
            self.arm_verification(self.verification_delay(config), resume);
            return Ok(());
        }

        let next_attempt = attempts + 1;
        self.set_retry_count(next_attempt);
        self.stats.record_retry().await?;

        let checkpoint = Checkpoint::retry(position, next_attempt);
        self.state.enter_recovery(&checkpoint).await?;
        self.host.force_restart(&config.redirect_target).await?;
        self.arm_verification(self.verification_delay(config), resume);
        Ok(())
    }

    /// Verification delay for the restart in flight: a pending skip
    /// always gets the extended window, retries scale with the
    /// attempt ordinal.
    fn verification_delay(&self, config: &EngineConfig) -> u64 {
        if self.skip_pending() {
            config.extended_timeout_ms
        } else {
            config.verification_delay_ms(self.retry_count())
        }
    }

    /// Called when a checkpoint has been consumed on resume; clears
    /// the unverified-restart streak.
    pub fn mark_checkpoint_consumed(&self) {
        self.unverified_restarts.store(0, Ordering::SeqCst);
    }

    /// Restore recovery bookkeeping from a consumed checkpoint and
    /// return the iteration to resume at.
    pub fn apply(&self, checkpoint: &Checkpoint) -> u32 {
        match checkpoint.action {
            crate::checkpoint::RecoveryAction::Skip => {
                self.set_skip_pending(false);
                self.set_retry_count(0);
            }
            crate::checkpoint::RecoveryAction::Retry => {
                self.set_retry_count(checkpoint.retry_count);
            }
        }
        self.mark_checkpoint_consumed();
        checkpoint.iteration
    }

    /// Arm the recovery-verification timer. At most one is pending:
    /// arming always cancels the previous one. If the timer fires
    /// while the run is still Retrying with the checkpoint present,
    /// the restart never re-initialized the engine and the resume
    /// action force-resumes directly; when that keeps happening the
    /// run is declared unrecoverable.
    pub fn arm_verification(&self, delay_ms: u64, resume: ResumeAction) {
        self.cancel_verification();

        let state = self.state.clone();
        let store = Arc::clone(&self.store);
        let stats = self.stats.clone();
        let events = self.events.clone();
        let unverified = Arc::clone(&self.unverified_restarts);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if state.current().await != RunState::Retrying {
                return;
            }
            let checkpoint = match Checkpoint::load(&store).await {
                Ok(Some(checkpoint)) => checkpoint,
                _ => return,
            };

            let streak = unverified.fetch_add(1, Ordering::SeqCst) + 1;
            if streak >= MAX_UNVERIFIED_RESTARTS {
                // Unrecoverable: the restart mechanism itself keeps
                // failing. The checkpointed item dies terminally, so
                // it gets a failed record before the fatal surface.
                let reason = "forced restart repeatedly failed; checkpoint never consumed";
                let _ = stats
                    .record_fail(OutcomeRecord::failed(
                        format!("item-{}", checkpoint.iteration),
                        0.0,
                        checkpoint.retry_count,
                        reason,
                    ))
                    .await;
                let _ = Checkpoint::clear(&store).await;
                let summary = match stats.finalize().await {
                    Ok(summary) => summary,
                    Err(_) => stats.summary().await,
                };
                let _ = state.set_state(RunState::NotRunning).await;
                events.emit(EngineEventKind::RunFailed {
                    reason: reason.to_string(),
                    summary,
                });
                return;
            }

            resume().await;
        });

        let mut timer = self
            .verify_timer
            .lock()
            .expect("verification timer mutex poisoned");
        *timer = Some(handle);
    }

    pub fn cancel_verification(&self) {
        let mut timer = self
            .verify_timer
            .lock()
            .expect("verification timer mutex poisoned");
        if let Some(handle) = timer.take() {
            handle.abort();
        }
    }
}

impl Drop for RecoveryController {
    fn drop(&mut self) {
        self.cancel_verification();
    }
}
