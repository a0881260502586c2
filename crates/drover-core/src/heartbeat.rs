use crate::state::StateMachine;
use crate::types::now_ms;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Invoked when the monitor detects a stall.
pub type StallAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Liveness watchdog for the run loop.
///
/// Every component doing a unit of visible work calls
/// `record_activity`; a repeating timer compares the last activity
/// timestamp against the stall threshold and fires the stall action
/// when the run has gone quiet. The timer exits on its own whenever
/// the run state leaves Running and must be started again on every
/// transition back in; it is not restart-safe by itself.
#[derive(Default)]
pub struct HeartbeatMonitor {
    last_activity_ms: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_activity(&self) -> u64 {
        let now = now_ms();
        self.last_activity_ms.store(now, Ordering::SeqCst);
        now
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::SeqCst)
    }

    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_activity_ms())
    }

    /// Start the repeating check. Any previously running timer is
    /// cancelled first, so at most one is ever live.
    pub fn start(
        &self,
        interval_ms: u64,
        stall_after_ms: u64,
        state: StateMachine,
        on_stall: StallAction,
    ) {
        self.stop();
        self.record_activity();

        let last_activity = Arc::clone(&self.last_activity_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !state.is_running().await {
                    break;
                }
                let idle = now_ms().saturating_sub(last_activity.load(Ordering::SeqCst));
                if idle > stall_after_ms {
                    // The stall handler redirects into recovery; it
                    // re-checks run state itself since the state may
                    // have changed since this tick was scheduled.
                    on_stall().await;
                    break;
                }
            }
        });

        let mut task = self.task.lock().expect("heartbeat task mutex poisoned");
        *task = Some(handle);
    }

    pub fn stop(&self) {
        let mut task = self.task.lock().expect("heartbeat task mutex poisoned");
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
