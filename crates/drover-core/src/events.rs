use crate::state::RunState;
use crate::types::{Progress, StatisticsSummary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Host notification event. Emitted synchronously after the change it
/// reports has been persisted, so an observer reconnecting after a
/// restart always reads a state consistent with storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: EngineEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEventKind {
    StateChanged {
        state: RunState,
    },
    ProgressUpdate {
        progress: Progress,
        summary: StatisticsSummary,
    },
    StatisticsUpdate {
        summary: StatisticsSummary,
    },
    ProcessingComplete {
        summary: StatisticsSummary,
    },
    RunFailed {
        reason: String,
        summary: StatisticsSummary,
    },
}

pub trait EngineEventObserver: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EngineEventObserver for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event);
    }
}

pub type SharedEngineEventObserver = Arc<dyn EngineEventObserver>;
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

#[derive(Clone, Default)]
pub struct EventSink {
    observer: Option<SharedEngineEventObserver>,
    sender: Option<EngineEventSender>,
    sequence_no: Arc<AtomicU64>,
}

impl EventSink {
    pub fn with_observer(observer: SharedEngineEventObserver) -> Self {
        Self {
            observer: Some(observer),
            ..Self::default()
        }
    }

    pub fn with_sender(sender: EngineEventSender) -> Self {
        Self {
            sender: Some(sender),
            ..Self::default()
        }
    }

    pub fn observer(mut self, observer: SharedEngineEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: EngineEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, kind: EngineEventKind) {
        let event = EngineEvent {
            sequence_no: self.sequence_no.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: timestamp_now(),
            kind,
        };
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn engine_event_channel() -> (EngineEventSender, EngineEventReceiver) {
    mpsc::unbounded_channel()
}

pub(crate) fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn event_sink_observer_and_sender_expected_both_receive_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer_seen = Arc::clone(&seen);
        let observer: SharedEngineEventObserver = Arc::new(move |event: &EngineEvent| {
            observer_seen
                .lock()
                .expect("observer mutex should lock")
                .push(event.sequence_no);
        });
        let (tx, mut rx) = engine_event_channel();
        let sink = EventSink::with_observer(observer).sender(tx);

        sink.emit(EngineEventKind::StateChanged {
            state: RunState::Running,
        });
        sink.emit(EngineEventKind::StateChanged {
            state: RunState::Paused,
        });

        let first = rx.try_recv().expect("channel should receive first event");
        assert_eq!(first.sequence_no, 1);
        let second = rx.try_recv().expect("channel should receive second event");
        assert_eq!(second.sequence_no, 2);
        assert_eq!(
            seen.lock().expect("observer mutex should lock").as_slice(),
            &[1, 2]
        );
    }

    #[test]
    fn event_sink_default_expected_disabled() {
        let sink = EventSink::default();
        assert!(!sink.is_enabled());
        sink.emit(EngineEventKind::StateChanged {
            state: RunState::NotRunning,
        });
    }
}
