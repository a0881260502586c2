use crate::checkpoint::Checkpoint;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EngineEventKind, EventSink};
use crate::persist::{self, keys};
use drover_store::SharedStateStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The authoritative run state, persisted and externally observable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    NotRunning,
    Running,
    Paused,
    Retrying,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRunning => "notRunning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Retrying => "retrying",
        }
    }
}

impl TryFrom<&str> for RunState {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "notRunning" => Ok(Self::NotRunning),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "retrying" => Ok(Self::Retrying),
            other => Err(EngineError::Runtime(format!("unknown run state '{other}'"))),
        }
    }
}

/// Cheaply cloneable handle over the run state machine.
///
/// Every transition persists the new state before synchronously
/// notifying subscribers, so an observer reconnecting after a restart
/// reads a state consistent with storage. Setting the current state
/// again is a no-op: no write, no notification.
#[derive(Clone)]
pub struct StateMachine {
    store: SharedStateStore,
    events: EventSink,
    inner: Arc<Mutex<RunState>>,
}

impl StateMachine {
    pub fn new(store: SharedStateStore, events: EventSink) -> Self {
        Self {
            store,
            events,
            inner: Arc::new(Mutex::new(RunState::NotRunning)),
        }
    }

    pub async fn current(&self) -> RunState {
        *self.inner.lock().await
    }

    pub async fn is_running(&self) -> bool {
        self.current().await == RunState::Running
    }

    /// Replace the in-memory state from storage on cold start without
    /// persisting or notifying.
    pub async fn hydrate(&self) -> EngineResult<RunState> {
        let stored: Option<RunState> = persist::load(&self.store, keys::RUN_STATE).await?;
        let state = stored.unwrap_or(RunState::NotRunning);
        *self.inner.lock().await = state;
        Ok(state)
    }

    /// Returns true when a transition actually happened.
    pub async fn set_state(&self, new_state: RunState) -> EngineResult<bool> {
        let mut current = self.inner.lock().await;
        if *current == new_state {
            return Ok(false);
        }
        persist::save(&self.store, keys::RUN_STATE, &new_state).await?;
        *current = new_state;
        drop(current);
        self.events
            .emit(EngineEventKind::StateChanged { state: new_state });
        Ok(true)
    }

    pub async fn start(&self) -> EngineResult<()> {
        self.require(RunState::NotRunning, "start").await?;
        self.set_state(RunState::Running).await?;
        Ok(())
    }

    pub async fn pause(&self) -> EngineResult<()> {
        self.require(RunState::Running, "pause").await?;
        self.set_state(RunState::Paused).await?;
        Ok(())
    }

    pub async fn resume(&self) -> EngineResult<()> {
        self.require(RunState::Paused, "resume").await?;
        self.set_state(RunState::Running).await?;
        Ok(())
    }

    pub async fn stop(&self) -> EngineResult<()> {
        self.set_state(RunState::NotRunning).await?;
        Ok(())
    }

    /// Running -> Retrying, persisting the new state and the
    /// checkpoint in a single atomic store write so the "checkpoint
    /// present implies Retrying" invariant can never be observed
    /// half-applied.
    pub async fn enter_recovery(&self, checkpoint: &Checkpoint) -> EngineResult<()> {
        let mut current = self.inner.lock().await;
        if *current != RunState::Running {
            return Err(EngineError::InvalidTransition(format!(
                "enter_recovery requires running, found {}",
                current.as_str()
            )));
        }
        persist::save_all(
            &self.store,
            BTreeMap::from([
                (
                    keys::RUN_STATE.to_string(),
                    persist::encode(keys::RUN_STATE, &RunState::Retrying)?,
                ),
                (
                    keys::CHECKPOINT.to_string(),
                    persist::encode(keys::CHECKPOINT, checkpoint)?,
                ),
            ]),
        )
        .await?;
        *current = RunState::Retrying;
        drop(current);
        self.events.emit(EngineEventKind::StateChanged {
            state: RunState::Retrying,
        });
        Ok(())
    }

    /// Retrying -> Running, valid only once the checkpoint has been
    /// consumed by the caller.
    pub async fn exit_recovery(&self) -> EngineResult<()> {
        self.require(RunState::Retrying, "exit_recovery").await?;
        self.set_state(RunState::Running).await?;
        Ok(())
    }

    async fn require(&self, expected: RunState, operation: &str) -> EngineResult<()> {
        let current = self.current().await;
        if current != expected {
            return Err(EngineError::InvalidTransition(format!(
                "{operation} requires {}, found {}",
                expected.as_str(),
                current.as_str()
            )));
        }
        Ok(())
    }
}
