use crate::errors::EngineResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Abstract anchors in the target interface. The engine scripts its
/// workflow against these; what they bind to (DOM selectors, API
/// calls) is the executor's concern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Selector {
    /// Entry point listing pending work.
    QueueTab,
    /// One actionable button per pending item.
    ItemButtons,
    /// Tag describing the opened item's suggested handling.
    DetailTag,
    /// List of sub-steps the opened item splits into; its `count` is
    /// the discovered sub-step total.
    SubStepList,
    /// Text carrying the monetary amount of the current sub-step.
    AmountField,
    /// Commits the current sub-step.
    ConfirmButton,
    /// Finalizes the committed sub-step.
    FinalizeButton,
    /// Fallback fill control when the primary channel leaves a
    /// remainder.
    CreditFill,
    /// Text showing the amount still uncovered after finalize.
    RemainderField,
    /// Banner the target raises when an operation was rejected.
    FailureBanner,
}

/// Handle to a located element: enough of the element's observable
/// surface (text, child count) for the engine to make decisions,
/// never an opaque live reference.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementHandle {
    pub selector: Selector,
    pub text: String,
    pub count: usize,
}

impl ElementHandle {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            text: String::new(),
            count: 1,
        }
    }

    pub fn with_text(selector: Selector, text: impl Into<String>) -> Self {
        Self {
            selector,
            text: text.into(),
            count: 1,
        }
    }
}

/// Result of a bounded wait. Returned, never thrown: the caller makes
/// the policy decision about a timeout.
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    Found(ElementHandle),
    TimedOut,
}

impl WaitOutcome {
    pub fn found(self) -> Option<ElementHandle> {
        match self {
            Self::Found(handle) => Some(handle),
            Self::TimedOut => None,
        }
    }
}

/// Performs one workflow step against the target and reports the
/// outcome. The engine never assumes success; every call result is
/// checked.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn locate(&self, selector: Selector) -> Option<ElementHandle>;

    async fn invoke(&self, handle: &ElementHandle) -> bool;

    /// Wait until `selector` exists (or stops existing) within
    /// `timeout_ms`. Implementations must return promptly once an
    /// external cancellation (pause/stop) is observed; the engine
    /// re-checks run state immediately upon resumption either way.
    async fn wait_for(&self, selector: Selector, exists: bool, timeout_ms: u64) -> WaitOutcome;
}

pub type SharedActionExecutor = Arc<dyn ActionExecutor>;

/// Requests a full host re-initialization toward `target`. The engine
/// uses this as its recovery primitive: checkpoint, then ask the host
/// to restart; on the next cold start the checkpoint is consumed.
#[async_trait]
pub trait RestartHost: Send + Sync {
    async fn force_restart(&self, target: &str) -> EngineResult<()>;
}

pub type SharedRestartHost = Arc<dyn RestartHost>;

/// Executor whose target always cooperates. Useful as a default and
/// in tests that exercise everything but the target.
#[derive(Debug, Default)]
pub struct NoopActionExecutor;

#[async_trait]
impl ActionExecutor for NoopActionExecutor {
    async fn locate(&self, selector: Selector) -> Option<ElementHandle> {
        Some(ElementHandle::new(selector))
    }

    async fn invoke(&self, _handle: &ElementHandle) -> bool {
        true
    }

    async fn wait_for(&self, selector: Selector, exists: bool, _timeout_ms: u64) -> WaitOutcome {
        if exists {
            WaitOutcome::Found(ElementHandle::new(selector))
        } else {
            WaitOutcome::TimedOut
        }
    }
}

#[async_trait]
impl RestartHost for NoopActionExecutor {
    async fn force_restart(&self, _target: &str) -> EngineResult<()> {
        Ok(())
    }
}
