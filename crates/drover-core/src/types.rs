use crate::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Position within a run. Mutated only by the orchestrator after an
/// item fully resolves (success or deliberate skip), never on a
/// transient failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
}

impl Progress {
    pub fn new(total: u32) -> Self {
        Self { current: 0, total }
    }

    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.current)
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }

    /// Advance to `next`, clamped to `total`. Progress only ever
    /// increases.
    pub fn advance_to(&mut self, next: u32) {
        let clamped = next.min(self.total);
        if clamped > self.current {
            self.current = clamped;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Skipped,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for OutcomeStatus {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "success" => Ok(Self::Success),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(EngineError::Runtime(format!(
                "unknown outcome status '{other}'"
            ))),
        }
    }
}

/// One fully-resolved work item. Append-only: exactly one record per
/// item that reached success, deliberate skip, or terminal failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    pub id: String,
    pub amount: f64,
    pub status: OutcomeStatus,
    pub timestamp: u64,
    pub processing_time_ms: u64,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OutcomeRecord {
    pub fn success(id: impl Into<String>, amount: f64, processing_time_ms: u64, retries: u32) -> Self {
        Self {
            id: id.into(),
            amount,
            status: OutcomeStatus::Success,
            timestamp: now_ms(),
            processing_time_ms,
            retries,
            reason: None,
        }
    }

    pub fn skipped(id: impl Into<String>, amount: f64, retries: u32, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            amount,
            status: OutcomeStatus::Skipped,
            timestamp: now_ms(),
            processing_time_ms: 0,
            retries,
            reason: Some(reason.into()),
        }
    }

    pub fn failed(id: impl Into<String>, amount: f64, retries: u32, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            amount,
            status: OutcomeStatus::Failed,
            timestamp: now_ms(),
            processing_time_ms: 0,
            retries,
            reason: Some(reason.into()),
        }
    }
}

/// Full per-run statistics, persisted after every aggregator update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Statistics {
    pub run_id: String,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub total_processed: u32,
    pub successful: u32,
    pub skipped: u32,
    pub failed: u32,
    pub retry_attempts: u32,
    pub total_processing_time_ms: u64,
    pub average_processing_time_ms: f64,
    pub records: Vec<OutcomeRecord>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            start_time: 0,
            end_time: None,
            total_processed: 0,
            successful: 0,
            skipped: 0,
            failed: 0,
            retry_attempts: 0,
            total_processing_time_ms: 0,
            average_processing_time_ms: 0.0,
            records: Vec::new(),
        }
    }
}

impl Statistics {
    pub fn new_run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            start_time: now_ms(),
            ..Self::default()
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_processed == 0 {
            return 0.0;
        }
        f64::from(self.successful) / f64::from(self.total_processed) * 100.0
    }

    pub fn summary(&self) -> StatisticsSummary {
        let end = self.end_time.unwrap_or_else(now_ms);
        StatisticsSummary {
            run_id: self.run_id.clone(),
            total_processed: self.total_processed,
            successful: self.successful,
            skipped: self.skipped,
            failed: self.failed,
            retry_attempts: self.retry_attempts,
            average_processing_time_ms: self.average_processing_time_ms,
            start_time: self.start_time,
            end_time: end,
            running_time_ms: if self.start_time > 0 {
                end.saturating_sub(self.start_time)
            } else {
                0
            },
        }
    }
}

/// Counter view of a run without per-item records, suitable for
/// notification payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSummary {
    pub run_id: String,
    pub total_processed: u32,
    pub successful: u32,
    pub skipped: u32,
    pub failed: u32,
    pub retry_attempts: u32,
    pub average_processing_time_ms: f64,
    pub start_time: u64,
    pub end_time: u64,
    pub running_time_ms: u64,
}
