use serde::{Deserialize, Serialize};

/// Run configuration, loaded once at run start and immutable for the
/// duration of the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Global inactivity threshold: no recorded activity for longer
    /// than this marks the run stalled.
    pub initial_timeout_ms: u64,
    /// Recovery-verification delay after the first retry restart.
    pub retry_timeout_ms: u64,
    /// Recovery-verification delay after later retries and skips.
    pub extended_timeout_ms: u64,
    pub max_retries: u32,
    pub heartbeat_interval_ms: u64,
    /// A sub-step whose amount reaches this value aborts the item as
    /// a deliberate skip.
    pub amount_limit: f64,
    pub total_items: u32,
    /// Where the host is sent when the engine forces a restart.
    pub redirect_target: String,
    /// Per-wait timeout for a single expected element.
    pub step_wait_ms: u64,
    /// Fixed delay between items so the target is not overwhelmed.
    pub inter_item_delay_ms: u64,
    /// Settle delay after opening an item before reading amounts.
    pub settle_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_timeout_ms: 30_000,
            retry_timeout_ms: 10_000,
            extended_timeout_ms: 20_000,
            max_retries: 3,
            heartbeat_interval_ms: 5_000,
            amount_limit: 500.0,
            total_items: 200,
            redirect_target: "queue/pending".to_string(),
            step_wait_ms: 10_000,
            inter_item_delay_ms: 350,
            settle_delay_ms: 1_500,
        }
    }
}

impl EngineConfig {
    /// Verification delay for a given retry ordinal: short on the
    /// first retry, extended afterwards.
    pub fn verification_delay_ms(&self, retry_count: u32) -> u64 {
        if retry_count <= 1 {
            self.retry_timeout_ms
        } else {
            self.extended_timeout_ms
        }
    }
}
