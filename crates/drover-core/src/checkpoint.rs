use crate::errors::EngineResult;
use crate::persist::{self, keys};
use drover_store::SharedStateStore;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Resume at `iteration`, which is always the *next* unprocessed
    /// item. Prevents an infinite retry loop on a permanently broken
    /// item once the retry budget is spent.
    Skip,
    /// Resume at `iteration`, the failed item itself, carrying the
    /// retry count across the restart.
    Retry,
}

/// Recovery target: the durable record of where and why a forced
/// restart occurred. At most one exists at a time, its presence
/// implies `RunState::Retrying`, and it is consumed exactly once on
/// cold-start resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub action: RecoveryAction,
    pub iteration: u32,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Checkpoint {
    pub fn retry(iteration: u32, retry_count: u32) -> Self {
        Self {
            action: RecoveryAction::Retry,
            iteration,
            retry_count,
            reason: None,
        }
    }

    pub fn skip(next_iteration: u32, reason: Option<String>) -> Self {
        Self {
            action: RecoveryAction::Skip,
            iteration: next_iteration,
            retry_count: 0,
            reason,
        }
    }

    pub async fn load(store: &SharedStateStore) -> EngineResult<Option<Self>> {
        persist::load(store, keys::CHECKPOINT).await
    }

    /// Load and delete in one pass: the consume half of the
    /// consumed-exactly-once contract. A second call finds nothing.
    pub async fn take(store: &SharedStateStore) -> EngineResult<Option<Self>> {
        let found = Self::load(store).await?;
        if found.is_some() {
            persist::clear(store, &[keys::CHECKPOINT]).await?;
        }
        Ok(found)
    }

    pub async fn clear(store: &SharedStateStore) -> EngineResult<()> {
        persist::clear(store, &[keys::CHECKPOINT]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_store::MemoryStateStore;
    use std::sync::Arc;

    #[tokio::test(flavor = "current_thread")]
    async fn checkpoint_take_expected_consumed_exactly_once() {
        let store: SharedStateStore = Arc::new(MemoryStateStore::new());
        let checkpoint = Checkpoint::retry(5, 1);
        persist::save(&store, keys::CHECKPOINT, &checkpoint)
            .await
            .expect("save should succeed");

        let first = Checkpoint::take(&store).await.expect("take should succeed");
        assert_eq!(first, Some(checkpoint));

        let second = Checkpoint::take(&store).await.expect("take should succeed");
        assert_eq!(second, None);
    }

    #[test]
    fn checkpoint_roundtrip_expected_camel_case_fields() {
        let checkpoint = Checkpoint::skip(4, Some("amount over limit".to_string()));
        let value = serde_json::to_value(&checkpoint).expect("checkpoint should serialize");

        assert_eq!(value.get("action"), Some(&serde_json::json!("skip")));
        assert_eq!(value.get("retryCount"), Some(&serde_json::json!(0)));

        let decoded: Checkpoint =
            serde_json::from_value(value).expect("checkpoint should deserialize");
        assert_eq!(decoded, checkpoint);
    }
}
