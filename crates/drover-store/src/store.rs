use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Narrow persistence interface consumed by the engine.
///
/// Each call is atomic over the full key set it names: a reader never
/// observes a partially applied `set` or `remove`. Values are plain
/// JSON (numbers, strings, nested records), so everything written
/// here round-trips through serialize/deserialize without loss.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, keys: &[&str]) -> StoreResult<BTreeMap<String, Value>>;

    async fn set(&self, entries: BTreeMap<String, Value>) -> StoreResult<()>;

    async fn remove(&self, keys: &[&str]) -> StoreResult<()>;
}

pub type SharedStateStore = Arc<dyn StateStore>;
