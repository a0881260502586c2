use crate::errors::{EngineError, EngineResult};
use drover_store::SharedStateStore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

/// Persisted key layout. Everything the engine needs to cold-resume
/// lives under these five keys.
pub mod keys {
    pub const RUN_STATE: &str = "runState";
    pub const CHECKPOINT: &str = "checkpoint";
    pub const PROGRESS: &str = "progress";
    pub const STATISTICS: &str = "statistics";
    pub const CONFIG: &str = "config";
}

pub async fn load<T: DeserializeOwned>(
    store: &SharedStateStore,
    key: &str,
) -> EngineResult<Option<T>> {
    let mut found = store.get(&[key]).await?;
    let Some(value) = found.remove(key) else {
        return Ok(None);
    };
    let decoded = serde_json::from_value(value).map_err(|err| {
        EngineError::Serialization(format!("failed decoding persisted '{key}': {err}"))
    })?;
    Ok(Some(decoded))
}

pub async fn save<T: Serialize>(store: &SharedStateStore, key: &str, value: &T) -> EngineResult<()> {
    let encoded = encode(key, value)?;
    store
        .set(BTreeMap::from([(key.to_string(), encoded)]))
        .await?;
    Ok(())
}

/// Write several keys in one atomic store call.
pub async fn save_all(
    store: &SharedStateStore,
    entries: BTreeMap<String, Value>,
) -> EngineResult<()> {
    store.set(entries).await?;
    Ok(())
}

pub async fn clear(store: &SharedStateStore, keys: &[&str]) -> EngineResult<()> {
    store.remove(keys).await?;
    Ok(())
}

pub fn encode<T: Serialize>(key: &str, value: &T) -> EngineResult<Value> {
    serde_json::to_value(value).map_err(|err| {
        EngineError::Serialization(format!("failed encoding persisted '{key}': {err}"))
    })
}
