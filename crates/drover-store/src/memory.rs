use crate::store::{StateStore, StoreError, StoreResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub(crate) struct MemoryState {
    pub entries: BTreeMap<String, Value>,
}

/// In-memory store backing tests and the file-backed store.
///
/// One mutex over the whole map gives the per-call atomicity the
/// `StateStore` contract requires.
#[derive(Clone, Debug, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: MemoryState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn snapshot(&self) -> MemoryState {
        self.inner
            .lock()
            .expect("memory state store mutex poisoned")
            .clone()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory state store mutex poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, keys: &[&str]) -> StoreResult<BTreeMap<String, Value>> {
        let state = self.lock()?;
        let mut found = BTreeMap::new();
        for key in keys {
            if let Some(value) = state.entries.get(*key) {
                found.insert((*key).to_string(), value.clone());
            }
        }
        Ok(found)
    }

    async fn set(&self, entries: BTreeMap<String, Value>) -> StoreResult<()> {
        let mut state = self.lock()?;
        for (key, value) in entries {
            state.entries.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> StoreResult<()> {
        let mut state = self.lock()?;
        for key in keys {
            state.entries.remove(*key);
        }
        Ok(())
    }
}
