use crate::memory::{MemoryState, MemoryStateStore};
use crate::store::{StateStore, StoreError, StoreResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE_NAME: &str = "drover-state.json";

/// File-backed store: an in-memory store whose full snapshot is
/// rewritten to a single JSON file after every mutation. The
/// temp-then-rename write keeps a crashed writer from leaving a
/// half-written snapshot behind.
#[derive(Clone, Debug)]
pub struct FsStateStore {
    state_file: PathBuf,
    inner: MemoryStateStore,
}

impl FsStateStore {
    pub fn new<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        fs::create_dir_all(root.as_ref())
            .map_err(|err| StoreError::Backend(format!("create fs store root failed: {err}")))?;
        let state_file = root.as_ref().join(STATE_FILE_NAME);
        let state = if state_file.exists() {
            let raw = fs::read(&state_file)
                .map_err(|err| StoreError::Backend(format!("read state file failed: {err}")))?;
            serde_json::from_slice::<MemoryState>(&raw)
                .map_err(|err| StoreError::Serialization(err.to_string()))?
        } else {
            MemoryState::default()
        };

        Ok(Self {
            state_file,
            inner: MemoryStateStore::from_state(state),
        })
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    fn persist(&self) -> StoreResult<()> {
        let snapshot = self.inner.snapshot();
        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let tmp = self.state_file.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .map_err(|err| StoreError::Backend(format!("write state file failed: {err}")))?;
        fs::rename(&tmp, &self.state_file)
            .map_err(|err| StoreError::Backend(format!("rename state file failed: {err}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for FsStateStore {
    async fn get(&self, keys: &[&str]) -> StoreResult<BTreeMap<String, Value>> {
        self.inner.get(keys).await
    }

    async fn set(&self, entries: BTreeMap<String, Value>) -> StoreResult<()> {
        self.inner.set(entries).await?;
        self.persist()
    }

    async fn remove(&self, keys: &[&str]) -> StoreResult<()> {
        self.inner.remove(keys).await?;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(flavor = "current_thread")]
    async fn fs_store_reopen_restores_previous_entries() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let store = FsStateStore::new(tmp.path()).expect("fs store should initialize");

        store
            .set(BTreeMap::from([
                ("runState".to_string(), json!("retrying")),
                (
                    "checkpoint".to_string(),
                    json!({"action": "skip", "iteration": 4, "retryCount": 0}),
                ),
            ]))
            .await
            .expect("set should succeed");
        drop(store);

        let reopened = FsStateStore::new(tmp.path()).expect("fs store should reopen");
        let found = reopened
            .get(&["runState", "checkpoint"])
            .await
            .expect("get should succeed");

        assert_eq!(found.get("runState"), Some(&json!("retrying")));
        assert_eq!(
            found
                .get("checkpoint")
                .and_then(|value| value.get("iteration")),
            Some(&json!(4))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fs_store_remove_persists_across_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let store = FsStateStore::new(tmp.path()).expect("fs store should initialize");

        store
            .set(BTreeMap::from([(
                "checkpoint".to_string(),
                json!({"action": "retry"}),
            )]))
            .await
            .expect("set should succeed");
        store
            .remove(&["checkpoint"])
            .await
            .expect("remove should succeed");
        drop(store);

        let reopened = FsStateStore::new(tmp.path()).expect("fs store should reopen");
        let found = reopened
            .get(&["checkpoint"])
            .await
            .expect("get should succeed");
        assert!(found.is_empty());
    }
}
