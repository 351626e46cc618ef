//! JSON file state store.

use async_trait::async_trait;
use chrono::Utc;
use stackrun_core::StateRecord;
use stackrun_core::state::STATE_VERSION;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::store::StateStore;
use crate::{StateError, StateResult};

/// Stores one stack's state as pretty-printed JSON in a single file.
///
/// Writes go to a temporary file next to the target that is then renamed
/// over it, so an interrupted save never leaves a truncated state file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/<stack>.state.json`.
    pub fn in_dir(dir: impl AsRef<Path>, stack: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{}.state.json", stack)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> StateResult<Option<StateRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self, stack: &str) -> StateResult<Option<StateRecord>> {
        let Some(record) = self.read().await? else {
            debug!(path = %self.path.display(), "No state file");
            return Ok(None);
        };

        if record.version > STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: record.version,
                supported: STATE_VERSION,
            });
        }
        if record.stack != stack {
            return Err(StateError::StackMismatch {
                expected: stack.to_string(),
                found: record.stack,
            });
        }

        debug!(path = %self.path.display(), serial = record.serial, units = record.units.len(), "Loaded state");
        Ok(Some(record))
    }

    async fn save(&self, record: &mut StateRecord) -> StateResult<()> {
        let stored = self.read().await?.map(|r| r.serial).unwrap_or(0);
        if stored != record.serial {
            return Err(StateError::Stale {
                stack: record.stack.clone(),
                expected: record.serial,
                found: stored,
            });
        }

        let mut next = record.clone();
        next.version = STATE_VERSION;
        next.serial += 1;
        next.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(&next)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(path = %self.path.display(), serial = next.serial, "Saved state");
        *record = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackrun_core::{Direction, Results, UnitId, UnitResult, UnitState, Value};

    fn results_with_db() -> Results {
        let mut results = Results::new(Direction::Apply);
        let mut db = UnitResult::new("aws_db_instance", UnitState::Ready);
        db.outputs
            .insert("endpoint".to_string(), Value::from("db.internal"));
        results.units.insert(UnitId::new("db").unwrap(), db);
        results
    }

    #[tokio::test]
    async fn test_missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), "lightwave");

        assert!(store.load("lightwave").await.unwrap().is_none());
        let record = store.load_or_new("lightwave").await.unwrap();
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path().join(".stackrun"), "lightwave");

        let mut record = store.load_or_new("lightwave").await.unwrap();
        record.merge(&results_with_db());
        store.save(&mut record).await.unwrap();
        assert_eq!(record.serial, 1);
        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());

        let loaded = store.load("lightwave").await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(
            loaded.get("db").unwrap().outputs["endpoint"],
            Value::from("db.internal")
        );

        let mut loaded = loaded;
        store.save(&mut loaded).await.unwrap();
        assert_eq!(loaded.serial, 2);
    }

    #[tokio::test]
    async fn test_stale_save_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path(), "lightwave");

        let mut first = store.load_or_new("lightwave").await.unwrap();
        let mut second = first.clone();
        store.save(&mut first).await.unwrap();

        let err = store.save(&mut second).await.unwrap_err();
        assert!(matches!(err, StateError::Stale { found: 1, .. }));
    }

    #[tokio::test]
    async fn test_stack_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        let mut record = StateRecord::new("lightwave");
        store.save(&mut record).await.unwrap();

        let err = store.load("other").await.unwrap_err();
        assert!(matches!(err, StateError::StackMismatch { .. }));
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut record = StateRecord::new("lightwave");
        record.version = STATE_VERSION + 1;
        tokio::fs::write(&path, serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();

        let err = JsonFileStore::new(&path).load("lightwave").await.unwrap_err();
        assert!(matches!(err, StateError::UnsupportedVersion { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let err = JsonFileStore::new(&path).load("lightwave").await.unwrap_err();
        assert!(matches!(err, StateError::Serialization(_)));
    }
}
