//! In-memory state store.

use async_trait::async_trait;
use chrono::Utc;
use stackrun_core::StateRecord;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::store::StateStore;
use crate::{StateError, StateResult};

/// State kept in process memory, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, StateRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, stack: &str) -> StateResult<Option<StateRecord>> {
        Ok(self.records.read().await.get(stack).cloned())
    }

    async fn save(&self, record: &mut StateRecord) -> StateResult<()> {
        let mut records = self.records.write().await;
        let stored = records.get(&record.stack).map(|r| r.serial).unwrap_or(0);
        if stored != record.serial {
            return Err(StateError::Stale {
                stack: record.stack.clone(),
                expected: record.serial,
                found: stored,
            });
        }

        record.serial += 1;
        record.updated_at = Utc::now();
        records.insert(record.stack.clone(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = MemoryStore::new();
        assert!(store.load("lightwave").await.unwrap().is_none());

        let mut record = store.load_or_new("lightwave").await.unwrap();
        assert_eq!(record.serial, 0);
        store.save(&mut record).await.unwrap();
        assert_eq!(record.serial, 1);

        let loaded = store.load("lightwave").await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_stale_save_rejected() {
        let store = MemoryStore::new();
        let mut first = StateRecord::new("lightwave");
        let mut second = StateRecord::new("lightwave");

        store.save(&mut first).await.unwrap();
        let err = store.save(&mut second).await.unwrap_err();
        assert!(matches!(
            err,
            StateError::Stale {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }
}
