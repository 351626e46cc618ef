//! State store trait and implementations.

pub mod file;
pub mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use stackrun_core::StateRecord;

use crate::StateResult;

/// Storage for stack state.
///
/// Callers are expected to be the only writer of a stack's state while a run
/// is in progress; the serial check only catches stale saves.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state of a stack, if any was saved.
    async fn load(&self, stack: &str) -> StateResult<Option<StateRecord>>;

    /// Persist `record`, bumping its serial and timestamp.
    ///
    /// Fails with [`StateError::Stale`](crate::StateError::Stale) when the
    /// stored serial differs from the one `record` was loaded with.
    async fn save(&self, record: &mut StateRecord) -> StateResult<()>;

    /// Load the state of a stack, or start an empty one.
    async fn load_or_new(&self, stack: &str) -> StateResult<StateRecord> {
        Ok(self
            .load(stack)
            .await?
            .unwrap_or_else(|| StateRecord::new(stack)))
    }
}
