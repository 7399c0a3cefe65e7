//! Snapshot / commit / rollback around every mutation of a job
//!
//! The durable record and the in-memory object never stay apart: a mutation
//! is either persisted or undone by rebuilding the object from the last
//! committed snapshot.

use crate::application::codec::StateCodec;
use crate::domain::collaborators::StatusStore;
use crate::domain::generation::BuildId;
use crate::CoreError;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Object whose whole state can be captured and rebuilt
pub trait Transactional {
    /// Deterministic serialized form of the current state
    fn serialize_state(&self) -> Result<Vec<u8>, CoreError>;

    /// Replace the current state with a serialized one
    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), CoreError>;
}

/// Outcome of a successful commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The state changed and was persisted
    Persisted,
    /// Nothing changed, nothing was written
    Unchanged,
}

/// Runs mutations of one job under the snapshot/commit/rollback discipline
pub struct TransactionalCommitLoop {
    build_id: BuildId,
    store: Arc<dyn StatusStore>,
    codec: StateCodec,
    snapshot: Option<Vec<u8>>,
    need_sync_status: bool,
}

impl std::fmt::Debug for TransactionalCommitLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalCommitLoop")
            .field("build_id", &self.build_id)
            .field("snapshot_bytes", &self.snapshot.as_ref().map(|s| s.len()))
            .field("need_sync_status", &self.need_sync_status)
            .finish()
    }
}

impl TransactionalCommitLoop {
    /// Create a loop writing to `store`
    pub fn new(build_id: BuildId, store: Arc<dyn StatusStore>, codec: StateCodec) -> Self {
        Self {
            build_id,
            store,
            codec,
            snapshot: None,
            need_sync_status: false,
        }
    }

    /// Whether the last known good state still has to be written
    pub fn need_sync_status(&self) -> bool {
        self.need_sync_status
    }

    /// Force a re-write of the last known good state on the next tick
    pub fn mark_need_sync(&mut self) {
        self.need_sync_status = true;
    }

    /// Cached serialized state, taken if not present yet
    pub fn snapshot<S: Transactional>(&mut self, target: &S) -> Result<&[u8], CoreError> {
        if self.snapshot.is_none() {
            self.snapshot = Some(target.serialize_state()?);
        }
        Ok(self.snapshot.as_deref().unwrap_or_default())
    }

    /// Persist the target if it differs from the snapshot, rolling back on failure
    pub async fn commit<S: Transactional + Send>(
        &mut self,
        target: &mut S,
    ) -> Result<CommitOutcome, CoreError> {
        let current = target.serialize_state()?;
        if self.snapshot.as_deref() == Some(current.as_slice()) {
            return Ok(CommitOutcome::Unchanged);
        }

        let encoded = self.codec.encode(&current)?;
        match self.store.write(&self.build_id, encoded).await {
            Ok(()) => {
                debug!(build_id = %self.build_id, bytes = current.len(), "Committed status");
                self.snapshot = Some(current);
                self.need_sync_status = false;
                Ok(CommitOutcome::Persisted)
            }
            Err(e) => {
                warn!(build_id = %self.build_id, error = %e, "Persist failed, rolling back");
                // set before the rollback so a failed rollback still re-syncs
                self.need_sync_status = true;
                self.rollback(target)?;
                Err(CoreError::PersistError(e.to_string()))
            }
        }
    }

    /// Rebuild the target from the snapshot
    pub fn rollback<S: Transactional>(&mut self, target: &mut S) -> Result<(), CoreError> {
        match &self.snapshot {
            Some(snapshot) => target.restore_state(snapshot).map_err(|e| {
                error!(build_id = %self.build_id, error = %e, "Rollback failed");
                e
            }),
            None => Err(CoreError::Other(format!(
                "no snapshot to roll back job {} to",
                self.build_id
            ))),
        }
    }

    /// Write the last known good state again after an earlier persist failure
    pub async fn retry_sync(&mut self) -> Result<(), CoreError> {
        let Some(snapshot) = &self.snapshot else {
            self.need_sync_status = false;
            return Ok(());
        };
        let encoded = self.codec.encode(snapshot)?;
        self.store
            .write(&self.build_id, encoded)
            .await
            .map_err(|e| CoreError::PersistError(e.to_string()))?;
        self.need_sync_status = false;
        info!(build_id = %self.build_id, "Re-synchronized status after earlier persist failure");
        Ok(())
    }

    /// Run `mutation` as one transaction
    ///
    /// A failing mutation is undone and its error returned. A successful one
    /// is committed; if the commit fails the mutation is undone as well.
    pub async fn transact<S, T, F>(
        &mut self,
        target: &mut S,
        name: &str,
        mutation: F,
    ) -> Result<T, CoreError>
    where
        S: Transactional + Send,
        T: Send,
        F: for<'m> FnOnce(&'m mut S) -> BoxFuture<'m, Result<T, CoreError>>,
    {
        self.snapshot(target)?;

        let value = match mutation(&mut *target).await {
            Ok(value) => value,
            Err(e) => {
                debug!(build_id = %self.build_id, command = name, error = %e, "Command failed, rolling back");
                self.rollback(target)?;
                return Err(e);
            }
        };

        let outcome = self.commit(target).await?;
        debug!(build_id = %self.build_id, command = name, outcome = ?outcome, "Command committed");
        Ok(value)
    }
}
