//! Finalizer-driven reconciliation
//!
//! One pass loads a record, decides its life-cycle state and drives the
//! directory toward it:
//!
//! | state | condition | action |
//! |---|---|---|
//! | Active | no deletion requested | ensure marker, upsert, record status |
//! | Deleting | deletion requested, marker present | delete entry, then clear marker |
//! | Removed | record gone, or deletion requested without marker | nothing |
//!
//! The marker is cleared strictly after the directory delete succeeds, so a
//! pass interrupted at any point leaves a record that will be cleaned up by
//! the next pass.

use std::sync::Arc;

use chrono::Utc;
use dirsync_ldap::AccountDirectory;
use tracing::{debug, info, instrument, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::resource::{ManagedResource, ResourceKey, FINALIZER_NAME};
use crate::store::ResourceStore;

/// Life-cycle state of a record as seen by one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    Deleting,
    Removed,
}

impl LifecycleState {
    pub fn of<R: ManagedResource>(record: &R) -> Self {
        let meta = record.metadata();
        match (meta.deletion_requested(), meta.has_finalizer(FINALIZER_NAME)) {
            (false, _) => LifecycleState::Active,
            (true, true) => LifecycleState::Deleting,
            (true, false) => LifecycleState::Removed,
        }
    }
}

/// What a successful pass leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Directory entry matches the record.
    Done,
    /// Nothing left to manage for this identity.
    Removed,
}

/// Reconciles records of one kind against the directory.
pub struct Reconciler<R> {
    store: Arc<dyn ResourceStore<R>>,
    directory: Arc<dyn AccountDirectory>,
}

impl<R: ManagedResource> Reconciler<R> {
    pub fn new(store: Arc<dyn ResourceStore<R>>, directory: Arc<dyn AccountDirectory>) -> Self {
        Self { store, directory }
    }

    /// Run one pass for `key`.
    ///
    /// Callers must not run two passes for the same key concurrently;
    /// [`Controller`](crate::controller::Controller) guarantees this.
    #[instrument(skip(self, key), fields(kind = R::KIND, key = %key))]
    pub async fn reconcile(&self, key: &ResourceKey) -> ReconcileResult<ReconcileAction> {
        let record = self
            .store
            .get(key)
            .await
            .map_err(|source| ReconcileError::Store {
                key: key.clone(),
                source,
            })?;

        let Some(record) = record else {
            debug!("Record not found, nothing to do");
            return Ok(ReconcileAction::Removed);
        };

        match LifecycleState::of(&record) {
            LifecycleState::Active => self.apply(key, record).await,
            LifecycleState::Deleting => self.finalize(key, record).await,
            LifecycleState::Removed => {
                debug!("Deletion requested without finalizer, nothing to clean up");
                Ok(ReconcileAction::Removed)
            }
        }
    }

    async fn apply(&self, key: &ResourceKey, mut record: R) -> ReconcileResult<ReconcileAction> {
        if record.metadata_mut().add_finalizer(FINALIZER_NAME) {
            record = self
                .store
                .update(&record)
                .await
                .map_err(|source| ReconcileError::FinalizerPersistence {
                    key: key.clone(),
                    source,
                })?;
            info!(finalizer = FINALIZER_NAME, "Finalizer added");
        }

        let generation = record.metadata().generation;
        let result = record.apply(self.directory.as_ref()).await;

        let now = Utc::now();
        match &result {
            Ok(()) => record.status_mut().record_success(generation, now),
            Err(e) => record
                .status_mut()
                .record_failure(generation, e.to_string(), now),
        }
        let persisted = self.store.update(&record).await;

        match result {
            Ok(()) => {
                persisted.map_err(|source| ReconcileError::StatusPersistence {
                    key: key.clone(),
                    source,
                })?;
                info!(generation, "Directory entry in sync");
                Ok(ReconcileAction::Done)
            }
            Err(source) => {
                if let Err(e) = persisted {
                    warn!(error = %e, "Failed to record failed outcome");
                }
                Err(ReconcileError::Directory {
                    key: key.clone(),
                    source,
                })
            }
        }
    }

    async fn finalize(&self, key: &ResourceKey, mut record: R) -> ReconcileResult<ReconcileAction> {
        if let Err(source) = record.cleanup(self.directory.as_ref()).await {
            let generation = record.metadata().generation;
            record
                .status_mut()
                .record_failure(generation, source.to_string(), Utc::now());
            if let Err(e) = self.store.update(&record).await {
                warn!(error = %e, "Failed to record failed cleanup");
            }
            return Err(ReconcileError::Cleanup {
                key: key.clone(),
                source,
            });
        }

        record.metadata_mut().remove_finalizer(FINALIZER_NAME);
        self.store
            .update(&record)
            .await
            .map_err(|source| ReconcileError::FinalizerPersistence {
                key: key.clone(),
                source,
            })?;

        info!(finalizer = FINALIZER_NAME, "Directory entry removed, finalizer released");
        Ok(ReconcileAction::Removed)
    }
}
