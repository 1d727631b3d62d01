//! Reconcile error types
//!
//! Every failure is scoped to one pass over one record.

use std::time::Duration;

use dirsync_connector::error::DirectoryError;
use thiserror::Error;

use crate::resource::ResourceKey;
use crate::store::StoreError;

/// Errors from a single reconcile pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Fetching the record failed. Never treated as "not found".
    #[error("Failed to fetch {key}: {source}")]
    Store {
        key: ResourceKey,
        #[source]
        source: StoreError,
    },

    /// Adding or removing the finalizer marker could not be persisted.
    #[error("Failed to persist finalizer on {key}: {source}")]
    FinalizerPersistence {
        key: ResourceKey,
        #[source]
        source: StoreError,
    },

    #[error("Failed to persist status of {key}: {source}")]
    StatusPersistence {
        key: ResourceKey,
        #[source]
        source: StoreError,
    },

    /// Directory upsert failed.
    #[error("Directory update for {key} failed: {source}")]
    Directory {
        key: ResourceKey,
        #[source]
        source: DirectoryError,
    },

    /// Directory delete failed while deletion was requested; the marker stays.
    #[error("Directory cleanup for {key} failed: {source}")]
    Cleanup {
        key: ResourceKey,
        #[source]
        source: DirectoryError,
    },

    #[error("Reconcile of {key} exceeded {}s", .timeout.as_secs())]
    DeadlineExceeded { key: ResourceKey, timeout: Duration },
}

impl ReconcileError {
    /// Whether the pass should be re-delivered with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Directory { source, .. } => source.is_transient(),
            ReconcileError::Store { .. }
            | ReconcileError::FinalizerPersistence { .. }
            | ReconcileError::StatusPersistence { .. }
            | ReconcileError::Cleanup { .. }
            | ReconcileError::DeadlineExceeded { .. } => true,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        match self {
            ReconcileError::Store { key, .. }
            | ReconcileError::FinalizerPersistence { key, .. }
            | ReconcileError::StatusPersistence { key, .. }
            | ReconcileError::Directory { key, .. }
            | ReconcileError::Cleanup { key, .. }
            | ReconcileError::DeadlineExceeded { key, .. } => key,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ReconcileError::Store { .. } => "STORE_FETCH_FAILED",
            ReconcileError::FinalizerPersistence { .. } => "FINALIZER_PERSIST_FAILED",
            ReconcileError::StatusPersistence { .. } => "STATUS_PERSIST_FAILED",
            ReconcileError::Directory { source, .. } => source.error_code(),
            ReconcileError::Cleanup { .. } => "CLEANUP_FAILED",
            ReconcileError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
        }
    }
}

/// Result type for reconcile passes.
pub type ReconcileResult<T> = Result<T, ReconcileError>;
