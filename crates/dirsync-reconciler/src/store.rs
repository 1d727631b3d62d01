//! Desired-state store interface
//!
//! The store and its watch transport live outside this crate; the reconciler
//! only needs point reads, listing for resync, and whole-record updates.

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::ResourceKey;

/// Errors reported by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record changed since it was read.
    #[error("Conflict updating {key}: {message}")]
    Conflict { key: ResourceKey, message: String },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Store error: {message}")]
    Other { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        StoreError::Other {
            message: message.into(),
        }
    }
}

/// Which records to list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSelector {
    /// Restrict to one namespace; `None` lists everything.
    pub namespace: Option<String>,
}

impl ListSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
        }
    }

    pub fn matches(&self, key: &ResourceKey) -> bool {
        match &self.namespace {
            Some(ns) => key.namespace.as_deref() == Some(ns.as_str()),
            None => true,
        }
    }
}

/// Access to desired-state records of one kind.
#[async_trait]
pub trait ResourceStore<R>: Send + Sync {
    /// Fetch a record; `Ok(None)` when it does not exist.
    async fn get(&self, key: &ResourceKey) -> Result<Option<R>, StoreError>;

    async fn list(&self, selector: &ListSelector) -> Result<Vec<R>, StoreError>;

    /// Write marker and status changes, returning the stored record.
    async fn update(&self, record: &R) -> Result<R, StoreError>;
}
