//! Desired-state records
//!
//! Records as carried by the store: metadata, the account spec, and the
//! observed state written back after each pass.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dirsync_connector::error::DirectoryResult;
use dirsync_ldap::{AccountDirectory, GroupSpec, UserSpec};
use serde::{Deserialize, Serialize};

/// Marker guarding directory cleanup before a record may disappear.
pub const FINALIZER_NAME: &str = "ldap.digitalis.io/finalizer";

/// Identity of a record in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Record metadata maintained by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Advances on every spec change.
    #[serde(default)]
    pub generation: i64,
    /// Set once deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            generation: 1,
            ..Self::default()
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn deletion_requested(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns `true` if the marker was not present yet.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns `true` if the marker was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }
}

/// Result of the latest pass over a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub observed_generation: i64,
    pub at: DateTime<Utc>,
}

/// Observed state written back by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    /// First successful apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<DateTime<Utc>>,
    /// Latest successful apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_on: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<ReconcileOutcome>,
}

impl AccountStatus {
    pub fn record_success(&mut self, generation: i64, at: DateTime<Utc>) {
        self.created_on.get_or_insert(at);
        self.updated_on = Some(at);
        self.last_outcome = Some(ReconcileOutcome {
            succeeded: true,
            message: None,
            observed_generation: generation,
            at,
        });
    }

    pub fn record_failure(&mut self, generation: i64, message: String, at: DateTime<Utc>) {
        self.last_outcome = Some(ReconcileOutcome {
            succeeded: false,
            message: Some(message),
            observed_generation: generation,
            at,
        });
    }
}

/// A record whose directory counterpart the reconciler manages.
#[async_trait]
pub trait ManagedResource: Clone + Send + Sync + 'static {
    /// Record kind, used in logs.
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn status(&self) -> &AccountStatus;

    fn status_mut(&mut self) -> &mut AccountStatus;

    /// Create or replace the directory entry.
    async fn apply(&self, directory: &dyn AccountDirectory) -> DirectoryResult<()>;

    /// Remove the directory entry.
    async fn cleanup(&self, directory: &dyn AccountDirectory) -> DirectoryResult<()>;
}

/// Declared POSIX user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdapUser {
    pub metadata: ObjectMeta,
    pub spec: UserSpec,
    #[serde(default)]
    pub status: AccountStatus,
}

impl LdapUser {
    pub fn new(metadata: ObjectMeta, spec: UserSpec) -> Self {
        Self {
            metadata,
            spec,
            status: AccountStatus::default(),
        }
    }
}

/// Declared POSIX group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdapGroup {
    pub metadata: ObjectMeta,
    pub spec: GroupSpec,
    #[serde(default)]
    pub status: AccountStatus,
}

impl LdapGroup {
    pub fn new(metadata: ObjectMeta, spec: GroupSpec) -> Self {
        Self {
            metadata,
            spec,
            status: AccountStatus::default(),
        }
    }
}

#[async_trait]
impl ManagedResource for LdapUser {
    const KIND: &'static str = "LdapUser";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &AccountStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut AccountStatus {
        &mut self.status
    }

    async fn apply(&self, directory: &dyn AccountDirectory) -> DirectoryResult<()> {
        directory.upsert_user(&self.spec).await
    }

    async fn cleanup(&self, directory: &dyn AccountDirectory) -> DirectoryResult<()> {
        directory.delete_user(&self.spec).await
    }
}

#[async_trait]
impl ManagedResource for LdapGroup {
    const KIND: &'static str = "LdapGroup";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &AccountStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut AccountStatus {
        &mut self.status
    }

    async fn apply(&self, directory: &dyn AccountDirectory) -> DirectoryResult<()> {
        directory.upsert_group(&self.spec).await
    }

    async fn cleanup(&self, directory: &dyn AccountDirectory) -> DirectoryResult<()> {
        directory.delete_group(&self.spec).await
    }
}
