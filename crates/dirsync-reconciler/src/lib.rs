//! # Directory Account Reconciler
//!
//! Keeps POSIX users and groups in an LDAP directory in sync with declared
//! records, using a finalizer marker so a record never disappears before its
//! directory entry is cleaned up.
//!
//! ## Crate Organization
//!
//! - [`resource`] - Record types, metadata and observed status
//! - [`store`] - Interface to the desired-state store
//! - [`reconciler`] - Per-record finalizer state machine
//! - [`filter`] - Change notifications and generation filtering
//! - [`controller`] - Concurrent dispatch with deadlines and backoff
//! - [`error`] - Reconcile error types
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dirsync_ldap::{DirectoryClient, LdapConfig};
//! use dirsync_reconciler::{Controller, ControllerConfig, LdapUser};
//!
//! let directory = Arc::new(DirectoryClient::connect_with(LdapConfig::from_env()?)?);
//! let controller: Controller<LdapUser> =
//!     Controller::new(store, directory, ControllerConfig::default());
//!
//! let (tx, rx) = tokio::sync::mpsc::channel(256);
//! controller.resync(&tx).await?;
//! controller.run(rx).await;
//! ```

pub mod controller;
pub mod error;
pub mod filter;
pub mod reconciler;
pub mod resource;
pub mod store;

pub use controller::{Controller, ControllerConfig};
pub use error::{ReconcileError, ReconcileResult};
pub use filter::{GenerationFilter, Notification};
pub use reconciler::{LifecycleState, ReconcileAction, Reconciler};
pub use resource::{
    AccountStatus, LdapGroup, LdapUser, ManagedResource, ObjectMeta, ReconcileOutcome,
    ResourceKey, FINALIZER_NAME,
};
pub use store::{ListSelector, ResourceStore, StoreError};
