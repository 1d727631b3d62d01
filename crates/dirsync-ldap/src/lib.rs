//! # LDAP Directory Client
//!
//! POSIX user and group management against an LDAP directory.
//!
//! ## Crate Organization
//!
//! - [`config`] - Connection configuration, loadable from the environment
//! - [`session`] - Per-operation authenticated sessions over `ldap3`
//! - [`account`] - User and group specs and their directory projections
//! - [`client`] - Idempotent upserts and deletes of account entries
//! - [`escape`] - Filter and DN value escaping
//!
//! ## Example
//!
//! ```ignore
//! use dirsync_ldap::{AccountDirectory, DirectoryClient, LdapConfig, UserSpec};
//!
//! let client = DirectoryClient::connect_with(LdapConfig::from_env()?)?;
//! client
//!     .upsert_user(&UserSpec::new("bob", 2001, 2001).with_shell("/bin/bash"))
//!     .await?;
//! ```

pub mod account;
pub mod client;
pub mod config;
pub mod escape;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod session;

pub use account::{DirectoryGroup, DirectoryUser, GroupSpec, MemberRef, UserSpec};
pub use client::{AccountDirectory, DirectoryClient};
pub use config::LdapConfig;
pub use session::{
    DirectoryEntry, DirectorySession, LdapSessionFactory, NewEntry, SearchRequest, SessionFactory,
};
