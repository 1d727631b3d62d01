//! # Directory Sync Connector Types
//!
//! Shared building blocks for the directory sync crates.
//!
//! ## Crate Organization
//!
//! - [`error`] - Error types with transient/permanent classification
//! - [`config`] - TLS and connection settings
//! - [`retry`] - Exponential backoff for re-delivered attempts

pub mod config;
pub mod error;
pub mod retry;
