//! DPS Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the deposit processing service.
//!
//! # Overview
//!
//! - **Error Handling**: Common error type and result alias
//! - **Checksums**: Single-pass SHA-256 + MD5 digests for package resources
//! - **Logging**: Centralized tracing subscriber setup
//! - **Types**: Deposits, statuses, repository configuration, status-change events
//!
//! # Example
//!
//! ```no_run
//! use dps_common::checksum::compute_file_digests;
//!
//! fn describe(path: &str) -> dps_common::Result<()> {
//!     let digests = compute_file_digests(path)?;
//!     tracing::info!(sha256 = %digests.sha256, size = digests.size, "Digested file");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{DpsError, Result};
pub use types::{
    Deposit, DepositStatus, RepositoryConfig, ResourceRole, StatusChangeEvent, TransportKind,
};
