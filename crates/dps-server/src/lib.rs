//! DPS Server Library
//!
//! Deposit processing and status reconciliation for institutional
//! repositories.
//!
//! # Overview
//!
//! - **Resources & Packaging**: digest submission files and assemble
//!   deterministic SimpleZip or BagIt packages
//! - **Transports**: FTP, SWORD v2 and S3-compatible object stores behind one
//!   [`transport::Transport`] trait
//! - **Orchestrator**: package, send and record a deposit per target repository
//! - **Updater**: fixed-delay loop reconciling non-terminal deposits with
//!   their remote status under optimistic locking
//! - **Intake**: HTTP endpoints feeding a bounded inbound queue
//!
//! # Status model
//!
//! A deposit starts `submitted` and ends `accepted` or `rejected`. Terminal
//! deposits never change again; see [`status`].
//!
//! # Example
//!
//! ```no_run
//! use dps_server::transport::{FtpTransport, SwordTransport, TransportRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn registry() -> anyhow::Result<TransportRegistry> {
//!     let timeout = Duration::from_secs(120);
//!     Ok(TransportRegistry::new(timeout)
//!         .with(Arc::new(FtpTransport::new(timeout)))
//!         .with(Arc::new(SwordTransport::new()?)))
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod inbound;
pub mod middleware;
pub mod notify;
pub mod orchestrator;
pub mod packaging;
pub mod resources;
pub mod status;
pub mod storage;
pub mod store;
pub mod transport;
pub mod updater;

// Re-export commonly used types
pub use error::{ApiResult, AppError};
