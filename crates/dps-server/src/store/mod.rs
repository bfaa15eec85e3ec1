//! Persistence boundary
//!
//! Deposits are written with compare-and-swap on their version counter:
//! [`DepositStore::save`] succeeds only if the stored version still equals
//! the version the caller read, and bumps it by one. A stale writer gets
//! [`StoreError::Conflict`] and must not retry within the same cycle. A write
//! that would move a deposit out of a terminal state is refused with
//! [`StoreError::InvalidTransition`], whatever the caller validated before.

use async_trait::async_trait;
use dps_common::{Deposit, RepositoryConfig};
use thiserror::Error;
use uuid::Uuid;

use crate::resources::SubmissionFile;
use crate::status::StatusError;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Optimistic lock conflict on deposit {id} (expected version {expected})")]
    Conflict { id: Uuid, expected: i64 },
    #[error("Deposit not found: {0}")]
    NotFound(Uuid),
    #[error("Deposit already exists: {0}")]
    Duplicate(Uuid),
    #[error("Repository configuration not found: {0}")]
    RepositoryNotFound(String),
    #[error("Stored record is invalid: {0}")]
    Corrupt(String),
    #[error(transparent)]
    InvalidTransition(#[from] StatusError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[async_trait]
pub trait DepositStore: Send + Sync {
    /// Every deposit still in a non-terminal state
    async fn load_non_terminal_deposits(&self) -> Result<Vec<Deposit>, StoreError>;

    async fn find_deposit(&self, id: Uuid) -> Result<Option<Deposit>, StoreError>;

    /// Deposits of one submission to one repository, oldest first
    async fn find_for_target(
        &self,
        submission_id: Uuid,
        repository_id: &str,
    ) -> Result<Vec<Deposit>, StoreError>;

    async fn insert(&self, deposit: &Deposit) -> Result<Deposit, StoreError>;

    /// Compare-and-swap write; returns the stored record at `expected_version + 1`
    async fn save(&self, deposit: &Deposit, expected_version: i64) -> Result<Deposit, StoreError>;

    async fn load_repository_config(&self, id: &str) -> Result<RepositoryConfig, StoreError>;
}

/// Lists the files that make up a submission
#[async_trait]
pub trait SubmissionCatalog: Send + Sync {
    async fn load_submission_files(&self, submission_id: Uuid) -> Result<Vec<SubmissionFile>, StoreError>;
}
