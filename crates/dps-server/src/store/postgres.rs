//! PostgreSQL store
//!
//! Optimistic locking is a single conditional UPDATE
//! (`WHERE id = $1 AND version = $2`); the row either moves to the next
//! version or nothing is written. The same statement only touches rows that
//! are still submitted, or already in the status being written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dps_common::{Deposit, DepositStatus, RepositoryConfig};
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use super::{DepositStore, StoreError, SubmissionCatalog};
use crate::resources::SubmissionFile;
use crate::status::validate_transition;

const DEPOSIT_COLUMNS: &str = "id, submission_id, repository_id, status, reference, status_message, \
                               version, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct DepositRow {
    id: Uuid,
    submission_id: Uuid,
    repository_id: String,
    status: String,
    reference: Option<String>,
    status_message: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DepositRow> for Deposit {
    type Error = StoreError;

    fn try_from(row: DepositRow) -> Result<Self, Self::Error> {
        Ok(Deposit {
            status: row
                .status
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("deposit {}: {}", row.id, e)))?,
            id: row.id,
            submission_id: row.submission_id,
            repository_id: row.repository_id,
            reference: row.reference,
            status_message: row.status_message,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RepositoryConfigRow {
    id: String,
    kind: String,
    endpoint: String,
    credentials_ref: Option<String>,
    hints: Json<BTreeMap<String, String>>,
}

#[derive(Debug, sqlx::FromRow)]
struct SubmissionFileRow {
    location: String,
    role: String,
    target_path: String,
    media_type: Option<String>,
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn to_deposits(rows: Vec<DepositRow>) -> Result<Vec<Deposit>, StoreError> {
        rows.into_iter().map(Deposit::try_from).collect()
    }
}

#[async_trait]
impl DepositStore for PgStore {
    async fn load_non_terminal_deposits(&self) -> Result<Vec<Deposit>, StoreError> {
        let rows = sqlx::query_as::<_, DepositRow>(&format!(
            "SELECT {} FROM deposits WHERE status = $1 ORDER BY updated_at",
            DEPOSIT_COLUMNS
        ))
        .bind(DepositStatus::Submitted.as_str())
        .fetch_all(&self.pool)
        .await?;

        Self::to_deposits(rows)
    }

    async fn find_deposit(&self, id: Uuid) -> Result<Option<Deposit>, StoreError> {
        let row = sqlx::query_as::<_, DepositRow>(&format!(
            "SELECT {} FROM deposits WHERE id = $1",
            DEPOSIT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Deposit::try_from).transpose()
    }

    async fn find_for_target(
        &self,
        submission_id: Uuid,
        repository_id: &str,
    ) -> Result<Vec<Deposit>, StoreError> {
        let rows = sqlx::query_as::<_, DepositRow>(&format!(
            "SELECT {} FROM deposits WHERE submission_id = $1 AND repository_id = $2 ORDER BY created_at",
            DEPOSIT_COLUMNS
        ))
        .bind(submission_id)
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;

        Self::to_deposits(rows)
    }

    async fn insert(&self, deposit: &Deposit) -> Result<Deposit, StoreError> {
        let result = sqlx::query_as::<_, DepositRow>(&format!(
            r#"
            INSERT INTO deposits (
                id, submission_id, repository_id, status, reference,
                status_message, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        ))
        .bind(deposit.id)
        .bind(deposit.submission_id)
        .bind(&deposit.repository_id)
        .bind(deposit.status.as_str())
        .bind(&deposit.reference)
        .bind(&deposit.status_message)
        .bind(deposit.version)
        .bind(deposit.created_at)
        .bind(deposit.updated_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => {
                debug!(deposit_id = %deposit.id, status = %deposit.status, "Inserted deposit");
                Deposit::try_from(row)
            },
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::Duplicate(deposit.id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, deposit: &Deposit, expected_version: i64) -> Result<Deposit, StoreError> {
        let row = sqlx::query_as::<_, DepositRow>(&format!(
            r#"
            UPDATE deposits
            SET status = $3,
                reference = $4,
                status_message = $5,
                updated_at = $6,
                version = version + 1
            WHERE id = $1 AND version = $2 AND (status = 'submitted' OR status = $3)
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        ))
        .bind(deposit.id)
        .bind(expected_version)
        .bind(deposit.status.as_str())
        .bind(&deposit.reference)
        .bind(&deposit.status_message)
        .bind(deposit.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Deposit::try_from(row);
        }

        let current: Option<(i64, String)> =
            sqlx::query_as("SELECT version, status FROM deposits WHERE id = $1")
                .bind(deposit.id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Err(StoreError::NotFound(deposit.id)),
            Some((version, _)) if version != expected_version => Err(StoreError::Conflict {
                id: deposit.id,
                expected: expected_version,
            }),
            Some((_, status)) => {
                let status: DepositStatus = status
                    .parse()
                    .map_err(|e| StoreError::Corrupt(format!("deposit {}: {}", deposit.id, e)))?;
                validate_transition(status, deposit.status)?;
                // Row changed between the two statements
                Err(StoreError::Conflict {
                    id: deposit.id,
                    expected: expected_version,
                })
            },
        }
    }

    async fn load_repository_config(&self, id: &str) -> Result<RepositoryConfig, StoreError> {
        let row = sqlx::query_as::<_, RepositoryConfigRow>(
            "SELECT id, kind, endpoint, credentials_ref, hints FROM repository_configs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::RepositoryNotFound(id.to_string()))?;

        Ok(RepositoryConfig {
            kind: row
                .kind
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("repository {}: {}", row.id, e)))?,
            id: row.id,
            endpoint: row.endpoint,
            credentials_ref: row.credentials_ref,
            hints: row.hints.0,
        })
    }
}

#[async_trait]
impl SubmissionCatalog for PgStore {
    async fn load_submission_files(&self, submission_id: Uuid) -> Result<Vec<SubmissionFile>, StoreError> {
        let rows = sqlx::query_as::<_, SubmissionFileRow>(
            r#"
            SELECT location, role, target_path, media_type
            FROM submission_files
            WHERE submission_id = $1
            ORDER BY position, id
            "#,
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SubmissionFile {
                    role: row
                        .role
                        .parse()
                        .map_err(|e| StoreError::Corrupt(format!("submission {}: {}", submission_id, e)))?,
                    location: row.location,
                    target_path: row.target_path,
                    media_type: row.media_type,
                })
            })
            .collect()
    }
}
