//! In-memory store, for tests and single-process runs without a database

use async_trait::async_trait;
use dps_common::{Deposit, RepositoryConfig};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DepositStore, StoreError, SubmissionCatalog};
use crate::resources::SubmissionFile;
use crate::status::{is_terminal, validate_transition};

#[derive(Default)]
pub struct InMemoryStore {
    deposits: RwLock<HashMap<Uuid, Deposit>>,
    repositories: RwLock<HashMap<String, RepositoryConfig>>,
    submissions: RwLock<HashMap<Uuid, Vec<SubmissionFile>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_repository(&self, config: RepositoryConfig) {
        self.repositories.write().await.insert(config.id.clone(), config);
    }

    pub async fn add_submission(&self, submission_id: Uuid, files: Vec<SubmissionFile>) {
        self.submissions.write().await.insert(submission_id, files);
    }

    pub async fn all_deposits(&self) -> Vec<Deposit> {
        let mut deposits: Vec<_> = self.deposits.read().await.values().cloned().collect();
        deposits.sort_by_key(|d| d.created_at);
        deposits
    }
}

#[async_trait]
impl DepositStore for InMemoryStore {
    async fn load_non_terminal_deposits(&self) -> Result<Vec<Deposit>, StoreError> {
        let deposits = self.deposits.read().await;
        let mut pending = Vec::new();
        for deposit in deposits.values() {
            let terminal = is_terminal(Some(deposit.status))
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            if !terminal {
                pending.push(deposit.clone());
            }
        }
        pending.sort_by_key(|d| d.updated_at);
        Ok(pending)
    }

    async fn find_deposit(&self, id: Uuid) -> Result<Option<Deposit>, StoreError> {
        Ok(self.deposits.read().await.get(&id).cloned())
    }

    async fn find_for_target(
        &self,
        submission_id: Uuid,
        repository_id: &str,
    ) -> Result<Vec<Deposit>, StoreError> {
        let mut found: Vec<_> = self
            .deposits
            .read()
            .await
            .values()
            .filter(|d| d.submission_id == submission_id && d.repository_id == repository_id)
            .cloned()
            .collect();
        found.sort_by_key(|d| d.created_at);
        Ok(found)
    }

    async fn insert(&self, deposit: &Deposit) -> Result<Deposit, StoreError> {
        let mut deposits = self.deposits.write().await;
        if deposits.contains_key(&deposit.id) {
            return Err(StoreError::Duplicate(deposit.id));
        }
        deposits.insert(deposit.id, deposit.clone());
        Ok(deposit.clone())
    }

    async fn save(&self, deposit: &Deposit, expected_version: i64) -> Result<Deposit, StoreError> {
        let mut deposits = self.deposits.write().await;
        let current = deposits
            .get(&deposit.id)
            .ok_or(StoreError::NotFound(deposit.id))?;

        if current.version != expected_version {
            return Err(StoreError::Conflict {
                id: deposit.id,
                expected: expected_version,
            });
        }
        validate_transition(current.status, deposit.status)?;

        let mut stored = deposit.clone();
        stored.version = expected_version + 1;
        deposits.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn load_repository_config(&self, id: &str) -> Result<RepositoryConfig, StoreError> {
        self.repositories
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::RepositoryNotFound(id.to_string()))
    }
}

#[async_trait]
impl SubmissionCatalog for InMemoryStore {
    async fn load_submission_files(&self, submission_id: Uuid) -> Result<Vec<SubmissionFile>, StoreError> {
        Ok(self
            .submissions
            .read()
            .await
            .get(&submission_id)
            .cloned()
            .unwrap_or_default())
    }
}
