//! Submission orchestrator
//!
//! Drives one submission request end to end for each target repository:
//! resolve the repository, build resources, assemble the package, send it
//! and record the resulting deposit. Targets are independent; one failing
//! target never stops the others.

use dps_common::{Deposit, DepositStatus, StatusChangeEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::notify::EventEmitter;
use crate::packaging::{AssemblerConfig, PackageAssembler, PackageFormat, PackagingError};
use crate::resources::{factory_for, ResourceError};
use crate::storage::ByteSource;
use crate::store::{DepositStore, StoreError, SubmissionCatalog};
use crate::transport::{TransportError, TransportRegistry};

/// Request to deposit one submission into one or more repositories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub submission_id: Uuid,
    pub repository_ids: Vec<String>,
    /// Re-transmit even if a non-rejected deposit already exists
    #[serde(default)]
    pub retry: bool,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Packaging(#[from] PackagingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Submission request has no target repositories")]
    NoTargets,
}

impl SubmitError {
    /// Whether redelivering the request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SubmitError::Transport(e) => e.is_retryable(),
            SubmitError::Store(StoreError::Database(_)) => true,
            SubmitError::Resource(ResourceError::Source(_)) | SubmitError::Resource(ResourceError::Read { .. }) => {
                true
            },
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct TargetFailure {
    pub repository_id: String,
    pub error: SubmitError,
}

/// Per-target results of one request
#[derive(Debug, Default)]
pub struct SubmissionOutcome {
    pub deposits: Vec<Deposit>,
    pub failures: Vec<TargetFailure>,
}

impl SubmissionOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Repositories that need another attempt
    pub fn failed_repositories(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.repository_id.clone()).collect()
    }

    /// Deposits if every target succeeded, otherwise the first failure
    pub fn into_result(mut self) -> Result<Vec<Deposit>, SubmitError> {
        if self.failures.is_empty() {
            Ok(self.deposits)
        } else {
            Err(self.failures.remove(0).error)
        }
    }
}

pub struct SubmissionOrchestrator {
    store: Arc<dyn DepositStore>,
    catalog: Arc<dyn SubmissionCatalog>,
    source: Arc<dyn ByteSource>,
    assembler: PackageAssembler,
    transports: Arc<TransportRegistry>,
    events: EventEmitter,
}

impl SubmissionOrchestrator {
    pub fn new(
        store: Arc<dyn DepositStore>,
        catalog: Arc<dyn SubmissionCatalog>,
        source: Arc<dyn ByteSource>,
        assembler_config: AssemblerConfig,
        transports: Arc<TransportRegistry>,
        events: EventEmitter,
    ) -> Self {
        Self {
            assembler: PackageAssembler::new(source.clone(), assembler_config),
            store,
            catalog,
            source,
            transports,
            events,
        }
    }

    #[instrument(skip(self, request), fields(submission_id = %request.submission_id))]
    pub async fn handle(&self, request: &SubmissionRequest) -> SubmissionOutcome {
        let mut outcome = SubmissionOutcome::default();

        if request.repository_ids.is_empty() {
            warn!("Submission request without target repositories");
            outcome.failures.push(TargetFailure {
                repository_id: String::new(),
                error: SubmitError::NoTargets,
            });
            return outcome;
        }

        for repository_id in &request.repository_ids {
            match self
                .submit_to_target(request.submission_id, repository_id, request.retry)
                .await
            {
                Ok(deposit) => outcome.deposits.push(deposit),
                Err(e) => {
                    warn!(%repository_id, error = %e, "Deposit to repository failed");
                    outcome.failures.push(TargetFailure {
                        repository_id: repository_id.clone(),
                        error: e,
                    });
                },
            }
        }

        info!(
            deposits = outcome.deposits.len(),
            failures = outcome.failures.len(),
            "Submission request processed"
        );

        outcome
    }

    /// Package and send one submission to one repository.
    ///
    /// An explicit rejection still yields a deposit (REJECTED); every other
    /// failure is returned to the caller and nothing is recorded.
    #[instrument(skip(self))]
    pub async fn submit_to_target(
        &self,
        submission_id: Uuid,
        repository_id: &str,
        retry: bool,
    ) -> Result<Deposit, SubmitError> {
        if !retry {
            let existing = self
                .store
                .find_for_target(submission_id, repository_id)
                .await?
                .into_iter()
                .rev()
                .find(|d| d.status != DepositStatus::Rejected);

            if let Some(deposit) = existing {
                info!(
                    deposit_id = %deposit.id,
                    status = %deposit.status,
                    "Deposit already exists for target, not re-transmitting"
                );
                return Ok(deposit);
            }
        }

        let config = self.store.load_repository_config(repository_id).await?;
        let files = self.catalog.load_submission_files(submission_id).await?;

        let format = PackageFormat::for_config(&config)?;
        let mut builder = factory_for(format).new_instance();
        for file in &files {
            builder.add(self.source.as_ref(), file).await?;
        }
        let resources = builder.build();

        let package = self.assembler.assemble(submission_id, &resources, &config).await?;
        info!(
            file_name = %package.file_name,
            size = package.size,
            sha256 = %package.sha256,
            "Package assembled"
        );

        match self.transports.send(&package, &config).await {
            Ok(reference) => {
                let deposit = Deposit::submitted(submission_id, repository_id, reference);
                let stored = self.store.insert(&deposit).await.map_err(|e| {
                    error!(
                        alert = true,
                        reference = ?deposit.reference,
                        "Package sent but deposit could not be recorded: {}", e
                    );
                    e
                })?;
                info!(deposit_id = %stored.id, reference = ?stored.reference, "Deposit submitted");
                Ok(stored)
            },
            Err(TransportError::Rejected { status, message }) => {
                let stored = self
                    .store
                    .insert(&Deposit::rejected(submission_id, repository_id, message))
                    .await?;
                warn!(
                    deposit_id = %stored.id,
                    http_status = ?status,
                    message = ?stored.status_message,
                    "Repository rejected the deposit"
                );
                self.events.emit(StatusChangeEvent::for_deposit(&stored, None));
                Ok(stored)
            },
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_retry_defaults_to_false() {
        let request: SubmissionRequest = serde_json::from_str(
            r#"{"submission_id":"7d3c2f4e-3b1a-4c5e-9f00-1a2b3c4d5e6f","repository_ids":["repo"]}"#,
        )
        .unwrap();
        assert!(!request.retry);
        assert_eq!(request.repository_ids, vec!["repo".to_string()]);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SubmitError::Transport(TransportError::Network("reset".into())).is_retryable());
        assert!(!SubmitError::Packaging(PackagingError::Empty).is_retryable());
        assert!(!SubmitError::Store(StoreError::RepositoryNotFound("x".into())).is_retryable());
        assert!(!SubmitError::NoTargets.is_retryable());
    }

    #[test]
    fn test_outcome_into_result() {
        let outcome = SubmissionOutcome {
            deposits: vec![],
            failures: vec![TargetFailure {
                repository_id: "repo".into(),
                error: SubmitError::Packaging(PackagingError::Empty),
            }],
        };
        assert!(!outcome.is_complete());
        assert_eq!(outcome.failed_repositories(), vec!["repo".to_string()]);
        assert!(matches!(
            outcome.into_result(),
            Err(SubmitError::Packaging(PackagingError::Empty))
        ));
    }
}
