//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use dps_common::{Deposit, RepositoryConfig, ResourceRole, TransportKind};
use dps_server::packaging::Package;
use dps_server::resources::SubmissionFile;
use dps_server::store::{DepositStore, InMemoryStore, StoreError};
use dps_server::transport::{RemoteStatus, Transport, TransportError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;
use uuid::Uuid;

pub const REPO_ID: &str = "inst-repo";

/// What a fake transport saw on `send`
#[derive(Debug, Clone)]
pub struct SentPackage {
    pub repository_id: String,
    pub file_name: String,
    pub sha256: String,
    pub size: u64,
}

/// Scriptable transport. `send` pops queued results and falls back to the
/// default reference; `query_status` answers per reference.
pub struct FakeTransport {
    kind: TransportKind,
    default_reference: String,
    send_results: Mutex<VecDeque<Result<String, TransportError>>>,
    statuses: Mutex<HashMap<String, Result<RemoteStatus, TransportError>>>,
    sent: Mutex<Vec<SentPackage>>,
    queries: AtomicUsize,
    query_barrier: Option<Arc<Barrier>>,
}

impl FakeTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            default_reference: "dep-123".to_string(),
            send_results: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            queries: AtomicUsize::new(0),
            query_barrier: None,
        }
    }

    /// Every `query_status` waits at the barrier before answering
    pub fn with_query_barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.query_barrier = Some(barrier);
        self
    }

    pub fn push_send_result(&self, result: Result<String, TransportError>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    pub fn set_status(&self, reference: &str, status: Result<RemoteStatus, TransportError>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(reference.to_string(), status);
    }

    pub fn sent(&self) -> Vec<SentPackage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&self, package: &Package, config: &RepositoryConfig) -> Result<String, TransportError> {
        self.sent.lock().unwrap().push(SentPackage {
            repository_id: config.id.clone(),
            file_name: package.file_name.clone(),
            sha256: package.sha256.clone(),
            size: package.size,
        });

        let queued = self.send_results.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| Ok(self.default_reference.clone()))
    }

    async fn query_status(
        &self,
        reference: &str,
        _config: &RepositoryConfig,
    ) -> Result<RemoteStatus, TransportError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.query_barrier {
            barrier.wait().await;
        }

        let status = self.statuses.lock().unwrap().get(reference).cloned();
        status.unwrap_or(Ok(RemoteStatus::NotYetVisible))
    }
}

/// Store whose enumeration can be switched to fail
pub struct FlakyStore {
    pub inner: Arc<InMemoryStore>,
    pub fail_enumeration: std::sync::atomic::AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            fail_enumeration: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DepositStore for FlakyStore {
    async fn load_non_terminal_deposits(&self) -> Result<Vec<Deposit>, StoreError> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("enumeration unavailable".into()));
        }
        self.inner.load_non_terminal_deposits().await
    }

    async fn find_deposit(&self, id: Uuid) -> Result<Option<Deposit>, StoreError> {
        self.inner.find_deposit(id).await
    }

    async fn find_for_target(
        &self,
        submission_id: Uuid,
        repository_id: &str,
    ) -> Result<Vec<Deposit>, StoreError> {
        self.inner.find_for_target(submission_id, repository_id).await
    }

    async fn insert(&self, deposit: &Deposit) -> Result<Deposit, StoreError> {
        self.inner.insert(deposit).await
    }

    async fn save(&self, deposit: &Deposit, expected_version: i64) -> Result<Deposit, StoreError> {
        self.inner.save(deposit, expected_version).await
    }

    async fn load_repository_config(&self, id: &str) -> Result<RepositoryConfig, StoreError> {
        self.inner.load_repository_config(id).await
    }
}

pub fn repository(kind: TransportKind) -> RepositoryConfig {
    RepositoryConfig::new(REPO_ID, kind, "https://repo.example.org/sword/collection")
}

pub fn manuscript() -> SubmissionFile {
    SubmissionFile::new("sub/paper.pdf", ResourceRole::Manuscript, "paper.pdf")
        .with_media_type("application/pdf")
}

pub fn metadata() -> SubmissionFile {
    SubmissionFile::new("sub/metadata.xml", ResourceRole::Metadata, "metadata.xml")
}

pub fn source_bytes() -> dps_server::storage::MemorySource {
    dps_server::storage::MemorySource::new()
        .with("sub/paper.pdf", b"%PDF-1.7 manuscript body".to_vec())
        .with("sub/metadata.xml", b"<metadata><title>Paper</title></metadata>".to_vec())
}
