//! Transport abstraction
//!
//! Every repository protocol implements [`Transport`]: `send` a package and
//! get back an opaque reference, `query_status` for that reference later.
//! Implementations are selected by [`TransportKind`] through the
//! [`TransportRegistry`], which also bounds every call with a timeout.
//!
//! Error contract: only [`TransportError::Rejected`] means the repository
//! refused the deposit. Everything else is an operational failure that may
//! succeed on retry.

use async_trait::async_trait;
use dps_common::{DepositStatus, RepositoryConfig, TransportKind};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::packaging::Package;

pub mod ftp;
pub mod object_store;
pub mod sword;

pub use ftp::FtpTransport;
pub use object_store::ObjectStoreTransport;
pub use sword::SwordTransport;

pub const DEFAULT_TRANSPORT_TIMEOUT_SECS: u64 = 120;

/// Environment prefix for credential references
pub const CREDENTIALS_ENV_PREFIX: &str = "DPS_CREDENTIALS_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Deposit rejected by repository: {message}")]
    Rejected {
        status: Option<u16>,
        message: String,
    },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Transport call timed out after {0:?}")]
    Timeout(Duration),
    #[error("No transport registered for kind {0}")]
    Unsupported(TransportKind),
    #[error("Transport configuration error: {0}")]
    Config(String),
}

impl TransportError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, TransportError::Rejected { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_) | TransportError::Timeout(_) | TransportError::Protocol(_)
        )
    }
}

/// Remote view of a deposit, already folded into the local enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Visible(DepositStatus),
    /// Known to the transport but not yet processed remotely
    NotYetVisible,
    /// The repository no longer knows the reference
    NotFound,
}

/// Fold a repository-specific state term (bare name or URI) into the local
/// enumeration. Intermediate states (in progress, in review) stay `Submitted`.
pub fn fold_remote_state(term: &str) -> DepositStatus {
    let name = term
        .trim()
        .trim_end_matches('/')
        .rsplit(['/', '#'])
        .next()
        .unwrap_or_default()
        .to_lowercase();

    match name.as_str() {
        "archived" | "accepted" | "published" => DepositStatus::Accepted,
        "rejected" | "withdrawn" | "deleted" => DepositStatus::Rejected,
        _ => DepositStatus::Submitted,
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Transmit a package, returning the repository-side reference
    async fn send(&self, package: &Package, config: &RepositoryConfig) -> Result<String, TransportError>;

    async fn query_status(
        &self,
        reference: &str,
        config: &RepositoryConfig,
    ) -> Result<RemoteStatus, TransportError>;
}

// ============================================================================
// Registry
// ============================================================================

/// Transports keyed by kind, with a per-call timeout
#[derive(Clone)]
pub struct TransportRegistry {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    timeout: Duration,
}

impl TransportRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            transports: HashMap::new(),
            timeout,
        }
    }

    /// Register a transport, replacing any previous one of the same kind
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        if self.transports.insert(transport.kind(), transport).is_some() {
            warn!("Replaced an already registered transport");
        }
    }

    pub fn with(mut self, transport: Arc<dyn Transport>) -> Self {
        self.register(transport);
        self
    }

    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn Transport>, TransportError> {
        self.transports
            .get(&kind)
            .cloned()
            .ok_or(TransportError::Unsupported(kind))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn send(&self, package: &Package, config: &RepositoryConfig) -> Result<String, TransportError> {
        let transport = self.get(config.kind)?;
        self.bounded(transport.send(package, config)).await
    }

    pub async fn query_status(
        &self,
        reference: &str,
        config: &RepositoryConfig,
    ) -> Result<RemoteStatus, TransportError> {
        let transport = self.get(config.kind)?;
        self.bounded(transport.query_status(reference, config)).await
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Username/secret pair resolved from a credentials reference
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

impl Credentials {
    /// Environment variable holding `user:secret` for a reference
    pub fn env_key(reference: &str) -> String {
        format!(
            "{}{}",
            CREDENTIALS_ENV_PREFIX,
            reference.to_uppercase().replace(['-', '.', ' '], "_")
        )
    }

    /// Resolve the repository's credentials; `None` when it declares none
    pub fn resolve(config: &RepositoryConfig) -> Result<Option<Self>, TransportError> {
        let Some(reference) = config.credentials_ref.as_deref() else {
            return Ok(None);
        };

        let key = Self::env_key(reference);
        let raw = std::env::var(&key).map_err(|_| {
            TransportError::Config(format!(
                "credentials {} for repository {} not set ({})",
                reference, config.id, key
            ))
        })?;

        let (username, secret) = raw.split_once(':').ok_or_else(|| {
            TransportError::Config(format!("credentials {} must have the form user:secret", key))
        })?;

        Ok(Some(Self {
            username: username.to_string(),
            secret: secret.to_string(),
        }))
    }
}
