//! Common types used across DPS

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::DpsError;

// ============================================================================
// Deposit Status
// ============================================================================

/// Local status of a deposit
///
/// `Submitted` is the only non-terminal state. Remote repositories may expose
/// finer-grained intermediate states; transports fold those into `Submitted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Submitted,
    Accepted,
    Rejected,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Submitted => "submitted",
            DepositStatus::Accepted => "accepted",
            DepositStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DepositStatus {
    type Err = DpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "submitted" => Ok(DepositStatus::Submitted),
            "accepted" => Ok(DepositStatus::Accepted),
            "rejected" => Ok(DepositStatus::Rejected),
            other => Err(DpsError::UnknownStatus(other.to_string())),
        }
    }
}

// ============================================================================
// Deposit
// ============================================================================

/// One attempt to place a package into one target repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: Uuid,
    /// Owning submission
    pub submission_id: Uuid,
    /// Target repository identifier (key of a `RepositoryConfig`)
    pub repository_id: String,
    pub status: DepositStatus,
    /// Transport-assigned reference, absent until transmission succeeds
    pub reference: Option<String>,
    /// Remote rejection reason or last diagnostic
    pub status_message: Option<String>,
    /// Optimistic-lock counter, incremented by every persisted mutation
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    /// New deposit record for a successful transmission
    pub fn submitted(submission_id: Uuid, repository_id: impl Into<String>, reference: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            submission_id,
            repository_id: repository_id.into(),
            status: DepositStatus::Submitted,
            reference: Some(reference),
            status_message: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// New deposit record for a transmission the repository refused outright
    pub fn rejected(
        submission_id: Uuid,
        repository_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            submission_id,
            repository_id: repository_id.into(),
            status: DepositStatus::Rejected,
            reference: None,
            status_message: Some(message.into()),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Repository Configuration
// ============================================================================

/// Wire protocol used to reach a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Ftp,
    SwordV2,
    ObjectStore,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Ftp => "ftp",
            TransportKind::SwordV2 => "sword_v2",
            TransportKind::ObjectStore => "object_store",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = DpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ftp" => Ok(TransportKind::Ftp),
            "sword_v2" | "sword2" | "swordv2" => Ok(TransportKind::SwordV2),
            "object_store" | "s3" => Ok(TransportKind::ObjectStore),
            other => Err(DpsError::UnknownTransport(other.to_string())),
        }
    }
}

/// Static description of a target repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub id: String,
    pub kind: TransportKind,
    /// Host, URL or bucket endpoint, interpreted by the transport
    pub endpoint: String,
    /// Name of the credential entry to use, resolved at call time
    pub credentials_ref: Option<String>,
    /// Protocol-specific hints (e.g. `passive`, `collection_url`)
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
}

impl RepositoryConfig {
    pub fn new(id: impl Into<String>, kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            endpoint: endpoint.into(),
            credentials_ref: None,
            hints: BTreeMap::new(),
        }
    }

    pub fn with_hint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.hints.insert(key.into(), value.into());
        self
    }

    pub fn with_credentials(mut self, reference: impl Into<String>) -> Self {
        self.credentials_ref = Some(reference.into());
        self
    }

    pub fn hint(&self, key: &str) -> Option<&str> {
        self.hints.get(key).map(String::as_str)
    }

    /// Boolean hint; accepts true/false, yes/no, 1/0
    pub fn hint_bool(&self, key: &str) -> Option<bool> {
        match self.hint(key)?.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        }
    }

    /// Comma-separated hint as a list of trimmed, non-empty values
    pub fn hint_list(&self, key: &str) -> Option<Vec<String>> {
        self.hint(key).map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

// ============================================================================
// Resources
// ============================================================================

/// Role a file plays inside a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceRole {
    Manuscript,
    Metadata,
    Supplementary,
}

impl ResourceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceRole::Manuscript => "manuscript",
            ResourceRole::Metadata => "metadata",
            ResourceRole::Supplementary => "supplementary",
        }
    }
}

impl std::fmt::Display for ResourceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceRole {
    type Err = DpsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manuscript" => Ok(ResourceRole::Manuscript),
            "metadata" => Ok(ResourceRole::Metadata),
            "supplementary" | "supplement" => Ok(ResourceRole::Supplementary),
            other => Err(DpsError::UnknownRole(other.to_string())),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Outbound signal for the notification collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub deposit_id: Uuid,
    pub submission_id: Uuid,
    pub repository_id: String,
    /// Absent when the deposit was created directly in `new_status`
    pub old_status: Option<DepositStatus>,
    pub new_status: DepositStatus,
    pub occurred_at: DateTime<Utc>,
}

impl StatusChangeEvent {
    pub fn for_deposit(deposit: &Deposit, old_status: Option<DepositStatus>) -> Self {
        Self {
            deposit_id: deposit.id,
            submission_id: deposit.submission_id,
            repository_id: deposit.repository_id.clone(),
            old_status,
            new_status: deposit.status,
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_and_display() {
        assert_eq!("ACCEPTED".parse::<DepositStatus>().unwrap(), DepositStatus::Accepted);
        assert_eq!(DepositStatus::Rejected.to_string(), "rejected");
        assert!("in-progress".parse::<DepositStatus>().is_err());
    }

    #[test]
    fn test_transport_kind_aliases() {
        assert_eq!("s3".parse::<TransportKind>().unwrap(), TransportKind::ObjectStore);
        assert_eq!("sword2".parse::<TransportKind>().unwrap(), TransportKind::SwordV2);
        assert!("gopher".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_repository_hints() {
        let config = RepositoryConfig::new("inst-repo", TransportKind::Ftp, "ftp.example.org")
            .with_hint("passive", "yes")
            .with_hint("required_roles", "manuscript, metadata,");

        assert_eq!(config.hint_bool("passive"), Some(true));
        assert_eq!(config.hint_bool("missing"), None);
        assert_eq!(
            config.hint_list("required_roles").unwrap(),
            vec!["manuscript".to_string(), "metadata".to_string()]
        );
    }

    #[test]
    fn test_deposit_constructors() {
        let submission = Uuid::new_v4();
        let deposit = Deposit::submitted(submission, "repo", "dep-123".to_string());
        assert_eq!(deposit.status, DepositStatus::Submitted);
        assert_eq!(deposit.reference.as_deref(), Some("dep-123"));
        assert_eq!(deposit.version, 0);

        let rejected = Deposit::rejected(submission, "repo", "bad package");
        assert_eq!(rejected.status, DepositStatus::Rejected);
        assert!(rejected.reference.is_none());
    }

    #[test]
    fn test_event_for_deposit() {
        let deposit = Deposit::rejected(Uuid::new_v4(), "repo", "nope");
        let event = StatusChangeEvent::for_deposit(&deposit, None);
        assert_eq!(event.deposit_id, deposit.id);
        assert_eq!(event.new_status, DepositStatus::Rejected);
        assert!(event.old_status.is_none());
    }
}
