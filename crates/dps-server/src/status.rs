//! Deposit status evaluator
//!
//! Pure state machine over [`DepositStatus`]:
//!
//! ```text
//! SUBMITTED ──► ACCEPTED   (terminal)
//!     │
//!     └──────► REJECTED   (terminal)
//! ```
//!
//! Violations are programming-contract errors. Callers must propagate them,
//! never log-and-continue.

use dps_common::{Deposit, DepositStatus};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatusError {
    /// Change out of a terminal state, or a status that is absent altogether
    #[error("Invalid state transition: {} -> {}", label(.from), label(.to))]
    InvalidStateTransition {
        from: Option<DepositStatus>,
        to: Option<DepositStatus>,
    },
}

impl StatusError {
    fn transition(from: DepositStatus, to: DepositStatus) -> Self {
        StatusError::InvalidStateTransition {
            from: Some(from),
            to: Some(to),
        }
    }

    fn absent() -> Self {
        StatusError::InvalidStateTransition { from: None, to: None }
    }
}

fn label(status: &Option<DepositStatus>) -> &'static str {
    status.as_ref().map_or("<absent>", DepositStatus::as_str)
}

/// Result of validating a proposed status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Proposed status equals the current one
    Unchanged,
    /// Forward move, `terminal` tells whether the new state is final
    Advanced { terminal: bool },
}

/// Whether a status is final. An absent status is a caller bug.
pub fn is_terminal(status: Option<DepositStatus>) -> Result<bool, StatusError> {
    match status {
        Some(DepositStatus::Submitted) => Ok(false),
        Some(DepositStatus::Accepted) | Some(DepositStatus::Rejected) => Ok(true),
        None => Err(StatusError::absent()),
    }
}

/// Validate moving from `from` to `to`
pub fn validate_transition(from: DepositStatus, to: DepositStatus) -> Result<Transition, StatusError> {
    if from == to {
        return Ok(Transition::Unchanged);
    }

    if is_terminal(Some(from))? {
        return Err(StatusError::transition(from, to));
    }

    Ok(Transition::Advanced {
        terminal: is_terminal(Some(to))?,
    })
}

/// Produce the next version of `deposit` with `to` applied.
///
/// Returns `None` when nothing changes. The returned record still carries the
/// version it was read at; the store bumps it on a successful write.
pub fn apply_transition(
    deposit: &Deposit,
    to: DepositStatus,
    message: Option<String>,
) -> Result<Option<Deposit>, StatusError> {
    match validate_transition(deposit.status, to)? {
        Transition::Unchanged => Ok(None),
        Transition::Advanced { .. } => {
            let mut next = deposit.clone();
            next.status = to;
            if message.is_some() {
                next.status_message = message;
            }
            next.updated_at = chrono::Utc::now();
            Ok(Some(next))
        },
    }
}
