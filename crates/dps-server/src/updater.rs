//! Deposit updater job
//!
//! Fixed-delay reconciliation loop: every cycle loads all non-terminal
//! deposits, asks their transport for the remote status, runs the status
//! evaluator and persists changes with compare-and-swap.
//!
//! Failure policy:
//! - one deposit failing never affects the others in the cycle
//! - a version conflict means another writer got there first; skip it
//! - failing to enumerate deposits skips the cycle, the loop keeps going
//! - an evaluator contract violation stops the loop

use dps_common::{Deposit, DepositStatus, StatusChangeEvent};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::notify::EventEmitter;
use crate::status::{apply_transition, is_terminal, StatusError};
use crate::store::{DepositStore, StoreError};
use crate::transport::{RemoteStatus, TransportError, TransportRegistry};

pub const DEFAULT_UPDATER_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_UPDATER_INITIAL_DELAY_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("Remote repository lost deposit {deposit_id} (reference {reference})")]
    LostRemoteResource { deposit_id: Uuid, reference: String },
    #[error("Deposit {0} has no transport reference")]
    MissingReference(Uuid),
    #[error("Deposit not found: {0}")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// New status persisted; carries the stored record
    Updated(Deposit),
    Unchanged,
    /// Lost the compare-and-swap race
    Conflict,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub examined: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub lost: usize,
}

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub interval: Duration,
    pub initial_delay: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_UPDATER_INTERVAL_SECS),
            initial_delay: Duration::from_secs(DEFAULT_UPDATER_INITIAL_DELAY_SECS),
        }
    }
}

pub struct DepositUpdater {
    store: Arc<dyn DepositStore>,
    transports: Arc<TransportRegistry>,
    events: EventEmitter,
    config: UpdaterConfig,
}

impl DepositUpdater {
    pub fn new(
        store: Arc<dyn DepositStore>,
        transports: Arc<TransportRegistry>,
        events: EventEmitter,
        config: UpdaterConfig,
    ) -> Self {
        Self {
            store,
            transports,
            events,
            config,
        }
    }

    /// Spawn the loop. The task ends on cancellation or a contract violation.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(cancel).await {
                error!("Deposit updater stopped on status contract violation: {}", e);
            }
        })
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), StatusError> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Deposit updater started"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Deposit updater cancelled before first cycle");
                return Ok(());
            }
            _ = sleep(self.config.initial_delay) => {}
        }

        loop {
            self.run_cycle(&cancel).await?;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.config.interval) => {}
            }
        }

        info!("Deposit updater stopped");
        Ok(())
    }

    /// One pass over all non-terminal deposits
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleStats, StatusError> {
        let mut stats = CycleStats::default();
        info!("Starting deposit status cycle");

        let deposits = match self.store.load_non_terminal_deposits().await {
            Ok(deposits) => deposits,
            Err(e) => {
                error!("Failed to load non-terminal deposits, skipping cycle: {}", e);
                return Ok(stats);
            },
        };

        for deposit in deposits {
            if cancel.is_cancelled() {
                info!("Deposit status cycle cancelled");
                break;
            }

            stats.examined += 1;

            match self.refresh_deposit(&deposit).await {
                Ok(RefreshOutcome::Updated(saved)) => {
                    stats.updated += 1;
                    info!(
                        deposit_id = %saved.id,
                        old_status = %deposit.status,
                        new_status = %saved.status,
                        version = saved.version,
                        "Deposit status updated"
                    );
                },
                Ok(RefreshOutcome::Unchanged) => stats.unchanged += 1,
                Ok(RefreshOutcome::Conflict) => {
                    stats.conflicts += 1;
                    warn!(
                        deposit_id = %deposit.id,
                        expected_version = deposit.version,
                        "Optimistic lock conflict, deferring deposit to next cycle"
                    );
                },
                Err(RefreshError::Status(e)) => {
                    error!(deposit_id = %deposit.id, "Status contract violation: {}", e);
                    return Err(e);
                },
                Err(RefreshError::LostRemoteResource {
                    deposit_id,
                    reference,
                }) => {
                    stats.lost += 1;
                    error!(
                        alert = true,
                        %deposit_id,
                        %reference,
                        repository_id = %deposit.repository_id,
                        "Remote repository no longer knows this deposit"
                    );
                },
                Err(e) => {
                    stats.failed += 1;
                    warn!(deposit_id = %deposit.id, error = %e, "Failed to refresh deposit");
                },
            }
        }

        info!(
            examined = stats.examined,
            updated = stats.updated,
            unchanged = stats.unchanged,
            conflicts = stats.conflicts,
            failed = stats.failed,
            lost = stats.lost,
            "Deposit status cycle complete"
        );

        Ok(stats)
    }

    /// Query, evaluate and persist one deposit
    #[instrument(skip(self, deposit), fields(deposit_id = %deposit.id))]
    pub async fn refresh_deposit(&self, deposit: &Deposit) -> Result<RefreshOutcome, RefreshError> {
        if is_terminal(Some(deposit.status))? {
            return Ok(RefreshOutcome::Unchanged);
        }

        let reference = deposit
            .reference
            .as_deref()
            .ok_or(RefreshError::MissingReference(deposit.id))?;

        let config = self.store.load_repository_config(&deposit.repository_id).await?;

        let proposed = match self.transports.query_status(reference, &config).await? {
            RemoteStatus::Visible(status) => status,
            RemoteStatus::NotYetVisible => DepositStatus::Submitted,
            RemoteStatus::NotFound => {
                return Err(RefreshError::LostRemoteResource {
                    deposit_id: deposit.id,
                    reference: reference.to_string(),
                })
            },
        };

        let Some(next) = apply_transition(deposit, proposed, None)? else {
            debug!("Remote status unchanged");
            return Ok(RefreshOutcome::Unchanged);
        };

        match self.store.save(&next, deposit.version).await {
            Ok(saved) => {
                if is_terminal(Some(saved.status))? {
                    self.events
                        .emit(StatusChangeEvent::for_deposit(&saved, Some(deposit.status)));
                }
                Ok(RefreshOutcome::Updated(saved))
            },
            Err(StoreError::Conflict { .. }) => Ok(RefreshOutcome::Conflict),
            Err(StoreError::InvalidTransition(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Ad hoc refresh of one deposit, e.g. from an inbound message.
    /// Terminal deposits are left alone.
    pub async fn refresh_by_id(&self, deposit_id: Uuid) -> Result<RefreshOutcome, RefreshError> {
        let deposit = self
            .store
            .find_deposit(deposit_id)
            .await?
            .ok_or(RefreshError::NotFound(deposit_id))?;

        if is_terminal(Some(deposit.status))? {
            debug!(%deposit_id, status = %deposit.status, "Deposit already terminal, skipping refresh");
            return Ok(RefreshOutcome::Unchanged);
        }

        self.refresh_deposit(&deposit).await
    }
}
