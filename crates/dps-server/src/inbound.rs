//! Inbound message consumer
//!
//! Submission requests and refresh requests arrive on a bounded channel
//! (fed by the HTTP intake). The consumer handles up to `concurrency`
//! messages at once. A failed message that may succeed later is redelivered
//! with linear backoff (`redelivery_delay * attempt`) up to
//! `max_redeliveries` times; a message keeps its slot while it waits.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::orchestrator::{SubmissionOrchestrator, SubmissionRequest};
use crate::store::StoreError;
use crate::updater::{DepositUpdater, RefreshError};

pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_INBOUND_CONCURRENCY: usize = 4;
pub const DEFAULT_INBOUND_MAX_REDELIVERIES: u32 = 3;
pub const DEFAULT_INBOUND_REDELIVERY_DELAY_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Submit(SubmissionRequest),
    Refresh { deposit_id: Uuid },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InboundError {
    #[error("Inbound queue is full")]
    QueueFull,
    #[error("Inbound queue is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct InboundConfig {
    pub queue_capacity: usize,
    pub concurrency: usize,
    pub max_redeliveries: u32,
    pub redelivery_delay: Duration,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            concurrency: DEFAULT_INBOUND_CONCURRENCY,
            max_redeliveries: DEFAULT_INBOUND_MAX_REDELIVERIES,
            redelivery_delay: Duration::from_secs(DEFAULT_INBOUND_REDELIVERY_DELAY_SECS),
        }
    }
}

/// Producer half used by the intake API
#[derive(Clone)]
pub struct InboundSender {
    tx: mpsc::Sender<InboundMessage>,
}

impl InboundSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting; a full queue is reported to the caller
    pub fn enqueue(&self, message: InboundMessage) -> Result<(), InboundError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => InboundError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => InboundError::Closed,
        })
    }
}

/// Final fate of one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Completed { attempts: u32 },
    /// Failed in a way redelivery cannot fix
    Dropped { attempts: u32 },
    /// Still failing after every redelivery
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
}

struct Failure {
    error: String,
    retryable: bool,
    /// What to redeliver; may be narrower than the original message
    remaining: InboundMessage,
}

pub struct InboundConsumer {
    orchestrator: Arc<SubmissionOrchestrator>,
    updater: Arc<DepositUpdater>,
    config: InboundConfig,
}

impl InboundConsumer {
    pub fn new(
        orchestrator: Arc<SubmissionOrchestrator>,
        updater: Arc<DepositUpdater>,
        config: InboundConfig,
    ) -> Self {
        Self {
            orchestrator,
            updater,
            config,
        }
    }

    /// Consume until the channel closes or `cancel` fires, then wait for
    /// in-flight messages.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InboundMessage>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let tracker = TaskTracker::new();

        info!(
            concurrency = self.config.concurrency,
            max_redeliveries = self.config.max_redeliveries,
            "Inbound consumer started"
        );

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(?message, "Shutting down; dropping received inbound message");
                    break;
                },
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let consumer = self.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                let delivery = consumer.deliver(message, &cancel).await;
                debug!(?delivery, "Inbound message finished");
                drop(permit);
            });
        }

        tracker.close();
        tracker.wait().await;
        info!("Inbound consumer stopped");
    }

    /// Handle one message including its redeliveries
    pub async fn deliver(&self, mut message: InboundMessage, cancel: &CancellationToken) -> Delivery {
        let max_attempts = self.config.max_redeliveries + 1;
        let mut attempt = 1;

        loop {
            let failure = match self.process(&message).await {
                Ok(()) => return Delivery::Completed { attempts: attempt },
                Err(failure) => failure,
            };

            if !failure.retryable {
                error!(?message, "Inbound message failed permanently: {}", failure.error);
                return Delivery::Dropped { attempts: attempt };
            }

            if attempt >= max_attempts {
                error!(
                    ?message,
                    attempts = attempt,
                    "Inbound message still failing after all redeliveries: {}", failure.error
                );
                return Delivery::Exhausted { attempts: attempt };
            }

            let delay = self.config.redelivery_delay * attempt;
            warn!(
                "Inbound message attempt {}/{} failed: {}. Redelivering in {}s",
                attempt,
                max_attempts,
                failure.error,
                delay.as_secs()
            );

            tokio::select! {
                _ = cancel.cancelled() => return Delivery::Cancelled { attempts: attempt },
                _ = tokio::time::sleep(delay) => {}
            }

            message = failure.remaining;
            attempt += 1;
        }
    }

    async fn process(&self, message: &InboundMessage) -> Result<(), Failure> {
        match message {
            InboundMessage::Submit(request) => {
                let outcome = self.orchestrator.handle(request).await;
                if outcome.is_complete() {
                    return Ok(());
                }

                let retry_targets: Vec<String> = outcome
                    .failures
                    .iter()
                    .filter(|f| f.error.is_retryable())
                    .map(|f| f.repository_id.clone())
                    .collect();

                let error = outcome
                    .failures
                    .iter()
                    .map(|f| format!("{}: {}", f.repository_id, f.error))
                    .collect::<Vec<_>>()
                    .join("; ");

                Err(Failure {
                    error,
                    retryable: !retry_targets.is_empty(),
                    remaining: InboundMessage::Submit(SubmissionRequest {
                        submission_id: request.submission_id,
                        repository_ids: retry_targets,
                        retry: request.retry,
                    }),
                })
            },
            InboundMessage::Refresh { deposit_id } => match self.updater.refresh_by_id(*deposit_id).await {
                Ok(outcome) => {
                    debug!(%deposit_id, ?outcome, "Ad hoc refresh finished");
                    Ok(())
                },
                Err(RefreshError::LostRemoteResource { deposit_id, reference }) => {
                    error!(alert = true, %deposit_id, %reference, "Remote repository no longer knows this deposit");
                    Err(Failure {
                        error: format!("deposit {} lost remotely", deposit_id),
                        retryable: false,
                        remaining: message.clone(),
                    })
                },
                Err(e) => Err(Failure {
                    retryable: refresh_retryable(&e),
                    error: e.to_string(),
                    remaining: message.clone(),
                }),
            },
        }
    }
}

fn refresh_retryable(error: &RefreshError) -> bool {
    match error {
        RefreshError::Transport(e) => e.is_retryable(),
        RefreshError::Store(StoreError::Database(_)) => true,
        _ => false,
    }
}
