//! Outbound status-change events
//!
//! The core never blocks on notification: events are handed over with
//! `try_send` and a full or closed channel only costs a warning. The
//! receiving side either forwards each event to a webhook or just logs it.

use dps_common::StatusChangeEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_NOTIFY_QUEUE_CAPACITY: usize = 1024;

const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Sending half handed to the orchestrator and the updater
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<StatusChangeEvent>,
}

impl EventEmitter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StatusChangeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Best-effort emit; returns whether the event was queued
    pub fn emit(&self, event: StatusChangeEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    deposit_id = %event.deposit_id,
                    new_status = %event.new_status,
                    "Notification queue full, dropping status change event"
                );
                false
            },
            Err(TrySendError::Closed(event)) => {
                warn!(
                    deposit_id = %event.deposit_id,
                    "Notification channel closed, dropping status change event"
                );
                false
            },
        }
    }
}

/// POSTs each event as JSON to a configured URL
#[derive(Clone)]
pub struct WebhookForwarder {
    client: reqwest::Client,
    url: String,
}

impl WebhookForwarder {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub async fn forward(&self, event: &StatusChangeEvent) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Drain events until the channel closes or `cancel` fires
pub async fn run_event_sink(
    mut rx: mpsc::Receiver<StatusChangeEvent>,
    webhook: Option<WebhookForwarder>,
    cancel: CancellationToken,
) {
    info!(webhook = webhook.is_some(), "Status change event sink started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        info!(
            deposit_id = %event.deposit_id,
            submission_id = %event.submission_id,
            repository_id = %event.repository_id,
            old_status = ?event.old_status,
            new_status = %event.new_status,
            "Deposit status changed"
        );

        if let Some(webhook) = &webhook {
            match webhook.forward(&event).await {
                Ok(()) => debug!(deposit_id = %event.deposit_id, "Forwarded status change event"),
                Err(e) => error!(deposit_id = %event.deposit_id, "Failed to forward status change event: {}", e),
            }
        }
    }

    info!("Status change event sink stopped");
}
