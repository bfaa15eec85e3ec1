//! Submission orchestrator and inbound consumer

mod common;

use common::{manuscript, metadata, repository, source_bytes, FakeTransport, REPO_ID};
use dps_common::{DepositStatus, ResourceRole, StatusChangeEvent, TransportKind};
use dps_server::inbound::{Delivery, InboundConfig, InboundConsumer, InboundMessage, InboundSender};
use dps_server::notify::EventEmitter;
use dps_server::orchestrator::{SubmissionOrchestrator, SubmissionRequest, SubmitError};
use dps_server::packaging::{AssemblerConfig, PackagingError};
use dps_server::store::{InMemoryStore, StoreError};
use dps_server::transport::{RemoteStatus, TransportError, TransportRegistry};
use dps_server::updater::{DepositUpdater, UpdaterConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Harness {
    store: Arc<InMemoryStore>,
    transport: Arc<FakeTransport>,
    orchestrator: Arc<SubmissionOrchestrator>,
    updater: Arc<DepositUpdater>,
    events: mpsc::Receiver<StatusChangeEvent>,
    submission_id: Uuid,
}

impl Harness {
    async fn new(kind: TransportKind) -> Self {
        let store = Arc::new(InMemoryStore::new());
        store.add_repository(repository(kind)).await;

        let submission_id = Uuid::new_v4();
        store
            .add_submission(submission_id, vec![manuscript(), metadata()])
            .await;

        let transport = Arc::new(FakeTransport::new(kind));
        let registry =
            Arc::new(TransportRegistry::new(Duration::from_secs(5)).with(transport.clone()));
        let (emitter, events) = EventEmitter::channel(16);

        let orchestrator = Arc::new(SubmissionOrchestrator::new(
            store.clone(),
            store.clone(),
            Arc::new(source_bytes()),
            AssemblerConfig::default(),
            registry.clone(),
            emitter.clone(),
        ));
        let updater = Arc::new(DepositUpdater::new(
            store.clone(),
            registry,
            emitter,
            UpdaterConfig::default(),
        ));

        Self {
            store,
            transport,
            orchestrator,
            updater,
            events,
            submission_id,
        }
    }

    fn request(&self, retry: bool) -> SubmissionRequest {
        SubmissionRequest {
            submission_id: self.submission_id,
            repository_ids: vec![REPO_ID.to_string()],
            retry,
        }
    }

    fn consumer(&self, max_redeliveries: u32) -> InboundConsumer {
        InboundConsumer::new(
            self.orchestrator.clone(),
            self.updater.clone(),
            InboundConfig {
                queue_capacity: 8,
                concurrency: 2,
                max_redeliveries,
                redelivery_delay: Duration::from_secs(10),
            },
        )
    }
}

#[tokio::test]
async fn test_missing_required_role_fails_without_sending() {
    let h = Harness::new(TransportKind::SwordV2).await;
    let submission_id = Uuid::new_v4();
    h.store.add_submission(submission_id, vec![metadata()]).await;

    let err = h
        .orchestrator
        .submit_to_target(submission_id, REPO_ID, false)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SubmitError::Packaging(PackagingError::MissingRole(ResourceRole::Manuscript))
    ));
    assert!(!err.is_retryable());
    assert!(h.transport.sent().is_empty());
    assert!(h.store.all_deposits().await.is_empty());
}

#[tokio::test]
async fn test_successful_send_records_submitted_deposit() {
    let h = Harness::new(TransportKind::SwordV2).await;

    let outcome = h.orchestrator.handle(&h.request(false)).await;
    assert!(outcome.is_complete());
    let deposits = outcome.into_result().unwrap();
    assert_eq!(deposits.len(), 1);

    let deposit = &deposits[0];
    assert_eq!(deposit.status, DepositStatus::Submitted);
    assert_eq!(deposit.reference.as_deref(), Some("dep-123"));
    assert_eq!(deposit.version, 0);
    assert_eq!(deposit.submission_id, h.submission_id);

    let stored = h.store.all_deposits().await;
    assert_eq!(stored, deposits);

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].file_name, format!("{}.zip", h.submission_id));
}

#[tokio::test]
async fn test_ftp_targets_get_bagit_packages() {
    let h = Harness::new(TransportKind::Ftp).await;

    h.orchestrator.handle(&h.request(false)).await.into_result().unwrap();

    assert_eq!(h.transport.sent()[0].file_name, format!("{}.tar.gz", h.submission_id));
}

#[tokio::test]
async fn test_explicit_rejection_records_rejected_deposit_and_event() {
    let mut h = Harness::new(TransportKind::SwordV2).await;
    h.transport.push_send_result(Err(TransportError::Rejected {
        status: Some(413),
        message: "Package too large".into(),
    }));

    let deposit = h
        .orchestrator
        .submit_to_target(h.submission_id, REPO_ID, false)
        .await
        .unwrap();

    assert_eq!(deposit.status, DepositStatus::Rejected);
    assert_eq!(deposit.status_message.as_deref(), Some("Package too large"));
    assert!(deposit.reference.is_none());

    let event = h.events.try_recv().unwrap();
    assert_eq!(event.deposit_id, deposit.id);
    assert_eq!(event.old_status, None);
    assert_eq!(event.new_status, DepositStatus::Rejected);
}

#[tokio::test]
async fn test_existing_deposit_is_not_retransmitted() {
    let h = Harness::new(TransportKind::SwordV2).await;

    let first = h
        .orchestrator
        .submit_to_target(h.submission_id, REPO_ID, false)
        .await
        .unwrap();
    let second = h
        .orchestrator
        .submit_to_target(h.submission_id, REPO_ID, false)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.transport.sent().len(), 1);
}

#[tokio::test]
async fn test_retry_flag_forces_new_transmission() {
    let h = Harness::new(TransportKind::SwordV2).await;
    h.transport.push_send_result(Ok("dep-1".into()));
    h.transport.push_send_result(Ok("dep-2".into()));

    h.orchestrator.handle(&h.request(false)).await.into_result().unwrap();
    let retried = h.orchestrator.handle(&h.request(true)).await.into_result().unwrap();

    assert_eq!(retried[0].reference.as_deref(), Some("dep-2"));
    assert_eq!(h.transport.sent().len(), 2);
    assert_eq!(h.store.all_deposits().await.len(), 2);

    // Identical input, identical package
    let sent = h.transport.sent();
    assert_eq!(sent[0].sha256, sent[1].sha256);
}

#[tokio::test]
async fn test_rejected_deposit_does_not_block_resubmission() {
    let h = Harness::new(TransportKind::SwordV2).await;
    h.transport.push_send_result(Err(TransportError::Rejected {
        status: Some(415),
        message: "unsupported packaging".into(),
    }));

    let rejected = h
        .orchestrator
        .submit_to_target(h.submission_id, REPO_ID, false)
        .await
        .unwrap();
    let resubmitted = h
        .orchestrator
        .submit_to_target(h.submission_id, REPO_ID, false)
        .await
        .unwrap();

    assert_eq!(rejected.status, DepositStatus::Rejected);
    assert_eq!(resubmitted.status, DepositStatus::Submitted);
    assert_ne!(rejected.id, resubmitted.id);
}

#[tokio::test]
async fn test_targets_are_independent() {
    let h = Harness::new(TransportKind::SwordV2).await;
    let request = SubmissionRequest {
        submission_id: h.submission_id,
        repository_ids: vec!["unknown-repo".to_string(), REPO_ID.to_string()],
        retry: false,
    };

    let outcome = h.orchestrator.handle(&request).await;

    assert_eq!(outcome.deposits.len(), 1);
    assert_eq!(outcome.failed_repositories(), vec!["unknown-repo".to_string()]);
    assert!(matches!(
        outcome.failures[0].error,
        SubmitError::Store(StoreError::RepositoryNotFound(_))
    ));
}

#[tokio::test]
async fn test_network_failure_records_nothing() {
    let h = Harness::new(TransportKind::SwordV2).await;
    h.transport
        .push_send_result(Err(TransportError::Network("connection refused".into())));

    let err = h
        .orchestrator
        .submit_to_target(h.submission_id, REPO_ID, false)
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(h.store.all_deposits().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_inbound_redelivers_transient_failures() {
    let h = Harness::new(TransportKind::SwordV2).await;
    h.transport
        .push_send_result(Err(TransportError::Network("connection reset".into())));

    let delivery = h
        .consumer(2)
        .deliver(InboundMessage::Submit(h.request(false)), &CancellationToken::new())
        .await;

    assert_eq!(delivery, Delivery::Completed { attempts: 2 });
    assert_eq!(h.transport.sent().len(), 2);
    assert_eq!(h.store.all_deposits().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_gives_up_after_max_redeliveries() {
    let h = Harness::new(TransportKind::SwordV2).await;
    for _ in 0..3 {
        h.transport
            .push_send_result(Err(TransportError::Timeout(Duration::from_secs(120))));
    }

    let delivery = h
        .consumer(2)
        .deliver(InboundMessage::Submit(h.request(false)), &CancellationToken::new())
        .await;

    assert_eq!(delivery, Delivery::Exhausted { attempts: 3 });
    assert!(h.store.all_deposits().await.is_empty());
}

#[tokio::test]
async fn test_inbound_drops_permanent_failures() {
    let h = Harness::new(TransportKind::SwordV2).await;
    let submission_id = Uuid::new_v4();
    h.store.add_submission(submission_id, vec![metadata()]).await;

    let delivery = h
        .consumer(3)
        .deliver(
            InboundMessage::Submit(SubmissionRequest {
                submission_id,
                repository_ids: vec![REPO_ID.to_string()],
                retry: false,
            }),
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(delivery, Delivery::Dropped { attempts: 1 });
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_inbound_refresh_message_updates_deposit() {
    let h = Harness::new(TransportKind::SwordV2).await;
    let deposit = h
        .orchestrator
        .submit_to_target(h.submission_id, REPO_ID, false)
        .await
        .unwrap();
    h.transport
        .set_status("dep-123", Ok(RemoteStatus::Visible(DepositStatus::Accepted)));

    let delivery = h
        .consumer(0)
        .deliver(
            InboundMessage::Refresh {
                deposit_id: deposit.id,
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(delivery, Delivery::Completed { attempts: 1 });
    let stored = h.store.all_deposits().await;
    assert_eq!(stored[0].status, DepositStatus::Accepted);
    assert_eq!(stored[0].version, 1);
}

#[tokio::test]
async fn test_consumer_drains_queue_until_closed() {
    let h = Harness::new(TransportKind::SwordV2).await;
    let (sender, rx) = InboundSender::channel(4);
    sender
        .enqueue(InboundMessage::Submit(h.request(false)))
        .unwrap();
    drop(sender);

    Arc::new(h.consumer(0)).run(rx, CancellationToken::new()).await;

    assert_eq!(h.store.all_deposits().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drops_messages_waiting_for_a_slot() {
    let h = Harness::new(TransportKind::SwordV2).await;
    h.transport
        .push_send_result(Err(TransportError::Network("connection reset".into())));

    let consumer = Arc::new(InboundConsumer::new(
        h.orchestrator.clone(),
        h.updater.clone(),
        InboundConfig {
            queue_capacity: 8,
            concurrency: 1,
            max_redeliveries: 3,
            redelivery_delay: Duration::from_secs(60),
        },
    ));
    let (sender, rx) = InboundSender::channel(4);
    sender
        .enqueue(InboundMessage::Submit(h.request(false)))
        .unwrap();
    sender
        .enqueue(InboundMessage::Submit(h.request(false)))
        .unwrap();

    let cancel = CancellationToken::new();
    let run = tokio::spawn(consumer.run(rx, cancel.clone()));

    // First message fails and waits out its backoff on the only slot
    while h.transport.sent().is_empty() {
        tokio::task::yield_now().await;
    }
    cancel.cancel();
    run.await.unwrap();

    assert_eq!(h.transport.sent().len(), 1);
    assert!(h.store.all_deposits().await.is_empty());
    drop(sender);
}
