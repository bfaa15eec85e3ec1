//! PostgreSQL store against a live database
//!
//! Run with `DATABASE_URL` set: `cargo test -p dps-server --test postgres_store_test -- --ignored`

use dps_common::{Deposit, DepositStatus, ResourceRole};
use dps_server::status::StatusError;
use dps_server::store::{DepositStore, PgStore, StoreError, SubmissionCatalog};
use sqlx::PgPool;
use uuid::Uuid;

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.unwrap();
    sqlx::migrate!("../../migrations").run(&pool).await.unwrap();
    pool
}

async fn seed_repository(pool: &PgPool) -> String {
    let id = format!("repo-{}", Uuid::new_v4());
    sqlx::query(
        "INSERT INTO repository_configs (id, kind, endpoint, credentials_ref, hints) \
         VALUES ($1, 'sword_v2', 'https://repo.example.org/sword', NULL, '{\"on_behalf_of\": \"dps\"}')",
    )
    .bind(&id)
    .execute(pool)
    .await
    .unwrap();
    id
}

#[tokio::test]
#[ignore]
async fn test_compare_and_swap_round_trip() {
    let pool = pool().await;
    let repository_id = seed_repository(&pool).await;
    let store = PgStore::new(pool);

    let deposit = store
        .insert(&Deposit::submitted(Uuid::new_v4(), &repository_id, "dep-123".into()))
        .await
        .unwrap();
    assert!(matches!(store.insert(&deposit).await, Err(StoreError::Duplicate(_))));

    let pending = store.load_non_terminal_deposits().await.unwrap();
    assert!(pending.iter().any(|d| d.id == deposit.id));

    let mut accepted = deposit.clone();
    accepted.status = DepositStatus::Accepted;
    let saved = store.save(&accepted, 0).await.unwrap();
    assert_eq!(saved.version, 1);

    let mut stale = deposit.clone();
    stale.status = DepositStatus::Rejected;
    assert!(store.save(&stale, 0).await.unwrap_err().is_conflict());

    let mut ghost = deposit.clone();
    ghost.id = Uuid::new_v4();
    assert!(matches!(store.save(&ghost, 0).await, Err(StoreError::NotFound(_))));

    let stored = store.find_deposit(deposit.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DepositStatus::Accepted);

    let config = store.load_repository_config(&repository_id).await.unwrap();
    assert_eq!(config.hint("on_behalf_of"), Some("dps"));
}

#[tokio::test]
#[ignore]
async fn test_terminal_deposit_cannot_be_reopened() {
    let pool = pool().await;
    let repository_id = seed_repository(&pool).await;
    let store = PgStore::new(pool);

    let deposit = store
        .insert(&Deposit::submitted(Uuid::new_v4(), &repository_id, "dep-123".into()))
        .await
        .unwrap();
    let mut accepted = deposit.clone();
    accepted.status = DepositStatus::Accepted;
    let accepted = store.save(&accepted, 0).await.unwrap();

    let mut reopened = accepted.clone();
    reopened.status = DepositStatus::Submitted;
    let err = store.save(&reopened, accepted.version).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidTransition(StatusError::InvalidStateTransition {
            from: Some(DepositStatus::Accepted),
            to: Some(DepositStatus::Submitted),
        })
    ));

    let stored = store.find_deposit(deposit.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DepositStatus::Accepted);
    assert_eq!(stored.version, 1);
}

#[tokio::test]
#[ignore]
async fn test_submission_files_in_position_order() {
    let pool = pool().await;
    let submission_id = Uuid::new_v4();

    for (position, (location, role, target)) in [
        ("sub/metadata.xml", "metadata", "metadata.xml"),
        ("sub/paper.pdf", "manuscript", "paper.pdf"),
    ]
    .into_iter()
    .enumerate()
    {
        sqlx::query(
            "INSERT INTO submission_files (submission_id, position, location, role, target_path) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(submission_id)
        .bind(position as i32)
        .bind(location)
        .bind(role)
        .bind(target)
        .execute(&pool)
        .await
        .unwrap();
    }

    let files = PgStore::new(pool)
        .load_submission_files(submission_id)
        .await
        .unwrap();

    assert_eq!(files.len(), 2);
    assert_eq!(files[0].role, ResourceRole::Metadata);
    assert_eq!(files[1].target_path, "paper.pdf");
}
