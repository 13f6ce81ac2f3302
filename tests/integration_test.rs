mod fixtures;

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use uuid::Uuid;

use crawl_orchestrator::app_state::AppState;
use crawl_orchestrator::models::credential::{CredentialStatus, ReleaseOutcome};
use crawl_orchestrator::models::job::{Job, JobKind};
use crawl_orchestrator::models::result::ResultRecord;
use crawl_orchestrator::services::clock::SystemClock;
use crawl_orchestrator::services::store::{RedisBackend, Store};

/// State over a real Redis, isolated under a fresh key prefix.
///
/// Note: This requires a running Redis instance configured via `REDIS_URL`.
async fn redis_state() -> AppState {
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
    let prefix = format!("crawl-test-{}", Uuid::new_v4());
    let backend = RedisBackend::connect(&redis_url, &prefix)
        .await
        .expect("Failed to connect to Redis");
    let store = Store::new(Arc::new(backend));
    tokio_test::assert_ok!(store.ping().await);
    AppState::new(store, Arc::new(SystemClock), fixtures::config(&[("REDIS_URL", redis_url.as_str())]))
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_concurrent_appends_accept_each_fingerprint_once() {
    let state = redis_state().await;
    let record = ResultRecord::new("4990000000000001", "rust", 1, serde_json::json!({ "text": "hi" }), Utc::now());

    let accepted = join_all((0..16).map(|_| state.sink.append(&record))).await;
    let winners = accepted.into_iter().filter(|r| *r.as_ref().unwrap()).count();

    assert_eq!(winners, 1);
    assert_eq!(state.sink.len().await.unwrap(), 1);
    assert!(state.ledger.contains(&record.fingerprint).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_concurrent_leasers_get_distinct_jobs() {
    let state = redis_state().await;
    for _ in 0..5 {
        state.queue.enqueue(Job::produce_cookie(Utc::now()), chrono::Duration::zero()).await.unwrap();
    }

    let leased = join_all((0..8).map(|_| state.queue.lease(JobKind::ProduceCookie, std::time::Duration::from_millis(200)))).await;
    let ids: Vec<Uuid> = leased.into_iter().filter_map(|r| r.unwrap()).map(|job| job.id).collect();

    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());
    assert_eq!(ids.len(), 5);
}

#[tokio::test]
#[ignore]
async fn test_pool_lease_and_ban_round_trip() {
    let state = redis_state().await;
    state.registry.seed(&[fixtures::PROXY_ADDRESSES[0].to_string()]).await.unwrap();
    let proxy = state.registry.list().await.unwrap().remove(0);
    let credential = state.pool.admit(fixtures::raw_cookie(1), proxy.id).await.unwrap();

    let lease = state.pool.lease(None).await.unwrap();
    assert_eq!(lease.credential.id, credential.id);
    assert!(state.pool.release(&lease, ReleaseOutcome::HardFailure).await.unwrap());

    let banned = state.pool.get(credential.id).await.unwrap().unwrap();
    assert_eq!(banned.status, CredentialStatus::Banned);
    assert!(state.pool.lease(None).await.is_err());
    assert!(state.registry.get(proxy.id).await.unwrap().unwrap().binding.is_none());
}
