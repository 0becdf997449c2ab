/// Cobuild integration tests
///
/// Runners sharing a context through one claim store: peer outcomes, expired
/// leases, heartbeats and store outages.
mod common;

use std::sync::Arc;
use std::time::Duration;

use buildgraph_orchestration::{
    ClaimResult, CobuildCoordinator, MemoryCacheStore, OperationExecutor, OperationStatus,
};
use buildgraph_storage::{
    ClaimOutcome, ClaimState, ClaimStore, InMemoryClaimStore, SqliteClaimStore,
};
use common::*;
use tempfile::TempDir;

const CLAIM_KEY: &str = "cobuild:ctx-test:z;build";

fn peer(store: Arc<dyn ClaimStore>) -> CobuildCoordinator {
    CobuildCoordinator::new(store, "ctx-test", "peer")
}

fn cobuild_executor(
    runner_id: &str,
    runner: Arc<ScriptedRunner>,
    claims: Arc<dyn ClaimStore>,
    cache: &MemoryCacheStore,
) -> OperationExecutor {
    OperationExecutor::new(cobuild_config(2, runner_id), runner)
        .expect("valid config")
        .with_fingerprints(arc(Fingerprints::new()))
        .with_cache_store(Arc::new(cache.clone()))
        .with_claim_store(claims)
}

#[tokio::test]
async fn test_peer_failure_is_retried_locally() {
    let claims: Arc<dyn ClaimStore> = Arc::new(InMemoryClaimStore::new());
    let peer = peer(claims.clone());
    assert_eq!(peer.try_claim(&build("z")).await.expect("claim"), ClaimResult::Claimed);
    assert!(peer
        .complete(&build("z"), ClaimOutcome::Failure, None)
        .await
        .expect("complete"));

    let runner = arc(ScriptedRunner::new());
    let summary = cobuild_executor("runner-b", runner.clone(), claims.clone(), &MemoryCacheStore::new())
        .execute(&graph(&[("z", &[])]))
        .await
        .expect("run completes");

    assert_eq!(status(&summary, "z"), OperationStatus::Success);
    assert_eq!(runner.call_count(), 1);

    // The peer's record is left alone
    let claim = claims.get(CLAIM_KEY).await.expect("readable").expect("present");
    assert_eq!(claim.record.runner_id, "peer");
    assert_eq!(claim.record.outcome, Some(ClaimOutcome::Failure));
}

#[tokio::test]
async fn test_peer_success_without_cache_entry_is_retried_locally() {
    let claims: Arc<dyn ClaimStore> = Arc::new(InMemoryClaimStore::new());
    let peer = peer(claims.clone());
    peer.try_claim(&build("z")).await.expect("claim");
    peer.complete(&build("z"), ClaimOutcome::Success, None)
        .await
        .expect("complete");

    let runner = arc(ScriptedRunner::new());
    let summary = cobuild_executor("runner-b", runner.clone(), claims, &MemoryCacheStore::new())
        .execute(&graph(&[("z", &[])]))
        .await
        .expect("run completes");

    assert_eq!(status(&summary, "z"), OperationStatus::Success);
    assert_eq!(runner.call_count(), 1);
}

#[tokio::test]
async fn test_expired_claim_is_taken_over() {
    let claims: Arc<dyn ClaimStore> = Arc::new(InMemoryClaimStore::new());
    // Crashed holder: claims with a short lease and never refreshes
    let crashed = peer(claims.clone()).with_lease_ttl(Duration::from_millis(100));
    assert_eq!(crashed.try_claim(&build("z")).await.expect("claim"), ClaimResult::Claimed);

    let runner = arc(ScriptedRunner::new());
    let summary = cobuild_executor("runner-b", runner.clone(), claims.clone(), &MemoryCacheStore::new())
        .execute(&graph(&[("z", &[])]))
        .await
        .expect("run completes");

    assert_eq!(status(&summary, "z"), OperationStatus::Success);
    assert_eq!(runner.call_count(), 1);

    let claim = claims.get(CLAIM_KEY).await.expect("readable").expect("present");
    assert_eq!(claim.record.state, ClaimState::Completed);
    assert_eq!(claim.record.runner_id, "runner-b");
    assert_eq!(claim.record.outcome, Some(ClaimOutcome::Success));
    assert!(claim.record.cache_key.is_some());
}

#[tokio::test]
async fn test_claim_store_outage_executes_locally() {
    let runner = arc(ScriptedRunner::new());
    let summary = cobuild_executor(
        "runner-a",
        runner.clone(),
        Arc::new(BrokenClaimStore),
        &MemoryCacheStore::new(),
    )
    .execute(&graph(&[("z", &[])]))
    .await
    .expect("run completes");

    assert_eq!(status(&summary, "z"), OperationStatus::Success);
    assert_eq!(runner.call_count(), 1);
    assert!(summary.warnings.iter().any(|w| w.contains("Cobuild unavailable")));
}

#[tokio::test]
async fn test_heartbeat_keeps_claim_past_lease() {
    let claims: Arc<dyn ClaimStore> = Arc::new(InMemoryClaimStore::new());
    let mut config = cobuild_config(1, "runner-a");
    config.cobuild.lease_ttl_secs = 1;
    config.cobuild.heartbeat_interval_ms = 100;

    let runner = arc(ScriptedRunner::new().with_delay(Duration::from_millis(1500)));
    let executor = OperationExecutor::new(config, runner.clone())
        .expect("valid config")
        .with_fingerprints(arc(Fingerprints::new()))
        .with_claim_store(claims.clone());
    let g = graph(&[("z", &[])]);
    let observer = peer(claims.clone());

    let (summary, observed) = tokio::join!(executor.execute(&g), async {
        tokio::time::sleep(Duration::from_millis(1200)).await;
        observer.try_claim(&build("z")).await
    });

    // Past the one-second lease the claim is still held
    assert_eq!(
        observed.expect("claim attempt"),
        ClaimResult::AlreadyClaimed {
            runner_id: "runner-a".to_string()
        }
    );
    assert_eq!(status(&summary.expect("run completes"), "z"), OperationStatus::Success);
    assert_eq!(runner.call_count(), 1);
}

#[tokio::test]
async fn test_abort_while_waiting_on_peer() {
    let claims: Arc<dyn ClaimStore> = Arc::new(InMemoryClaimStore::new());
    let holder = peer(claims.clone());
    holder.try_claim(&build("z")).await.expect("claim");

    let runner = arc(ScriptedRunner::new());
    let executor = cobuild_executor("runner-b", runner.clone(), claims, &MemoryCacheStore::new());
    let token = executor.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let summary = executor
        .execute(&graph(&[("z", &[])]))
        .await
        .expect("abort is not fatal");

    assert_eq!(status(&summary, "z"), OperationStatus::Cancelled);
    assert!(summary.aborted);
    assert_eq!(runner.call_count(), 0);
}

#[tokio::test]
async fn test_runners_share_sqlite_claims() {
    let temp_dir = TempDir::new().expect("temp dir");
    let path = temp_dir.path().join("claims.db");
    let store_a = SqliteClaimStore::open(&path).expect("open store");
    let store_b = SqliteClaimStore::open(&path).expect("open store");
    let cache = MemoryCacheStore::new();
    let g = graph(&[("lib", &[]), ("z", &["lib"])]);

    let runner_a = arc(ScriptedRunner::new().with_delay(Duration::from_millis(100)));
    let runner_b = arc(ScriptedRunner::new().with_delay(Duration::from_millis(100)));
    let executor_a = cobuild_executor("runner-a", runner_a.clone(), Arc::new(store_a), &cache);
    let executor_b = cobuild_executor("runner-b", runner_b.clone(), Arc::new(store_b), &cache);

    let (a, b) = tokio::join!(executor_a.execute(&g), executor_b.execute(&g));
    let a = a.expect("runner-a completes");
    let b = b.expect("runner-b completes");

    assert!(a.is_success() && b.is_success());
    // Every operation ran exactly once across both runners
    assert_eq!(runner_a.call_count() + runner_b.call_count(), 2);
    for project in ["lib", "z"] {
        let mut statuses = vec![status(&a, project), status(&b, project)];
        statuses.sort();
        assert_eq!(
            statuses,
            vec![OperationStatus::Success, OperationStatus::FromCache],
            "{}",
            project
        );
    }
}
