//! Behavioral contract shared by every `ExecutionRegistry` implementation.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use drflow::Error;
use drflow::execution::{Execution, ExecutionStatus, ExecutionType};
use drflow::ids::ExecutionId;
use drflow::plan::{RecoveryPlan, WaveDefinition, WaveFailurePolicy};
use drflow::registry::{
    CasResult, ExecutionRegistry, InMemoryRegistry, Mutation, StorageRegistry, update_with_retry,
};
use drflow_core::{MemoryBackend, ObjectStoreBackend};

fn execution() -> Execution {
    let plan = RecoveryPlan::builder("contract")
        .wave(WaveDefinition::new(1, ["pg-a"]))
        .wave(WaveDefinition::new(2, ["pg-b"]).paused())
        .build()
        .unwrap();
    Execution::from_plan(
        &plan,
        ExecutionType::Drill,
        "ops@example.com",
        WaveFailurePolicy::AnyLaunched,
    )
}

async fn create_then_get_round_trips(registry: &dyn ExecutionRegistry) {
    let exec = execution();
    registry.create(&exec).await.unwrap();

    let stored = registry.get(&exec.execution_id).await.unwrap().unwrap();
    assert_eq!(stored, exec);
    assert!(
        registry
            .get(&ExecutionId::generate())
            .await
            .unwrap()
            .is_none()
    );
}

async fn duplicate_create_is_rejected(registry: &dyn ExecutionRegistry) {
    let exec = execution();
    registry.create(&exec).await.unwrap();

    let err = registry.create(&exec).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ExecutionExists { execution_id } if execution_id == exec.execution_id
    ));
}

async fn update_is_compare_and_swap(registry: &dyn ExecutionRegistry) {
    let exec = execution();
    registry.create(&exec).await.unwrap();

    let mut first = exec.clone();
    first.initiated_by = "first".into();
    assert_eq!(
        registry.update(&first).await.unwrap(),
        CasResult::Success { version: 1 }
    );

    // Same base version: loses the race.
    let mut second = exec.clone();
    second.initiated_by = "second".into();
    assert_eq!(
        registry.update(&second).await.unwrap(),
        CasResult::VersionConflict { actual: 1 }
    );

    let stored = registry.get(&exec.execution_id).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.initiated_by, "first");

    let unknown = execution();
    assert_eq!(registry.update(&unknown).await.unwrap(), CasResult::NotFound);
}

async fn list_by_status_filters(registry: &dyn ExecutionRegistry) {
    let pending = execution();
    registry.create(&pending).await.unwrap();

    let mut polling = execution();
    polling.transition_to(ExecutionStatus::Polling).unwrap();
    registry.create(&polling).await.unwrap();

    let mut cancelled = execution();
    cancelled
        .transition_to(ExecutionStatus::Cancelled)
        .unwrap();
    registry.create(&cancelled).await.unwrap();

    let active = registry
        .list_by_status(&[ExecutionStatus::Pending, ExecutionStatus::Polling])
        .await
        .unwrap();
    let mut ids: Vec<_> = active.iter().map(|e| e.execution_id).collect();
    ids.sort();
    let mut expected = vec![pending.execution_id, polling.execution_id];
    expected.sort();
    assert_eq!(ids, expected);

    let finished = registry
        .list_by_status(&[ExecutionStatus::Cancelled])
        .await
        .unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].execution_id, cancelled.execution_id);

    assert!(
        registry
            .list_by_status(&[ExecutionStatus::Completed])
            .await
            .unwrap()
            .is_empty()
    );
}

async fn retry_applies_and_skips(registry: &dyn ExecutionRegistry) {
    let exec = execution();
    registry.create(&exec).await.unwrap();
    let id = exec.execution_id;

    let (stored, value) = update_with_retry(registry, &id, 3, |e| {
        e.transition_to(ExecutionStatus::Polling)?;
        Ok(Mutation::Apply(e.status))
    })
    .await
    .unwrap();
    assert_eq!(value, ExecutionStatus::Polling);
    assert_eq!(stored.version, 1);
    assert_eq!(stored.status, ExecutionStatus::Polling);

    let (stored, value) = update_with_retry(registry, &id, 3, |e| {
        e.initiated_by = "ignored".into();
        Ok(Mutation::Skip(7))
    })
    .await
    .unwrap();
    assert_eq!(value, 7);
    assert_eq!(stored.version, 1);
    assert_eq!(stored.initiated_by, "ops@example.com");

    let err = update_with_retry(registry, &id, 3, |e| {
        e.transition_to(ExecutionStatus::Pending)?;
        Ok(Mutation::Apply(()))
    })
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));
    let stored = registry.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.version, 1);

    let err = update_with_retry(registry, &ExecutionId::generate(), 3, |_| {
        Ok(Mutation::Apply(()))
    })
    .await
    .unwrap_err();
    assert!(matches!(err, Error::ExecutionNotFound { .. }));
}

async fn concurrent_retries_all_land(registry: &dyn ExecutionRegistry) {
    let exec = execution();
    registry.create(&exec).await.unwrap();
    let id = exec.execution_id;

    let writers = (0..8).map(|n| {
        update_with_retry(registry, &id, 20, move |e| {
            e.initiated_by = format!("writer-{n}");
            Ok(Mutation::Apply(()))
        })
    });
    for result in futures::future::join_all(writers).await {
        result.unwrap();
    }

    let stored = registry.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.version, 8);
}

async fn run_contract(registry: &dyn ExecutionRegistry) {
    create_then_get_round_trips(registry).await;
    duplicate_create_is_rejected(registry).await;
    update_is_compare_and_swap(registry).await;
    retry_applies_and_skips(registry).await;
    concurrent_retries_all_land(registry).await;
}

#[tokio::test]
async fn in_memory_registry_honors_contract() {
    run_contract(&InMemoryRegistry::new()).await;
    list_by_status_filters(&InMemoryRegistry::new()).await;
}

#[tokio::test]
async fn storage_registry_honors_contract() {
    run_contract(&StorageRegistry::new(MemoryBackend::new())).await;
    list_by_status_filters(&StorageRegistry::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn object_store_registry_honors_contract() {
    run_contract(&StorageRegistry::new(ObjectStoreBackend::in_memory())).await;
    list_by_status_filters(&StorageRegistry::new(ObjectStoreBackend::in_memory())).await;
}

#[tokio::test]
async fn storage_registry_writes_one_document_per_execution() {
    use drflow_core::StorageBackend;

    let registry = StorageRegistry::new(MemoryBackend::new());
    let exec = execution();
    registry.create(&exec).await.unwrap();

    let path = format!("executions/{}.json", exec.execution_id);
    let raw = registry.backend().get(&path).await.unwrap();
    let document: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(document["status"], "PENDING");
    assert_eq!(document["executionType"], "drill");
    assert_eq!(document["waves"][1]["pauseBeforeExecution"], true);
}
