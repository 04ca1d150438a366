//! Task graph integration tests.
//!
//! These tests verify dependency bookkeeping across task files: the
//! one-hop completion cascade, cycle rejection, the status transition
//! table, referential integrity on delete and crash repair.

use troupe::core::{TaskId, TaskPatch, TaskStatus};
use troupe::orchestration::EventKind;
use troupe::state::Schema;
use troupe::Error;

use crate::fixtures::{record, TestTeam, TEAM};

/// Test: Completion cascades exactly one hop
/// Given a chain A <- B <- C
/// When A completes
/// Then B loses its dependency and becomes ready while C still waits on B
#[tokio::test]
async fn test_completion_cascades_one_hop() {
    let team = TestTeam::new().await;
    let worker = team.active_worker("worker-1").await;
    let unblocked = record(team.coordinator.bus(), EventKind::TaskUnblocked);

    let a = team.task("schema", &[]).await;
    let b = team.task("migrate", &[a.id]).await;
    let c = team.task("backfill", &[b.id]).await;
    assert_eq!(team.get(&a.id).await.blocks, vec![b.id]);

    let done = team.finish(&a.id, &worker).await;
    assert!(done.blocks.is_empty());

    let b_after = team.get(&b.id).await;
    assert!(b_after.dependencies.is_empty());
    assert_eq!(b_after.blocks, vec![c.id]);
    assert_eq!(team.get(&c.id).await.dependencies, vec![b.id]);

    let ready = team.coordinator.tasks().ready_tasks(TEAM).await.unwrap();
    let ready_ids: Vec<_> = ready.iter().map(|t| t.id).collect();
    assert_eq!(ready_ids, vec![b.id]);

    let events = unblocked.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["task_id"], serde_json::json!(b.id));
}

/// Test: Cycle rejection leaves disk unchanged
/// Given A <- B <- C
/// When A is updated to depend on C
/// Then CircularDependency is returned and no task file changes
#[tokio::test]
async fn test_cycle_rejected_without_side_effects() {
    let team = TestTeam::new().await;
    let a = team.task("a", &[]).await;
    let b = team.task("b", &[a.id]).await;
    let c = team.task("c", &[b.id]).await;

    let layout = team.coordinator.layout();
    let snapshot = |id: &TaskId| std::fs::read(layout.task_file(TEAM, id)).unwrap();
    let before: Vec<Vec<u8>> = [a.id, b.id, c.id].iter().map(snapshot).collect();

    let result = team
        .coordinator
        .tasks()
        .update_task(TEAM, &a.id, TaskPatch::new().dependencies(vec![c.id]))
        .await;
    assert!(matches!(result, Err(Error::CircularDependency { .. })));

    let after: Vec<Vec<u8>> = [a.id, b.id, c.id].iter().map(snapshot).collect();
    assert_eq!(before, after);
}

/// Test: Status transition table
/// Given a pending task
/// When skipping in_progress or moving backwards
/// Then InvalidStatusTransition is returned
#[tokio::test]
async fn test_status_transitions() {
    let team = TestTeam::new().await;
    let tasks = team.coordinator.tasks();
    let task = team.task("t", &[]).await;

    let skip = tasks
        .update_task(TEAM, &task.id, TaskPatch::new().status(TaskStatus::Completed))
        .await;
    assert!(matches!(skip, Err(Error::InvalidStatusTransition { .. })));

    tasks
        .update_task(TEAM, &task.id, TaskPatch::new().status(TaskStatus::InProgress))
        .await
        .unwrap();
    let back = tasks
        .update_task(TEAM, &task.id, TaskPatch::new().status(TaskStatus::Pending))
        .await;
    assert!(matches!(back, Err(Error::InvalidStatusTransition { .. })));

    let done = tasks
        .update_task(TEAM, &task.id, TaskPatch::new().status(TaskStatus::Completed))
        .await
        .unwrap();
    assert!(done.completed_at.is_some());

    let reopen = tasks
        .update_task(TEAM, &task.id, TaskPatch::new().status(TaskStatus::InProgress))
        .await;
    assert!(matches!(reopen, Err(Error::InvalidStatusTransition { .. })));
}

/// Test: Delete respects dependents
/// Given B depends on A
/// When A is deleted
/// Then ReferentialIntegrity names B, and deleting B first succeeds
#[tokio::test]
async fn test_delete_requires_no_dependents() {
    let team = TestTeam::new().await;
    let tasks = team.coordinator.tasks();
    let a = team.task("a", &[]).await;
    let b = team.task("b", &[a.id]).await;

    match tasks.delete_task(TEAM, &a.id).await {
        Err(Error::ReferentialIntegrity { dependents, .. }) => {
            assert_eq!(dependents, vec![b.id.to_string()]);
        }
        other => panic!("expected ReferentialIntegrity, got {:?}", other),
    }

    tasks.delete_task(TEAM, &b.id).await.unwrap();
    assert!(team.get(&a.id).await.blocks.is_empty());
    tasks.delete_task(TEAM, &a.id).await.unwrap();
    assert!(tasks.list_tasks(TEAM).await.unwrap().is_empty());

    let missing = tasks.get_task(TEAM, &a.id).await;
    assert!(matches!(missing, Err(Error::TaskNotFound(_))));
}

/// Test: Reconcile repairs an interrupted cascade
/// Given A was written as completed but B still lists A
/// When the graph is reconciled
/// Then B's dependency is dropped and A's blocks list is rebuilt
#[tokio::test]
async fn test_reconcile_repairs_interrupted_cascade() {
    let team = TestTeam::new().await;
    let a = team.task("a", &[]).await;
    let b = team.task("b", &[a.id]).await;

    let mut crashed = team.get(&a.id).await;
    crashed.status = TaskStatus::Completed;
    crashed.completed_at = Some(chrono::Utc::now());
    assert!(crashed.validate().is_ok());
    team.coordinator
        .store()
        .write_atomic(&team.coordinator.layout().task_file(TEAM, &a.id), &crashed)
        .unwrap();

    let report = team.coordinator.tasks().reconcile(TEAM).await.unwrap();
    assert_eq!(report.dropped_dependencies, 1);
    assert_eq!(report.rewritten, 2);

    assert!(team.get(&b.id).await.dependencies.is_empty());
    assert!(team.get(&a.id).await.blocks.is_empty());

    let again = team.coordinator.tasks().reconcile(TEAM).await.unwrap();
    assert_eq!(again.rewritten, 0);
}

/// Test: Soft-block end to end
/// Given B depends on A
/// When a worker claims B early and A later completes
/// Then B carries a dependency warning until the cascade clears it
#[tokio::test]
async fn test_soft_block_end_to_end() {
    let team = TestTeam::new().await;
    let early = team.active_worker("worker-1").await;
    let other = team.active_worker("worker-2").await;
    let tasks = team.coordinator.tasks();

    let a = team.task("api", &[]).await;
    let b = team.task("client", &[a.id]).await;

    let claimed = tasks.claim_task(TEAM, &b.id, &early).await.unwrap();
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert!(claimed.has_dependency_warning());
    assert!(claimed.warning.unwrap().contains(&a.id.to_string()));

    team.finish(&a.id, &other).await;

    let b_after = team.get(&b.id).await;
    assert!(b_after.dependencies.is_empty());
    assert!(b_after.warning.is_none());
    assert_eq!(b_after.owner, Some(early.clone()));

    let done = tasks
        .update_task(TEAM, &b.id, TaskPatch::new().status(TaskStatus::Completed))
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

/// Test: Topological order follows dependencies
#[tokio::test]
async fn test_topological_order() {
    let team = TestTeam::new().await;
    let a = team.task("a", &[]).await;
    let b = team.task("b", &[a.id]).await;
    let c = team.task("c", &[a.id, b.id]).await;

    let order = team.coordinator.tasks().topological_order(TEAM).await.unwrap();
    let pos = |id| order.iter().position(|t| *t == id).unwrap();
    assert!(pos(a.id) < pos(b.id));
    assert!(pos(b.id) < pos(c.id));
}
