//! Concurrency integration tests.
//!
//! Several coordinators over one root stand in for separate processes.
//! Each has its own lock manager and store, so mutual exclusion comes only
//! from the file locks.

use futures::future::join_all;

use troupe::agent::AgentId;
use troupe::core::{NewTask, TaskStatus};
use troupe::team::inbox::SYSTEM_SENDER;
use troupe::Error;

use crate::fixtures::{TestTeam, LEADER, TEAM};

const CLAIMERS: usize = 8;

/// Test: Claim-once under contention
/// Given one pending task and eight claimers on separate coordinators
/// When all claim at once
/// Then exactly one succeeds and the rest get Contention
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner() {
    let team = TestTeam::new().await;
    let task = team.task("contested", &[]).await;

    let mut handles = Vec::new();
    for i in 0..CLAIMERS {
        let peer = team.peer();
        let id = task.id;
        handles.push(tokio::spawn(async move {
            let agent = AgentId::new(format!("worker-{}", i));
            peer.tasks().claim_task(TEAM, &id, &agent).await
        }));
    }

    let mut winners = Vec::new();
    let mut contended = 0;
    for result in join_all(handles).await {
        match result.unwrap() {
            Ok(task) => winners.push(task.owner),
            Err(Error::Contention { .. }) => contended += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(contended, CLAIMERS - 1);

    let stored = team.get(&task.id).await;
    assert_eq!(stored.status, TaskStatus::InProgress);
    assert_eq!(stored.owner, winners[0]);
}

/// Test: Concurrent appends lose nothing
/// Given many writers delivering to one inbox from separate coordinators
/// When they all deliver at once
/// Then every message is present
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deliveries_are_not_lost() {
    let team = TestTeam::new().await;
    const WRITERS: usize = 16;

    let mut handles = Vec::new();
    for i in 0..WRITERS {
        let peer = team.peer();
        handles.push(tokio::spawn(async move {
            peer.mailbox()
                .deliver(TEAM, &AgentId::from(LEADER), SYSTEM_SENDER, &format!("msg {}", i))
                .await
        }));
    }
    for result in join_all(handles).await {
        result.unwrap().unwrap();
    }

    let inbox = team
        .coordinator
        .mailbox()
        .read_inbox(TEAM, &AgentId::from(LEADER))
        .await
        .unwrap();
    assert_eq!(inbox.len(), WRITERS);
}

/// Test: Concurrent task creation keeps blocks consistent
/// Given one root task
/// When many dependents are created concurrently
/// Then the root's blocks list names every one of them
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dependents_all_recorded() {
    let team = TestTeam::new().await;
    let root = team.task("root", &[]).await;

    let mut handles = Vec::new();
    for i in 0..CLAIMERS {
        let peer = team.peer();
        let root_id = root.id;
        handles.push(tokio::spawn(async move {
            peer.tasks()
                .create_task(TEAM, NewTask::new(&format!("child {}", i)), &[root_id])
                .await
        }));
    }
    let mut children = Vec::new();
    for result in join_all(handles).await {
        children.push(result.unwrap().unwrap().id);
    }

    let mut blocks = team.get(&root.id).await.blocks;
    blocks.sort();
    children.sort();
    assert_eq!(blocks, children);
}
