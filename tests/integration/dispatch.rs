//! Dispatch integration tests.
//!
//! Rules are stored on the team and fire as the task graph and agent
//! lifecycle emit events through the coordinator's bus.

use serde_json::json;

use troupe::agent::{AgentId, HeartbeatSource};
use troupe::config::Config;
use troupe::core::TaskStatus;
use troupe::orchestration::{
    DispatchAction, DispatchCondition, DispatchEvent, DispatchRule, EventKind, Operator, Resource,
    DISPATCH_LOG_CAP,
};

use crate::fixtures::{TestTeam, LEADER, TEAM};

async fn add_rule(team: &TestTeam, rule: DispatchRule) {
    team.coordinator
        .teams()
        .add_rule(TEAM, rule)
        .await
        .expect("Failed to add rule");
}

async fn log_ids(team: &TestTeam) -> Vec<String> {
    team.coordinator
        .teams()
        .dispatch_log(TEAM)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.rule_id)
        .collect()
}

/// Test: Priority ordering
/// Given three log rules with priorities 1, 10 and 10
/// When a task is created
/// Then the two priority-10 rules run first in declaration order
#[tokio::test]
async fn test_rules_run_by_priority() {
    let team = TestTeam::new().await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::TaskCreated, DispatchAction::log("low"))
            .with_id("low")
            .with_priority(1),
    )
    .await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::TaskCreated, DispatchAction::log("first"))
            .with_id("high-a")
            .with_priority(10),
    )
    .await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::TaskCreated, DispatchAction::log("second"))
            .with_id("high-b")
            .with_priority(10),
    )
    .await;

    team.task("t", &[]).await;
    assert_eq!(log_ids(&team).await, vec!["high-a", "high-b", "low"]);
}

/// Test: Leader notification on completion
#[tokio::test]
async fn test_notify_leader_on_completion() {
    let team = TestTeam::new().await;
    add_rule(
        &team,
        DispatchRule::new(
            EventKind::TaskCompleted,
            DispatchAction::notify_leader("Task {title} completed by {owner}"),
        ),
    )
    .await;

    let worker = team.active_worker("worker-1").await;
    let task = team.task("build", &[]).await;
    team.finish(&task.id, &worker).await;

    let inbox = team
        .coordinator
        .mailbox()
        .read_inbox(TEAM, &AgentId::from(LEADER))
        .await
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].text, "Task build completed by worker-1");
}

/// Test: Assign work to an idle agent
/// Given two ready tasks and a rule assigning work on AgentIdle
/// When an active agent goes idle
/// Then the oldest ready task is claimed for it
#[tokio::test]
async fn test_assign_task_on_idle() {
    let team = TestTeam::new().await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::AgentIdle, DispatchAction::assign_task()),
    )
    .await;
    let first = team.task("first", &[]).await;
    let second = team.task("second", &[]).await;
    let worker = team.active_worker("worker-1").await;

    team.coordinator
        .agents()
        .heartbeat(TEAM, &worker, HeartbeatSource::SessionIdle)
        .await
        .unwrap();

    let first = team.get(&first.id).await;
    assert_eq!(first.status, TaskStatus::InProgress);
    assert_eq!(first.owner, Some(worker));
    assert_eq!(team.get(&second.id).await.status, TaskStatus::Pending);
}

/// Test: Recursion cap
/// Given rules that assign another task whenever one is claimed
/// When an agent becomes active with ten ready tasks
/// Then the chain stops after the depth cap of five
#[tokio::test]
async fn test_recursion_is_capped() {
    let team = TestTeam::new().await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::AgentActive, DispatchAction::assign_task()).with_id("start"),
    )
    .await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::TaskClaimed, DispatchAction::assign_task()).with_id("chain"),
    )
    .await;
    for i in 0..10 {
        team.task(&format!("task {}", i), &[]).await;
    }

    team.active_worker("worker-1").await;

    let tasks = team.coordinator.tasks().list_tasks(TEAM).await.unwrap();
    let claimed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .count();
    assert_eq!(claimed, team.coordinator.config().max_dispatch_depth);
    assert_eq!(team.coordinator.dispatch().depth(), 0);
    assert_eq!(log_ids(&team).await.len(), claimed);
}

/// Test: Configured depth cap
#[tokio::test]
async fn test_recursion_cap_follows_config() {
    let team = TestTeam::with_config(Config {
        max_dispatch_depth: 2,
        ..Default::default()
    })
    .await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::AgentActive, DispatchAction::assign_task()),
    )
    .await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::TaskClaimed, DispatchAction::assign_task()),
    )
    .await;
    for i in 0..4 {
        team.task(&format!("task {}", i), &[]).await;
    }

    team.active_worker("worker-1").await;

    let ready = team.coordinator.tasks().ready_tasks(TEAM).await.unwrap();
    assert_eq!(ready.len(), 2);
}

/// Test: Failing actions are logged, never raised
/// Given an assign_task rule on TaskCreated, whose payload names no agent
/// When a task is created
/// Then creation succeeds and the log records a failed entry
#[tokio::test]
async fn test_failing_action_is_isolated() {
    let team = TestTeam::new().await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::TaskCreated, DispatchAction::assign_task()).with_id("bad"),
    )
    .await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::TaskCreated, DispatchAction::log("still runs"))
            .with_id("good")
            .with_priority(-1),
    )
    .await;

    let task = team.task("t", &[]).await;
    assert_eq!(team.get(&task.id).await.status, TaskStatus::Pending);

    let log = team.coordinator.teams().dispatch_log(TEAM).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].rule_id, "bad");
    assert!(!log[0].success);
    assert_eq!(log[1].rule_id, "good");
    assert!(log[1].success);
}

/// Test: Resource count conditions see live state
/// Given a rule that fires once three tasks are ready
/// When three tasks are created
/// Then only the third creation runs the action
#[tokio::test]
async fn test_resource_count_condition() {
    let team = TestTeam::new().await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::TaskCreated, DispatchAction::log("backlog of {title}"))
            .with_condition(DispatchCondition::ResourceCount {
                resource: Resource::ReadyTasks,
                operator: Operator::Gte,
                value: 3,
            }),
    )
    .await;

    for title in ["a", "b", "c"] {
        team.task(title, &[]).await;
    }

    let details: Vec<String> = team
        .coordinator
        .teams()
        .dispatch_log(TEAM)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.details)
        .collect();
    assert_eq!(
        details,
        vec!["condition not met", "condition not met", "backlog of c"]
    );
}

/// Test: Dispatch log is a ring buffer
/// Given a log rule
/// When more events than the cap are handled
/// Then only the newest entries remain
#[tokio::test]
async fn test_dispatch_log_is_capped() {
    let team = TestTeam::new().await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::TaskUpdated, DispatchAction::log("{n}")),
    )
    .await;

    let engine = team.coordinator.dispatch();
    let total = DISPATCH_LOG_CAP + 5;
    for n in 0..total {
        engine
            .handle_event(DispatchEvent::new(
                EventKind::TaskUpdated,
                TEAM,
                json!({ "n": n }),
            ))
            .await
            .unwrap();
    }

    let log = team.coordinator.teams().dispatch_log(TEAM).await.unwrap();
    assert_eq!(log.len(), DISPATCH_LOG_CAP);
    assert_eq!(log[0].details, "5");
    assert_eq!(log[DISPATCH_LOG_CAP - 1].details, (total - 1).to_string());
}

/// Test: Disabled rules do not run
#[tokio::test]
async fn test_disabled_rule_skipped() {
    let team = TestTeam::new().await;
    add_rule(
        &team,
        DispatchRule::new(EventKind::TaskCreated, DispatchAction::log("x")).with_id("off"),
    )
    .await;
    team.coordinator
        .teams()
        .set_rule_enabled(TEAM, "off", false)
        .await
        .unwrap();

    team.task("t", &[]).await;
    assert!(log_ids(&team).await.is_empty());
}
