//! Agent lifecycle integration tests.
//!
//! These tests verify heartbeat-driven status changes, the two-miss grace
//! period of the stale sweep and what happens to an agent's work when it
//! dies, is killed or shuts down.

use chrono::{Duration, Utc};

use troupe::agent::{AgentId, AgentSpec, AgentStatus, HeartbeatSource};
use troupe::core::TaskStatus;
use troupe::orchestration::EventKind;
use troupe::team::inbox::SYSTEM_SENDER;
use troupe::Error;

use crate::fixtures::{record, RecordingPanes, TestTeam, LEADER, TEAM};

/// Test: Grace period before inactivity
/// Given an active agent owning a task whose last heartbeat is 70s old
/// When the sweep runs once and then again
/// Then the first sweep only counts a miss and the second marks the agent
/// inactive, reassigns its task and notifies the leader
#[tokio::test]
async fn test_stale_agent_needs_two_misses() {
    let team = TestTeam::new().await;
    let agents = team.coordinator.agents();
    let inactive = record(team.coordinator.bus(), EventKind::AgentInactive);

    let worker = team.active_worker("worker-1").await;
    let start = Utc::now();
    agents
        .heartbeat_at(TEAM, &worker, HeartbeatSource::ToolExecution, start)
        .await
        .unwrap();
    let task = team.task("build", &[]).await;
    team.coordinator
        .tasks()
        .claim_task(TEAM, &task.id, &worker)
        .await
        .unwrap();

    let now = start + Duration::seconds(70);
    let first = agents.sweep_at(TEAM, now).await.unwrap();
    assert_eq!(first.missed, vec![worker.clone()]);
    assert!(first.inactivated.is_empty());

    let state = agents.get_agent(TEAM, &worker).await.unwrap();
    assert_eq!(state.status, AgentStatus::Active);
    assert_eq!(state.consecutive_misses, 1);
    assert_eq!(team.get(&task.id).await.owner, Some(worker.clone()));

    let second = agents.sweep_at(TEAM, now).await.unwrap();
    assert_eq!(second.inactivated, vec![worker.clone()]);
    assert_eq!(second.reassigned, vec![task.id]);

    let state = agents.get_agent(TEAM, &worker).await.unwrap();
    assert_eq!(state.status, AgentStatus::Inactive);

    let task = team.get(&task.id).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.owner.is_none());
    assert!(task.warning.unwrap().contains("worker-1"));

    let inbox = team
        .coordinator
        .mailbox()
        .read_inbox(TEAM, &AgentId::from(LEADER))
        .await
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].from, SYSTEM_SENDER);
    assert!(inbox[0].text.contains("worker-1"));

    assert_eq!(inactive.lock().unwrap().len(), 1);

    let rejected = agents
        .heartbeat(TEAM, &worker, HeartbeatSource::ExplicitCall)
        .await;
    assert!(matches!(rejected, Err(Error::InvalidState(_))));
    let unchanged = agents.get_agent(TEAM, &worker).await.unwrap();
    assert_eq!(unchanged.status, AgentStatus::Inactive);
}

/// Test: Fresh heartbeats are never counted as misses
#[tokio::test]
async fn test_fresh_agent_is_not_swept() {
    let team = TestTeam::new().await;
    let worker = team.active_worker("worker-1").await;

    let report = team.coordinator.agents().sweep(TEAM).await.unwrap();
    assert_eq!(report.checked, 1);
    assert!(report.missed.is_empty());

    let state = team.coordinator.agents().get_agent(TEAM, &worker).await.unwrap();
    assert_eq!(state.consecutive_misses, 0);
}

/// Test: Passive status transitions
/// Given an active agent
/// When it reports idle and then tool execution
/// Then it moves to idle and back, and idle agents are not swept
#[tokio::test]
async fn test_idle_round_trip() {
    let team = TestTeam::new().await;
    let agents = team.coordinator.agents();
    let idle_events = record(team.coordinator.bus(), EventKind::AgentIdle);
    let worker = team.active_worker("worker-1").await;

    let start = Utc::now();
    let state = agents
        .heartbeat_at(TEAM, &worker, HeartbeatSource::SessionIdle, start)
        .await
        .unwrap();
    assert_eq!(state.status, AgentStatus::Idle);
    assert_eq!(idle_events.lock().unwrap().len(), 1);

    let report = agents
        .sweep_at(TEAM, start + Duration::seconds(600))
        .await
        .unwrap();
    assert_eq!(report.checked, 0);

    let state = agents
        .heartbeat(TEAM, &worker, HeartbeatSource::ToolExecution)
        .await
        .unwrap();
    assert_eq!(state.status, AgentStatus::Active);
}

/// Test: Session errors surface as events
#[tokio::test]
async fn test_session_error_emits_agent_error() {
    let team = TestTeam::new().await;
    let errors = record(team.coordinator.bus(), EventKind::AgentError);
    let worker = team.active_worker("worker-1").await;

    team.coordinator
        .agents()
        .heartbeat(TEAM, &worker, HeartbeatSource::SessionError)
        .await
        .unwrap();

    let events = errors.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["agent_id"], "worker-1");
}

/// Test: Force-kill
/// Given an agent with a pane and an in-progress task
/// When it is force-killed
/// Then the pane is killed, metadata cleared, the task reassigned and a
/// second kill is rejected
#[tokio::test]
async fn test_force_kill_reassigns_and_kills_pane() {
    let team = TestTeam::new().await;
    let agents = team.coordinator.agents();
    team.register(AgentSpec::new("worker-1", "worker").with_pane("%3").with_session("s-1"))
        .await;
    let worker = AgentId::from("worker-1");
    let task = team.task("build", &[]).await;
    team.coordinator
        .tasks()
        .claim_task(TEAM, &task.id, &worker)
        .await
        .unwrap();

    let report = agents.force_kill(TEAM, &worker).await.unwrap();
    assert!(report.pane_killed);
    assert_eq!(report.reassigned, vec![task.id]);
    assert_eq!(team.panes.killed(), vec!["%3".to_string()]);

    let state = agents.get_agent(TEAM, &worker).await.unwrap();
    assert_eq!(state.status, AgentStatus::Terminated);
    assert!(state.pane_id.is_none());
    assert!(state.session_id.is_none());
    assert_eq!(team.get(&task.id).await.status, TaskStatus::Pending);

    let again = agents.force_kill(TEAM, &worker).await;
    assert!(matches!(again, Err(Error::InvalidState(_))));
}

/// Test: Force-kill survives a pane that cannot be killed
#[tokio::test]
async fn test_force_kill_tolerates_pane_failure() {
    let team = TestTeam::with_panes(RecordingPanes::failing()).await;
    team.register(AgentSpec::new("worker-1", "worker").with_pane("%9"))
        .await;
    let worker = AgentId::from("worker-1");

    let report = team
        .coordinator
        .agents()
        .force_kill(TEAM, &worker)
        .await
        .unwrap();
    assert!(!report.pane_killed);
    assert_eq!(report.agent.status, AgentStatus::Terminated);
    assert_eq!(team.panes.killed(), vec!["%9".to_string()]);
}

/// Test: Cooperative shutdown
/// Given an active agent owning a task
/// When shutdown is requested and confirmed
/// Then the agent is told, becomes terminated and its task is reassigned
#[tokio::test]
async fn test_requested_shutdown() {
    let team = TestTeam::new().await;
    let agents = team.coordinator.agents();
    let worker = team.active_worker("worker-1").await;
    let task = team.task("build", &[]).await;
    team.coordinator
        .tasks()
        .claim_task(TEAM, &task.id, &worker)
        .await
        .unwrap();

    let state = agents.request_shutdown(TEAM, &worker).await.unwrap();
    assert_eq!(state.status, AgentStatus::ShuttingDown);
    let notice = team
        .coordinator
        .mailbox()
        .unread(TEAM, &worker)
        .await
        .unwrap();
    assert_eq!(notice.len(), 1);

    let state = agents.confirm_shutdown(TEAM, &worker).await.unwrap();
    assert_eq!(state.status, AgentStatus::Terminated);
    assert!(team.get(&task.id).await.owner.is_none());

    let listed = agents.list_agents(TEAM).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, AgentStatus::Terminated);
}
