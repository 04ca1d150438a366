//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A coordinator over a temporary root with one team
//! - A pane controller that records kills
//! - Recording bus events

use std::path::Path;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use troupe::agent::{AgentId, AgentSpec, HeartbeatSource};
use troupe::config::Config;
use troupe::core::{NewTask, Task, TaskId, TaskPatch, TaskStatus};
use troupe::orchestration::{DispatchEvent, EventBus, EventKind};
use troupe::tmux::PaneController;
use troupe::{Coordinator, Error, Result};

/// Name of the team every fixture creates.
pub const TEAM: &str = "alpha";

/// Leader of [`TEAM`].
pub const LEADER: &str = "lead";

/// Pane controller that remembers what it was asked to kill.
#[derive(Default)]
pub struct RecordingPanes {
    killed: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingPanes {
    /// A controller whose kills always fail.
    pub fn failing() -> Self {
        Self {
            killed: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }
}

impl PaneController for RecordingPanes {
    fn kill_pane(&self, pane_id: &str) -> Result<()> {
        self.killed.lock().unwrap().push(pane_id.to_string());
        if self.fail {
            return Err(Error::Tmux(format!("cannot kill {}", pane_id)));
        }
        Ok(())
    }
}

/// A coordinator over a temporary root with [`TEAM`] already created.
pub struct TestTeam {
    /// Keeps the root alive for the duration of the test.
    pub temp_dir: TempDir,
    pub coordinator: Coordinator,
    pub panes: Arc<RecordingPanes>,
}

impl TestTeam {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::build(config, Arc::new(RecordingPanes::default())).await
    }

    pub async fn with_panes(panes: RecordingPanes) -> Self {
        Self::build(Config::default(), Arc::new(panes)).await
    }

    async fn build(config: Config, panes: Arc<RecordingPanes>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let coordinator = Coordinator::with_config(temp_dir.path(), config, panes.clone());
        coordinator
            .teams()
            .create_team(TEAM, &AgentId::from(LEADER))
            .await
            .expect("Failed to create team");
        Self {
            temp_dir,
            coordinator,
            panes,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A second coordinator over the same root, standing in for another
    /// process.
    pub fn peer(&self) -> Coordinator {
        Coordinator::with_config(
            self.root(),
            Config::default(),
            Arc::new(RecordingPanes::default()),
        )
    }

    /// Register `id` and send the first heartbeat so it is active.
    pub async fn active_worker(&self, id: &str) -> AgentId {
        self.register(AgentSpec::new(id, "worker")).await;
        let agent = AgentId::from(id);
        self.coordinator
            .agents()
            .heartbeat(TEAM, &agent, HeartbeatSource::ExplicitCall)
            .await
            .expect("Failed to activate worker");
        agent
    }

    pub async fn register(&self, spec: AgentSpec) {
        self.coordinator
            .agents()
            .register_agent(TEAM, spec)
            .await
            .expect("Failed to register agent");
    }

    pub async fn task(&self, title: &str, deps: &[TaskId]) -> Task {
        self.coordinator
            .tasks()
            .create_task(TEAM, NewTask::new(title), deps)
            .await
            .expect("Failed to create task")
    }

    pub async fn get(&self, id: &TaskId) -> Task {
        self.coordinator
            .tasks()
            .get_task(TEAM, id)
            .await
            .expect("Failed to read task")
    }

    /// Claim `id` for `agent` and mark it completed.
    pub async fn finish(&self, id: &TaskId, agent: &AgentId) -> Task {
        let tasks = self.coordinator.tasks();
        tasks
            .claim_task(TEAM, id, agent)
            .await
            .expect("Failed to claim task");
        tasks
            .update_task(TEAM, id, TaskPatch::new().status(TaskStatus::Completed))
            .await
            .expect("Failed to complete task")
    }
}

/// Collect every event of `kind` emitted on `bus`.
pub fn record(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<DispatchEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(kind, move |event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(event);
            Ok::<(), Error>(())
        }
    });
    seen
}
