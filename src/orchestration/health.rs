//! Agent liveness: heartbeats, the stale sweep and forced termination.
//!
//! Agents prove they are alive by heartbeating. A periodic sweep counts
//! missed heartbeats for active agents; after a grace number of misses the
//! agent is marked inactive, its in-progress tasks go back to pending and the
//! team leader is told. Inactive and terminated agents stay on disk as audit
//! records and reject further heartbeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentId, AgentSpec, AgentState, AgentStatus, HeartbeatSource};
use crate::config::{
    Config, DEFAULT_GRACE_MISSES, DEFAULT_STALE_THRESHOLD_SECS, DEFAULT_SWEEP_INTERVAL_SECS,
};
use crate::core::graph::{ReassignReason, TaskGraph};
use crate::core::task::{Task, TaskId};
use crate::orchestration::bus::{DispatchEvent, EventBus, EventKind};
use crate::state::{Layout, Store};
use crate::team::inbox::SYSTEM_SENDER;
use crate::team::{Mailbox, TeamStore};
use crate::tmux::PaneController;
use crate::util::{blocking, validate_name};
use crate::{tlog, tlog_debug, tlog_error, tlog_warn, Error, Result};

const SHUTDOWN_NOTICE: &str = "Shutdown requested: finish or hand off your work, then confirm.";

/// Timing for liveness checks.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time without a heartbeat before an active agent counts a miss.
    pub stale_threshold: Duration,
    /// Consecutive misses before the agent is marked inactive.
    pub grace_misses: u32,
    /// Period of the background sweep.
    pub sweep_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(DEFAULT_STALE_THRESHOLD_SECS),
            grace_misses: DEFAULT_GRACE_MISSES,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl From<&Config> for HealthConfig {
    fn from(config: &Config) -> Self {
        Self {
            stale_threshold: config.stale_threshold(),
            grace_misses: config.grace_misses.max(1),
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Active agents examined.
    pub checked: usize,
    /// Agents that missed a heartbeat but are still within grace.
    pub missed: Vec<AgentId>,
    /// Agents moved to inactive by this sweep.
    pub inactivated: Vec<AgentId>,
    /// Tasks returned to pending, including any left behind by agents that
    /// were already inactive or terminated.
    pub reassigned: Vec<TaskId>,
}

/// What a forced termination did.
#[derive(Debug, Clone)]
pub struct KillReport {
    pub agent: AgentState,
    pub reassigned: Vec<TaskId>,
    /// False when there was no pane or killing it failed.
    pub pane_killed: bool,
}

/// Handle to a running background sweeper.
pub struct SweeperHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop after its current pass.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tlog_warn!("Sweeper task ended abnormally: {}", e);
        }
    }
}

/// Agent file access for one team. Callers hold the agents lock.
struct AgentFiles {
    store: Store,
    layout: Layout,
    team: String,
}

impl AgentFiles {
    fn lock_path(&self) -> std::path::PathBuf {
        self.layout.agents_lock(&self.team)
    }

    fn path(&self, id: &AgentId) -> std::path::PathBuf {
        self.layout.agent_file(&self.team, id)
    }

    fn list(&self) -> Result<Vec<AgentState>> {
        let mut agents: Vec<AgentState> =
            self.store.list_json(&self.layout.agents_dir(&self.team))?;
        agents.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        Ok(agents)
    }

    /// Locked read-modify-write of one agent record.
    fn update<R>(&self, id: &AgentId, f: impl FnOnce(&mut AgentState) -> Result<R>) -> Result<R> {
        self.store
            .locked_update(&self.lock_path(), &self.path(id), |state: &mut AgentState| {
                let out = f(state)?;
                state.updated_at = Utc::now();
                Ok(out)
            })
            .map_err(|e| match e {
                Error::FileNotFound(_) => Error::AgentNotFound(id.to_string()),
                other => other,
            })
    }
}

/// Liveness state machine for a team's agents.
pub struct AgentLifecycle {
    config: HealthConfig,
    store: Store,
    layout: Layout,
    bus: EventBus,
    tasks: Arc<TaskGraph>,
    teams: TeamStore,
    mailbox: Mailbox,
    panes: Arc<dyn PaneController>,
}

impl AgentLifecycle {
    pub fn new(
        config: HealthConfig,
        store: Store,
        layout: Layout,
        bus: EventBus,
        tasks: Arc<TaskGraph>,
        panes: Arc<dyn PaneController>,
    ) -> Self {
        Self {
            config,
            teams: TeamStore::new(store, layout.clone()),
            mailbox: Mailbox::new(store, layout.clone()),
            store,
            layout,
            bus,
            tasks,
            panes,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn files(&self, team: &str) -> AgentFiles {
        AgentFiles {
            store: self.store,
            layout: self.layout.clone(),
            team: team.to_string(),
        }
    }

    async fn emit(&self, kind: EventKind, state: &AgentState, extra: serde_json::Value) {
        let mut payload = json!({
            "agent_id": state.id,
            "role": state.role,
            "status": state.status,
        });
        if let (Some(base), serde_json::Value::Object(extra)) = (payload.as_object_mut(), extra) {
            base.extend(extra);
        }
        self.bus
            .emit(DispatchEvent::new(kind, &state.team_name, payload))
            .await;
    }

    /// Register a new agent in `spawning` and add it to the team.
    pub async fn register_agent(&self, team: &str, spec: AgentSpec) -> Result<AgentState> {
        validate_name("Team", team)?;
        validate_name("Agent", spec.id.as_str())?;
        self.teams.get_team(team).await?;

        let files = self.files(team);
        let state = AgentState::register(team, spec);
        let state = blocking(move || {
            files.store.locks().with_lock(&files.lock_path(), || {
                let path = files.path(&state.id);
                if path.exists() {
                    return Err(Error::InvalidState(format!(
                        "Agent {} is already registered",
                        state.id
                    )));
                }
                files.store.write_atomic(&path, &state)?;
                Ok(state)
            })
        })
        .await?;

        self.teams.add_member(team, &state.id, &state.role).await?;
        tlog!("Agent {} registered in team {} as {}", state.id, team, state.role);
        self.emit(EventKind::AgentRegistered, &state, json!({})).await;
        Ok(state)
    }

    pub async fn heartbeat(
        &self,
        team: &str,
        id: &AgentId,
        source: HeartbeatSource,
    ) -> Result<AgentState> {
        self.heartbeat_at(team, id, source, Utc::now()).await
    }

    /// Record a heartbeat observed at `now`.
    ///
    /// Resets the miss counter and applies the passive status transition for
    /// `source`. Inactive and terminated agents are rejected unchanged.
    pub async fn heartbeat_at(
        &self,
        team: &str,
        id: &AgentId,
        source: HeartbeatSource,
        now: DateTime<Utc>,
    ) -> Result<AgentState> {
        validate_name("Team", team)?;
        validate_name("Agent", id.as_str())?;
        let files = self.files(team);
        let agent = id.clone();
        let (previous, state) = blocking(move || {
            files.update(&agent, |state| {
                if !state.status.accepts_heartbeat() {
                    return Err(Error::InvalidState(format!(
                        "Agent {} is {} and cannot heartbeat",
                        state.id, state.status
                    )));
                }
                let previous = state.status;
                state.status = previous.after_heartbeat(source);
                state.heartbeat_ts = now;
                state.consecutive_misses = 0;
                state.last_heartbeat_source = Some(source);
                Ok((previous, state.clone()))
            })
        })
        .await?;

        tlog_debug!(
            "Heartbeat {} from {}/{}: {} -> {}",
            source,
            team,
            id,
            previous,
            state.status
        );
        let extra = json!({ "previous_status": previous, "source": source });
        if state.status != previous {
            match state.status {
                AgentStatus::Active => {
                    self.emit(EventKind::AgentActive, &state, extra.clone()).await
                }
                AgentStatus::Idle => {
                    self.emit(EventKind::AgentIdle, &state, extra.clone()).await
                }
                _ => {}
            }
        }
        if source == HeartbeatSource::SessionError {
            self.emit(EventKind::AgentError, &state, extra).await;
        }
        Ok(state)
    }

    pub async fn sweep(&self, team: &str) -> Result<SweepReport> {
        self.sweep_at(team, Utc::now()).await
    }

    /// Count a miss for every active agent whose last heartbeat is older
    /// than the threshold at `now`, and deactivate those out of grace.
    ///
    /// Tasks still owned by any inactive or terminated agent are returned
    /// to pending in the same pass, so work left behind by an earlier
    /// failed reassignment is picked up here. A reassignment failure is
    /// returned after the inactivations have been announced.
    pub async fn sweep_at(&self, team: &str, now: DateTime<Utc>) -> Result<SweepReport> {
        validate_name("Team", team)?;
        let files = self.files(team);
        let threshold = self.config.stale_threshold;
        let grace = self.config.grace_misses;

        let (checked, missed, inactivated, dead) = blocking(move || {
            files.store.locks().with_lock(&files.lock_path(), || {
                let mut checked = 0;
                let mut missed = Vec::new();
                let mut inactivated = Vec::new();
                let mut dead = HashMap::new();
                for mut state in files.list()? {
                    match state.status {
                        AgentStatus::Active => {}
                        AgentStatus::Inactive => {
                            dead.insert(state.id, ReassignReason::Inactive);
                            continue;
                        }
                        AgentStatus::Terminated => {
                            dead.insert(state.id, ReassignReason::Terminated);
                            continue;
                        }
                        _ => continue,
                    }
                    checked += 1;
                    if !state.is_stale(now, threshold) {
                        continue;
                    }
                    state.consecutive_misses += 1;
                    if state.consecutive_misses >= grace {
                        state.status = AgentStatus::Inactive;
                        dead.insert(state.id.clone(), ReassignReason::Inactive);
                        inactivated.push(state.clone());
                    } else {
                        missed.push(state.id.clone());
                    }
                    state.updated_at = Utc::now();
                    files.store.write_atomic(&files.path(&state.id), &state)?;
                }
                Ok((checked, missed, inactivated, dead))
            })
        })
        .await?;

        let (reassigned, failure) = match self.tasks.reassign_owned_by(team, dead).await {
            Ok(reassigned) => (reassigned, None),
            Err(e) => {
                tlog_error!("Failed to reassign tasks in team {}: {}", team, e);
                (Vec::new(), Some(e))
            }
        };

        let mut report = SweepReport {
            checked,
            missed,
            reassigned: reassigned.iter().map(|(_, task)| task.id).collect(),
            ..Default::default()
        };
        for state in inactivated {
            tlog_warn!(
                "Agent {} in team {} missed {} heartbeats, marking inactive",
                state.id,
                team,
                state.consecutive_misses
            );
            let owned: Vec<TaskId> = reassigned
                .iter()
                .filter(|(owner, _)| *owner == state.id)
                .map(|(_, task)| task.id)
                .collect();

            let text = format!(
                "Agent {} ({}) stopped responding after {} missed heartbeats; \
                 {} task(s) returned to pending.",
                state.id,
                state.role,
                state.consecutive_misses,
                owned.len()
            );
            if let Err(e) = self.notify_leader(team, &state.id, &text).await {
                tlog_warn!("Failed to notify leader of team {}: {}", team, e);
            }

            self.emit(
                EventKind::AgentInactive,
                &state,
                json!({ "misses": state.consecutive_misses, "reassigned": owned }),
            )
            .await;
            report.inactivated.push(state.id);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn notify_leader(&self, team: &str, about: &AgentId, text: &str) -> Result<()> {
        let leader = self.teams.get_team(team).await?.leader_id;
        if &leader == about {
            return Ok(());
        }
        self.mailbox.deliver(team, &leader, SYSTEM_SENDER, text).await?;
        Ok(())
    }

    /// Terminate an agent regardless of its state.
    ///
    /// Its tasks are reassigned and its pane killed best-effort. Killing an
    /// already terminated agent is an error. If reassignment fails the error
    /// is returned and the next sweep returns the agent's tasks.
    pub async fn force_kill(&self, team: &str, id: &AgentId) -> Result<KillReport> {
        validate_name("Team", team)?;
        validate_name("Agent", id.as_str())?;
        let files = self.files(team);
        let agent = id.clone();
        let (state, pane) = blocking(move || {
            files.update(&agent, |state| {
                if state.status == AgentStatus::Terminated {
                    return Err(Error::InvalidState(format!(
                        "Agent {} is already terminated",
                        state.id
                    )));
                }
                let pane = state.pane_id.take();
                state.session_id = None;
                state.status = AgentStatus::Terminated;
                Ok((state.clone(), pane))
            })
        })
        .await?;

        let pane_killed = match pane {
            Some(pane) => {
                let panes = Arc::clone(&self.panes);
                let target = pane.clone();
                match blocking(move || panes.kill_pane(&target)).await {
                    Ok(()) => true,
                    Err(e) => {
                        tlog_warn!("Could not kill pane {} of agent {}: {}", pane, id, e);
                        false
                    }
                }
            }
            None => false,
        };

        let reassigned = task_ids(
            &self
                .tasks
                .reassign_agent_tasks(team, id, ReassignReason::Terminated)
                .await?,
        );

        tlog!("Agent {} in team {} force-killed", id, team);
        self.emit(
            EventKind::AgentTerminated,
            &state,
            json!({ "reason": "force_kill", "reassigned": reassigned }),
        )
        .await;
        Ok(KillReport {
            agent: state,
            reassigned,
            pane_killed,
        })
    }

    /// Ask an agent to wind down. The agent confirms with
    /// [`confirm_shutdown`](Self::confirm_shutdown).
    pub async fn request_shutdown(&self, team: &str, id: &AgentId) -> Result<AgentState> {
        validate_name("Team", team)?;
        validate_name("Agent", id.as_str())?;
        let files = self.files(team);
        let agent = id.clone();
        let state = blocking(move || {
            files.update(&agent, |state| {
                match state.status {
                    AgentStatus::Spawning | AgentStatus::Active | AgentStatus::Idle => {
                        state.status = AgentStatus::ShuttingDown;
                        Ok(state.clone())
                    }
                    AgentStatus::ShuttingDown => Err(Error::InvalidState(format!(
                        "Agent {} is already shutting down",
                        state.id
                    ))),
                    AgentStatus::Inactive | AgentStatus::Terminated => Err(Error::InvalidState(
                        format!("Agent {} is {}", state.id, state.status),
                    )),
                }
            })
        })
        .await?;

        if let Err(e) = self
            .mailbox
            .deliver(team, id, SYSTEM_SENDER, SHUTDOWN_NOTICE)
            .await
        {
            tlog_warn!("Failed to deliver shutdown request to {}: {}", id, e);
        }
        tlog!("Shutdown requested for agent {} in team {}", id, team);
        self.emit(EventKind::AgentShutdownRequested, &state, json!({})).await;
        Ok(state)
    }

    /// Complete a requested shutdown: the agent becomes terminated and its
    /// remaining tasks are reassigned.
    pub async fn confirm_shutdown(&self, team: &str, id: &AgentId) -> Result<AgentState> {
        validate_name("Team", team)?;
        validate_name("Agent", id.as_str())?;
        let files = self.files(team);
        let agent = id.clone();
        let state = blocking(move || {
            files.update(&agent, |state| {
                if state.status != AgentStatus::ShuttingDown {
                    return Err(Error::InvalidState(format!(
                        "Agent {} has no pending shutdown (status {})",
                        state.id, state.status
                    )));
                }
                state.status = AgentStatus::Terminated;
                state.session_id = None;
                Ok(state.clone())
            })
        })
        .await?;

        let reassigned = task_ids(
            &self
                .tasks
                .reassign_agent_tasks(team, id, ReassignReason::ShutDown)
                .await?,
        );
        tlog!("Agent {} in team {} shut down", id, team);
        self.emit(
            EventKind::AgentTerminated,
            &state,
            json!({ "reason": "shutdown", "reassigned": reassigned }),
        )
        .await;
        Ok(state)
    }

    pub async fn get_agent(&self, team: &str, id: &AgentId) -> Result<AgentState> {
        validate_name("Team", team)?;
        validate_name("Agent", id.as_str())?;
        let files = self.files(team);
        let id = id.clone();
        blocking(move || {
            files.store.read_validated(&files.path(&id)).map_err(|e| match e {
                Error::FileNotFound(_) => Error::AgentNotFound(id.to_string()),
                other => other,
            })
        })
        .await
    }

    /// Every agent record of the team, including terminated ones, in
    /// registration order.
    pub async fn list_agents(&self, team: &str) -> Result<Vec<AgentState>> {
        validate_name("Team", team)?;
        let files = self.files(team);
        blocking(move || files.list()).await
    }

    /// Run [`sweep`](Self::sweep) for `team` every `sweep_interval` until the
    /// returned handle is stopped.
    pub fn spawn_sweeper(self: &Arc<Self>, team: &str) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let lifecycle = Arc::clone(self);
        let team = team.to_string();

        tlog_debug!("AgentLifecycle::spawn_sweeper team={}", team);

        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(lifecycle.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        tlog_debug!("Sweeper for team {} cancelled", team);
                        break;
                    }
                    _ = interval.tick() => {
                        match lifecycle.sweep(&team).await {
                            Ok(report) if !report.inactivated.is_empty() => {
                                tlog!(
                                    "Sweep of team {} inactivated {:?}",
                                    team,
                                    report.inactivated
                                );
                            }
                            Ok(_) => {}
                            Err(e) => tlog_error!("Sweep of team {} failed: {}", team, e),
                        }
                    }
                }
            }
        });

        SweeperHandle { cancel, join }
    }
}

fn task_ids(tasks: &[Task]) -> Vec<TaskId> {
    tasks.iter().map(|t| t.id).collect()
}
