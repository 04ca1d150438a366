//! Agent records and the liveness state machine.
//!
//! Task ownership lives on `Task::owner`; an agent record only carries
//! liveness and opaque session metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::Schema;
use crate::util::validate_name;

/// Identifier of an agent within a team. Also its file name on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawning,
    Active,
    Idle,
    Inactive,
    ShuttingDown,
    Terminated,
}

impl AgentStatus {
    /// Inactive and terminated agents reject heartbeats outright.
    pub fn accepts_heartbeat(&self) -> bool {
        !matches!(self, AgentStatus::Inactive | AgentStatus::Terminated)
    }

    /// Passive transition driven by an accepted heartbeat.
    ///
    /// - Spawning -> Active on an explicit call
    /// - Active -> Idle when the session reports idle
    /// - Idle -> Active on session activity, a tool execution or an explicit call
    ///
    /// Every other combination keeps the current status.
    pub fn after_heartbeat(self, source: HeartbeatSource) -> AgentStatus {
        use AgentStatus::*;
        use HeartbeatSource::*;
        match (self, source) {
            (Spawning, ExplicitCall) => Active,
            (Active, SessionIdle) => Idle,
            (Idle, SessionUpdated | ToolExecution | ExplicitCall) => Active,
            (status, _) => status,
        }
    }

    /// Spawning, active or idle.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            AgentStatus::Spawning | AgentStatus::Active | AgentStatus::Idle
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Spawning => write!(f, "spawning"),
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Inactive => write!(f, "inactive"),
            AgentStatus::ShuttingDown => write!(f, "shutting_down"),
            AgentStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Where a heartbeat came from. Session lifecycle events from the process
/// backend arrive as the `session_*` and `tool_execution` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatSource {
    ExplicitCall,
    SessionIdle,
    SessionUpdated,
    ToolExecution,
    SessionError,
}

impl std::fmt::Display for HeartbeatSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatSource::ExplicitCall => write!(f, "explicit_call"),
            HeartbeatSource::SessionIdle => write!(f, "session_idle"),
            HeartbeatSource::SessionUpdated => write!(f, "session_updated"),
            HeartbeatSource::ToolExecution => write!(f, "tool_execution"),
            HeartbeatSource::SessionError => write!(f, "session_error"),
        }
    }
}

/// Registration request for a new agent.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub id: AgentId,
    pub role: String,
    pub pane_id: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Map<String, Value>,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, role: &str) -> Self {
        Self {
            id: AgentId::new(id),
            role: role.to_string(),
            pane_id: None,
            session_id: None,
            metadata: Map::new(),
        }
    }

    pub fn with_pane(mut self, pane_id: &str) -> Self {
        self.pane_id = Some(pane_id.to_string());
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

/// Persisted liveness record for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub team_name: String,
    pub role: String,
    pub status: AgentStatus,
    pub heartbeat_ts: DateTime<Utc>,
    pub consecutive_misses: u32,
    pub last_heartbeat_source: Option<HeartbeatSource>,
    pub pane_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    pub fn register(team: &str, spec: AgentSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id,
            team_name: team.to_string(),
            role: spec.role,
            status: AgentStatus::Spawning,
            heartbeat_ts: now,
            consecutive_misses: 0,
            last_heartbeat_source: None,
            pane_id: spec.pane_id,
            session_id: spec.session_id,
            metadata: spec.metadata,
            registered_at: now,
            updated_at: now,
        }
    }

    /// True when the last heartbeat is strictly older than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        match (now - self.heartbeat_ts).to_std() {
            Ok(elapsed) => elapsed > threshold,
            Err(_) => false, // heartbeat in the future
        }
    }
}

impl Schema for AgentState {
    fn validate(&self) -> std::result::Result<(), String> {
        validate_name("Agent", self.id.as_str()).map_err(|e| e.to_string())?;
        if self.team_name.is_empty() {
            return Err("agent team_name must not be empty".to_string());
        }
        if self.role.is_empty() {
            return Err("agent role must not be empty".to_string());
        }
        Ok(())
    }
}
