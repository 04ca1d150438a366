//! Task data model for the shared dependency graph.
//!
//! Tasks are the units of work agents claim and complete. Each task
//! tracks its status, owner, dependencies and the transpose of those
//! dependencies (`blocks`), so a completion can find its dependents
//! without scanning the whole team.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::state::Schema;

/// Prefix of the advisory warning attached when a task is claimed before
/// its dependencies are done. Cascade-unblock only clears warnings that
/// start with it.
pub const DEPENDENCY_WARNING_PREFIX: &str = "Warning: dependencies are not met:";

/// Unique identifier for a task within a team.
///
/// Uses UUID v7, so ids sort in creation order. Also the task's file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new time-ordered task identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not yet claimed.
    #[default]
    Pending,
    /// Claimed by an agent.
    InProgress,
    /// Done. Terminal.
    Completed,
}

impl TaskStatus {
    /// Whether the public API may move a task from `self` to `to`.
    ///
    /// Only forward moves and same-state no-ops are allowed. The reverse
    /// move `InProgress -> Pending` is reserved for reassignment and never
    /// passes this check.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::Pending)
                | (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::Completed, TaskStatus::Completed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A single task in a team's dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique, immutable identifier.
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Agent currently working on the task.
    pub owner: Option<AgentId>,
    /// Tasks that must complete before this one. Ordered, no duplicates.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Tasks listing this one as a dependency.
    #[serde(default)]
    pub blocks: Vec<TaskId>,
    /// Advisory text, e.g. claimed with unmet dependencies or reassigned.
    pub warning: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task with a fresh id and no edges.
    pub fn new(fields: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: fields.title,
            description: fields.description,
            priority: fields.priority,
            status: TaskStatus::Pending,
            owner: None,
            dependencies: Vec::new(),
            blocks: Vec::new(),
            warning: None,
            claimed_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// True when the current warning was produced by a claim with unmet
    /// dependencies.
    pub fn has_dependency_warning(&self) -> bool {
        self.warning
            .as_deref()
            .map(|w| w.starts_with(DEPENDENCY_WARNING_PREFIX))
            .unwrap_or(false)
    }

    /// Add `id` to `blocks` unless already present.
    pub fn add_blocked(&mut self, id: TaskId) {
        if !self.blocks.contains(&id) {
            self.blocks.push(id);
        }
    }

    pub fn remove_blocked(&mut self, id: &TaskId) {
        self.blocks.retain(|b| b != id);
    }
}

/// Build the advisory warning listing unmet dependencies.
pub fn dependency_warning(unmet: &[TaskId]) -> String {
    let ids: Vec<String> = unmet.iter().map(|id| id.to_string()).collect();
    format!("{} {}", DEPENDENCY_WARNING_PREFIX, ids.join(", "))
}

impl Schema for Task {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("task title must not be empty".to_string());
        }
        if self.dependencies.contains(&self.id) {
            return Err(format!("task {} depends on itself", self.id));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.dependencies.iter().find(|d| !seen.insert(**d)) {
            return Err(format!("duplicate dependency {}", dup));
        }
        if self.status == TaskStatus::Completed && self.completed_at.is_none() {
            return Err("completed task must have completed_at".to_string());
        }
        Ok(())
    }
}

/// Caller-supplied fields for a new task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: TaskPriority,
}

impl NewTask {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Partial update for [`TaskGraph::update_task`](crate::core::TaskGraph::update_task).
///
/// `None` leaves a field untouched. Nested options distinguish "leave" from
/// "clear" for nullable fields. Identity and creation time are not part of
/// the patch and are therefore always preserved.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<TaskPriority>,
    pub status: Option<TaskStatus>,
    pub owner: Option<Option<AgentId>>,
    pub dependencies: Option<Vec<TaskId>>,
    pub warning: Option<Option<String>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn owner(mut self, owner: Option<AgentId>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = Some(dependencies);
        self
    }

    pub fn warning(mut self, warning: Option<String>) -> Self {
        self.warning = Some(warning);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.status.is_none()
            && self.owner.is_none()
            && self.dependencies.is_none()
            && self.warning.is_none()
    }
}
