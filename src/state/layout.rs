//! On-disk layout of the shared storage root.
//!
//! ```text
//! <root>/teams/<team>/team.json            team aggregate      lock: teams/<team>/.lock
//! <root>/teams/<team>/tasks/<id>.json      one file per task   lock: tasks/.lock
//! <root>/teams/<team>/agents/<id>.json     one file per agent  lock: agents/.lock
//! <root>/teams/<team>/inboxes/<id>.json    one inbox per agent lock: inboxes/.lock
//! <root>/logs/troupe.log
//! ```
//!
//! File names are derived from entity ids; callers validate team and agent
//! names before they reach these functions.

use std::path::{Path, PathBuf};

use crate::agent::AgentId;
use crate::core::task::TaskId;

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn teams_dir(&self) -> PathBuf {
        self.root.join("teams")
    }

    pub fn team_dir(&self, team: &str) -> PathBuf {
        self.teams_dir().join(team)
    }

    pub fn team_file(&self, team: &str) -> PathBuf {
        self.team_dir(team).join("team.json")
    }

    pub fn team_lock(&self, team: &str) -> PathBuf {
        self.team_dir(team).join(LOCK_FILE)
    }

    pub fn tasks_dir(&self, team: &str) -> PathBuf {
        self.team_dir(team).join("tasks")
    }

    pub fn task_file(&self, team: &str, id: &TaskId) -> PathBuf {
        self.tasks_dir(team).join(format!("{}.json", id))
    }

    pub fn tasks_lock(&self, team: &str) -> PathBuf {
        self.tasks_dir(team).join(LOCK_FILE)
    }

    pub fn agents_dir(&self, team: &str) -> PathBuf {
        self.team_dir(team).join("agents")
    }

    pub fn agent_file(&self, team: &str, id: &AgentId) -> PathBuf {
        self.agents_dir(team).join(format!("{}.json", id))
    }

    pub fn agents_lock(&self, team: &str) -> PathBuf {
        self.agents_dir(team).join(LOCK_FILE)
    }

    pub fn inboxes_dir(&self, team: &str) -> PathBuf {
        self.team_dir(team).join("inboxes")
    }

    pub fn inbox_file(&self, team: &str, id: &AgentId) -> PathBuf {
        self.inboxes_dir(team).join(format!("{}.json", id))
    }

    pub fn inboxes_lock(&self, team: &str) -> PathBuf {
        self.inboxes_dir(team).join(LOCK_FILE)
    }
}
