//! Team aggregate: membership, leader, dispatch rules and dispatch log.
//!
//! The whole aggregate is one `team.json` guarded by the team lock.

pub mod inbox;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::orchestration::rules::{push_capped, DispatchLogEntry, DispatchRule, DISPATCH_LOG_CAP};
use crate::state::{Layout, Schema, Store};
use crate::util::{blocking, validate_name};
use crate::{tlog, Error, Result};

pub use inbox::{InboxMessage, Mailbox};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub agent_id: AgentId,
    pub role: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    pub leader_id: AgentId,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub dispatch_rules: Vec<DispatchRule>,
    #[serde(default)]
    pub dispatch_log: Vec<DispatchLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TeamConfig {
    pub fn new(name: &str, leader_id: &AgentId) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            leader_id: leader_id.clone(),
            members: Vec::new(),
            dispatch_rules: Vec::new(),
            dispatch_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn member(&self, agent: &AgentId) -> Option<&Member> {
        self.members.iter().find(|m| &m.agent_id == agent)
    }

    pub fn rule(&self, rule_id: &str) -> Option<&DispatchRule> {
        self.dispatch_rules.iter().find(|r| r.id == rule_id)
    }
}

impl Schema for TeamConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        validate_name("Team", &self.name).map_err(|e| e.to_string())?;
        if self.dispatch_log.len() > DISPATCH_LOG_CAP {
            return Err(format!(
                "dispatch log has {} entries (max {})",
                self.dispatch_log.len(),
                DISPATCH_LOG_CAP
            ));
        }
        for (i, rule) in self.dispatch_rules.iter().enumerate() {
            if rule.id.is_empty() {
                return Err("dispatch rule id must not be empty".to_string());
            }
            if self.dispatch_rules[..i].iter().any(|r| r.id == rule.id) {
                return Err(format!("duplicate dispatch rule id {}", rule.id));
            }
        }
        Ok(())
    }
}

/// Reads and locked updates of team aggregates.
#[derive(Debug, Clone)]
pub struct TeamStore {
    store: Store,
    layout: Layout,
}

impl TeamStore {
    pub fn new(store: Store, layout: Layout) -> Self {
        Self { store, layout }
    }

    /// Create a new team led by `leader`.
    pub async fn create_team(&self, name: &str, leader: &AgentId) -> Result<TeamConfig> {
        validate_name("Team", name)?;
        validate_name("Agent", leader.as_str())?;
        let store = self.store;
        let lock = self.layout.team_lock(name);
        let path = self.layout.team_file(name);
        let team = TeamConfig::new(name, leader);

        let created = blocking(move || {
            store.locks().with_lock(&lock, || {
                if path.exists() {
                    return Err(Error::InvalidState(format!(
                        "Team {} already exists",
                        team.name
                    )));
                }
                store.write_atomic(&path, &team)?;
                Ok(team)
            })
        })
        .await?;

        tlog!("Team {} created, leader {}", created.name, created.leader_id);
        Ok(created)
    }

    pub async fn get_team(&self, name: &str) -> Result<TeamConfig> {
        validate_name("Team", name)?;
        let store = self.store;
        let path = self.layout.team_file(name);
        let name = name.to_string();
        blocking(move || {
            store.read_validated(&path).map_err(|e| match e {
                Error::FileNotFound(_) => Error::TeamNotFound(name),
                other => other,
            })
        })
        .await
    }

    /// Names of every team under the root, sorted.
    pub async fn list_teams(&self) -> Result<Vec<String>> {
        let dir = self.layout.teams_dir();
        blocking(move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut names = Vec::new();
            for entry in entries {
                let entry = entry?;
                if entry.path().join("team.json").is_file() {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
            names.sort();
            Ok(names)
        })
        .await
    }

    /// Locked read-modify-write of the aggregate.
    async fn update<R, F>(&self, name: &str, mutator: F) -> Result<R>
    where
        F: FnOnce(&mut TeamConfig) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        validate_name("Team", name)?;
        let store = self.store;
        let lock = self.layout.team_lock(name);
        let path = self.layout.team_file(name);
        let team = name.to_string();
        blocking(move || {
            if !path.exists() {
                return Err(Error::TeamNotFound(team));
            }
            store
                .locked_update(&lock, &path, |config: &mut TeamConfig| {
                    let out = mutator(config)?;
                    config.updated_at = Utc::now();
                    Ok(out)
                })
                .map_err(|e| match e {
                    Error::FileNotFound(_) => Error::TeamNotFound(team),
                    other => other,
                })
        })
        .await
    }

    /// Add `agent` as a member. Re-adding an existing member updates its role.
    pub async fn add_member(&self, name: &str, agent: &AgentId, role: &str) -> Result<TeamConfig> {
        let agent = agent.clone();
        let role = role.to_string();
        self.update(name, move |team| {
            match team.members.iter_mut().find(|m| m.agent_id == agent) {
                Some(member) => member.role = role,
                None => team.members.push(Member {
                    agent_id: agent,
                    role,
                    joined_at: Utc::now(),
                }),
            }
            Ok(team.clone())
        })
        .await
    }

    pub async fn remove_member(&self, name: &str, agent: &AgentId) -> Result<TeamConfig> {
        let agent = agent.clone();
        self.update(name, move |team| {
            let before = team.members.len();
            team.members.retain(|m| m.agent_id != agent);
            if team.members.len() == before {
                return Err(Error::AgentNotFound(agent.to_string()));
            }
            Ok(team.clone())
        })
        .await
    }

    pub async fn set_leader(&self, name: &str, leader: &AgentId) -> Result<TeamConfig> {
        validate_name("Agent", leader.as_str())?;
        let leader = leader.clone();
        self.update(name, move |team| {
            team.leader_id = leader;
            Ok(team.clone())
        })
        .await
    }

    /// Append a rule. Rule ids are unique within a team.
    pub async fn add_rule(&self, name: &str, rule: DispatchRule) -> Result<DispatchRule> {
        let added = self
            .update(name, move |team| {
                if team.rule(&rule.id).is_some() {
                    return Err(Error::Validation(format!(
                        "Dispatch rule {} already exists",
                        rule.id
                    )));
                }
                team.dispatch_rules.push(rule.clone());
                Ok(rule)
            })
            .await?;
        tlog!("Rule {} added to team {} for {}", added.id, name, added.event_type);
        Ok(added)
    }

    pub async fn remove_rule(&self, name: &str, rule_id: &str) -> Result<DispatchRule> {
        let rule_id = rule_id.to_string();
        self.update(name, move |team| {
            let index = team
                .dispatch_rules
                .iter()
                .position(|r| r.id == rule_id)
                .ok_or_else(|| Error::RuleNotFound(rule_id.clone()))?;
            Ok(team.dispatch_rules.remove(index))
        })
        .await
    }

    pub async fn set_rule_enabled(
        &self,
        name: &str,
        rule_id: &str,
        enabled: bool,
    ) -> Result<DispatchRule> {
        let rule_id = rule_id.to_string();
        self.update(name, move |team| {
            let rule = team
                .dispatch_rules
                .iter_mut()
                .find(|r| r.id == rule_id)
                .ok_or_else(|| Error::RuleNotFound(rule_id.clone()))?;
            rule.enabled = enabled;
            Ok(rule.clone())
        })
        .await
    }

    pub async fn list_rules(&self, name: &str) -> Result<Vec<DispatchRule>> {
        Ok(self.get_team(name).await?.dispatch_rules)
    }

    /// Dispatch log, oldest first.
    pub async fn dispatch_log(&self, name: &str) -> Result<Vec<DispatchLogEntry>> {
        Ok(self.get_team(name).await?.dispatch_log)
    }

    /// Append entries to the capped dispatch log in one locked write.
    pub async fn append_dispatch_log(
        &self,
        name: &str,
        entries: Vec<DispatchLogEntry>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.update(name, move |team| {
            for entry in entries {
                push_capped(&mut team.dispatch_log, entry);
            }
            Ok(())
        })
        .await
    }
}
