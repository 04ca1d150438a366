//! Rule dispatch: reacts to bus events with the team's dispatch rules.
//!
//! The engine subscribes to every event kind. For each event it evaluates the
//! team's enabled rules for that kind, highest priority first, and records one
//! dispatch log entry per rule. Actions may call back into the task graph,
//! which emits further events; a depth counter on the engine bounds the chain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;

use crate::agent::{AgentId, AgentStatus};
use crate::config::DEFAULT_MAX_DISPATCH_DEPTH;
use crate::core::graph::{ready_from, TaskGraph};
use crate::core::task::TaskStatus;
use crate::orchestration::bus::{DispatchEvent, EventBus, EventKind, Subscription};
use crate::orchestration::health::AgentLifecycle;
use crate::orchestration::rules::{
    render_template, rules_for, DispatchAction, DispatchCondition, DispatchLogEntry, DispatchRule,
    Resource,
};
use crate::state::{Layout, Store};
use crate::team::inbox::SYSTEM_SENDER;
use crate::team::{Mailbox, TeamConfig, TeamStore};
use crate::{tlog, tlog_debug, tlog_warn, Error, Result};

/// Decrements the engine depth when evaluation of one event ends.
struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct DispatchEngine {
    teams: TeamStore,
    mailbox: Mailbox,
    tasks: Arc<TaskGraph>,
    agents: Arc<AgentLifecycle>,
    max_depth: usize,
    depth: AtomicUsize,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl DispatchEngine {
    pub fn new(
        store: Store,
        layout: Layout,
        tasks: Arc<TaskGraph>,
        agents: Arc<AgentLifecycle>,
        max_depth: usize,
    ) -> Self {
        Self {
            teams: TeamStore::new(store, layout.clone()),
            mailbox: Mailbox::new(store, layout),
            tasks,
            agents,
            max_depth: if max_depth == 0 {
                DEFAULT_MAX_DISPATCH_DEPTH
            } else {
                max_depth
            },
            depth: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Current nesting of event evaluation.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Subscribe the engine to every event kind on `bus`.
    ///
    /// Handlers hold a weak reference, so dropping the engine disables them.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for kind in EventKind::ALL {
            let engine: Weak<Self> = Arc::downgrade(self);
            subscriptions.push(bus.subscribe(kind, move |event| {
                let engine = engine.clone();
                async move {
                    match engine.upgrade() {
                        Some(engine) => engine.handle_event(event).await.map(|_| ()),
                        None => Ok(()),
                    }
                }
            }));
        }
        tlog_debug!("DispatchEngine attached to {} event kinds", subscriptions.len());
    }

    /// Remove every subscription made by [`attach`](Self::attach).
    pub fn detach(&self) {
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    }

    /// Evaluate the team's rules for `event` and persist the log entries.
    ///
    /// Returns the entries written. Beyond the depth cap nothing is
    /// evaluated and the result is empty.
    pub async fn handle_event(&self, event: DispatchEvent) -> Result<Vec<DispatchLogEntry>> {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = DepthGuard(&self.depth);
        if depth > self.max_depth {
            tlog_warn!(
                "Dispatch depth {} exceeds max {}, dropping {} for team {}",
                depth,
                self.max_depth,
                event.kind,
                event.team_name
            );
            return Ok(Vec::new());
        }

        let team = match self.teams.get_team(&event.team_name).await {
            Ok(team) => team,
            Err(Error::TeamNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let rules = rules_for(&team.dispatch_rules, event.kind);
        if rules.is_empty() {
            return Ok(Vec::new());
        }
        tlog_debug!(
            "Dispatching {} for team {} at depth {}: {} rule(s)",
            event.kind,
            team.name,
            depth,
            rules.len()
        );

        let mut entries = Vec::with_capacity(rules.len());
        for rule in &rules {
            entries.push(self.evaluate(&team, rule, &event).await);
        }
        self.teams
            .append_dispatch_log(&team.name, entries.clone())
            .await?;
        Ok(entries)
    }

    /// Evaluate one rule. Failures become unsuccessful log entries.
    async fn evaluate(
        &self,
        team: &TeamConfig,
        rule: &DispatchRule,
        event: &DispatchEvent,
    ) -> DispatchLogEntry {
        let matched = match &rule.condition {
            None => Ok(true),
            Some(condition) => self.condition_holds(condition, event).await,
        };

        let (success, details) = match matched {
            Ok(false) => (true, "condition not met".to_string()),
            Err(e) => {
                tlog_warn!("Rule {} condition failed: {}", rule.id, e);
                (false, format!("condition failed: {}", e))
            }
            Ok(true) => match self.execute(team, &rule.action, event).await {
                Ok(details) => (true, details),
                Err(e) => {
                    tlog_warn!("Rule {} action {} failed: {}", rule.id, rule.action.name(), e);
                    (false, format!("{} failed: {}", rule.action.name(), e))
                }
            },
        };
        DispatchLogEntry::new(&rule.id, event.kind, success, details)
    }

    async fn condition_holds(
        &self,
        condition: &DispatchCondition,
        event: &DispatchEvent,
    ) -> Result<bool> {
        match condition {
            DispatchCondition::SimpleMatch {
                field,
                operator,
                value,
            } => {
                let actual = event.field(field).unwrap_or(&Value::Null);
                Ok(operator.compare(actual, value))
            }
            DispatchCondition::ResourceCount {
                resource,
                operator,
                value,
            } => {
                let count = self.resource_count(&event.team_name, *resource).await?;
                Ok(operator.compare_count(count, *value))
            }
        }
    }

    /// Live aggregate over the team's current state.
    pub async fn resource_count(&self, team: &str, resource: Resource) -> Result<i64> {
        let count = match resource {
            Resource::ActiveAgents | Resource::IdleAgents | Resource::LiveAgents => {
                let agents = self.agents.list_agents(team).await?;
                agents
                    .iter()
                    .filter(|a| match resource {
                        Resource::ActiveAgents => a.status == AgentStatus::Active,
                        Resource::IdleAgents => a.status == AgentStatus::Idle,
                        _ => a.status.is_live(),
                    })
                    .count()
            }
            Resource::ReadyTasks => ready_from(&self.tasks.list_tasks(team).await?).len(),
            Resource::PendingTasks | Resource::InProgressTasks | Resource::CompletedTasks => {
                let wanted = match resource {
                    Resource::PendingTasks => TaskStatus::Pending,
                    Resource::InProgressTasks => TaskStatus::InProgress,
                    _ => TaskStatus::Completed,
                };
                self.tasks
                    .list_tasks(team)
                    .await?
                    .iter()
                    .filter(|t| t.status == wanted)
                    .count()
            }
        };
        Ok(count as i64)
    }

    /// Run an action and describe what it did.
    async fn execute(
        &self,
        team: &TeamConfig,
        action: &DispatchAction,
        event: &DispatchEvent,
    ) -> Result<String> {
        match action {
            DispatchAction::Log { message } => {
                let text = render_template(message.as_deref().unwrap_or("{type} event"), event);
                tlog!("[dispatch {}] {}", team.name, text);
                Ok(text)
            }
            DispatchAction::NotifyLeader { message } => {
                let text = render_template(message, event);
                self.mailbox
                    .deliver(&team.name, &team.leader_id, SYSTEM_SENDER, &text)
                    .await?;
                Ok(format!("notified {}: {}", team.leader_id, text))
            }
            DispatchAction::AssignTask { agent_field } => {
                let agent = match event.field(agent_field) {
                    Some(Value::String(id)) if !id.is_empty() => AgentId::new(id.clone()),
                    _ => {
                        return Err(Error::Validation(format!(
                            "event payload has no agent in '{}'",
                            agent_field
                        )))
                    }
                };
                let state = self.agents.get_agent(&team.name, &agent).await?;
                if !state.status.is_live() {
                    return Err(Error::InvalidState(format!(
                        "Agent {} is {}",
                        agent, state.status
                    )));
                }

                let ready = self.tasks.ready_tasks(&team.name).await?;
                let Some(task) = ready.first() else {
                    return Ok("no ready task to assign".to_string());
                };
                let claimed = self.tasks.claim_task(&team.name, &task.id, &agent).await?;
                Ok(format!("assigned task {} to {}", claimed.id.short(), agent))
            }
        }
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("max_depth", &self.max_depth)
            .field("depth", &self.depth())
            .finish()
    }
}
