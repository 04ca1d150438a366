//! Dispatch rules: declarative reactions to domain events.
//!
//! Rules are persisted in the team aggregate. Conditions and actions are
//! closed, tagged enums so the engine can match them exhaustively.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::orchestration::bus::{DispatchEvent, EventKind};

/// Maximum number of entries kept in a team's dispatch log.
pub const DISPATCH_LOG_CAP: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRule {
    pub id: String,
    pub event_type: EventKind,
    #[serde(default)]
    pub condition: Option<DispatchCondition>,
    pub action: DispatchAction,
    /// Higher runs first. Ties keep declaration order.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DispatchRule {
    /// An enabled, unconditional rule with priority 0 and a generated id.
    pub fn new(event_type: EventKind, action: DispatchAction) -> Self {
        Self {
            id: format!("rule-{}", Uuid::new_v4().simple()),
            event_type,
            condition: None,
            action,
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_condition(mut self, condition: DispatchCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn applies_to(&self, kind: EventKind) -> bool {
        self.enabled && self.event_type == kind
    }
}

/// Enabled rules for `kind`, highest priority first. The sort is stable,
/// so equal priorities keep declaration order.
pub fn rules_for(rules: &[DispatchRule], kind: EventKind) -> Vec<DispatchRule> {
    let mut matching: Vec<DispatchRule> = rules
        .iter()
        .filter(|r| r.applies_to(kind))
        .cloned()
        .collect();
    matching.sort_by(|a, b| b.priority.cmp(&a.priority));
    matching
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchCondition {
    /// Compare a payload field against a literal.
    SimpleMatch {
        field: String,
        operator: Operator,
        value: Value,
    },
    /// Compare a live aggregate against a threshold.
    ResourceCount {
        resource: Resource,
        operator: Operator,
        value: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl Operator {
    /// Apply the operator to `actual` (left) and `expected` (right).
    ///
    /// Numbers compare numerically and strings lexicographically; any other
    /// ordering comparison is false. `contains` works on strings (substring)
    /// and arrays (element).
    pub fn compare(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Operator::Eq => values_equal(actual, expected),
            Operator::Neq => !values_equal(actual, expected),
            Operator::Gt => order(actual, expected).map(|o| o.is_gt()).unwrap_or(false),
            Operator::Gte => order(actual, expected).map(|o| o.is_ge()).unwrap_or(false),
            Operator::Lt => order(actual, expected).map(|o| o.is_lt()).unwrap_or(false),
            Operator::Lte => order(actual, expected).map(|o| o.is_le()).unwrap_or(false),
            Operator::Contains => match (actual, expected) {
                (Value::String(haystack), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
                _ => false,
            },
        }
    }

    pub fn compare_count(&self, actual: i64, expected: i64) -> bool {
        self.compare(&Value::from(actual), &Value::from(expected))
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    ActiveAgents,
    IdleAgents,
    /// Spawning, active or idle.
    LiveAgents,
    PendingTasks,
    /// Pending with every dependency satisfied.
    ReadyTasks,
    InProgressTasks,
    CompletedTasks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchAction {
    /// Record a message in the dispatch log.
    Log {
        #[serde(default)]
        message: Option<String>,
    },
    /// Deliver a message to the team leader's inbox. `{field}` placeholders
    /// are filled from the event payload.
    NotifyLeader { message: String },
    /// Claim the oldest ready task for the agent named by `agent_field`.
    AssignTask {
        #[serde(default = "default_agent_field")]
        agent_field: String,
    },
}

fn default_agent_field() -> String {
    "agent_id".to_string()
}

impl DispatchAction {
    pub fn log(message: &str) -> Self {
        DispatchAction::Log {
            message: Some(message.to_string()),
        }
    }

    pub fn notify_leader(message: &str) -> Self {
        DispatchAction::NotifyLeader {
            message: message.to_string(),
        }
    }

    pub fn assign_task() -> Self {
        DispatchAction::AssignTask {
            agent_field: default_agent_field(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispatchAction::Log { .. } => "log",
            DispatchAction::NotifyLeader { .. } => "notify_leader",
            DispatchAction::AssignTask { .. } => "assign_task",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchLogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub rule_id: String,
    pub event_type: EventKind,
    pub success: bool,
    pub details: String,
}

impl DispatchLogEntry {
    pub fn new(rule_id: &str, event_type: EventKind, success: bool, details: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            rule_id: rule_id.to_string(),
            event_type,
            success,
            details,
        }
    }
}

/// Append `entry`, evicting the oldest entries beyond [`DISPATCH_LOG_CAP`].
pub fn push_capped(log: &mut Vec<DispatchLogEntry>, entry: DispatchLogEntry) {
    log.push(entry);
    if log.len() > DISPATCH_LOG_CAP {
        let excess = log.len() - DISPATCH_LOG_CAP;
        log.drain(..excess);
    }
}

/// `{field}` or `{nested.field}`.
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_.]+)\}").unwrap());

/// Fill `{field}` placeholders from the event. `{type}` and `{team_name}`
/// refer to the event itself; unknown fields are left as written.
pub fn render_template(template: &str, event: &DispatchEvent) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            match name {
                "type" => event.kind.to_string(),
                "team_name" => event.team_name.clone(),
                _ => match event.field(name) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) => "null".to_string(),
                    Some(other) => other.to_string(),
                    None => caps[0].to_string(),
                },
            }
        })
        .into_owned()
}
