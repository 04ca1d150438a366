//! In-process pub/sub for domain events.
//!
//! Handlers run sequentially in registration order and are awaited by
//! `emit`, so a cascade triggered by one event completes before the emitter
//! returns. A failing or panicking handler is logged and skipped.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{tlog_trace, tlog_warn, Error, Result};

/// Event names as they appear in rules and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.updated")]
    TaskUpdated,
    #[serde(rename = "task.claimed")]
    TaskClaimed,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.unblocked")]
    TaskUnblocked,
    #[serde(rename = "task.reassigned")]
    TaskReassigned,
    #[serde(rename = "task.deleted")]
    TaskDeleted,
    #[serde(rename = "agent.registered")]
    AgentRegistered,
    #[serde(rename = "agent.active")]
    AgentActive,
    #[serde(rename = "agent.idle")]
    AgentIdle,
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "agent.inactive")]
    AgentInactive,
    #[serde(rename = "agent.shutdown_requested")]
    AgentShutdownRequested,
    #[serde(rename = "agent.terminated")]
    AgentTerminated,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        EventKind::TaskCreated,
        EventKind::TaskUpdated,
        EventKind::TaskClaimed,
        EventKind::TaskCompleted,
        EventKind::TaskUnblocked,
        EventKind::TaskReassigned,
        EventKind::TaskDeleted,
        EventKind::AgentRegistered,
        EventKind::AgentActive,
        EventKind::AgentIdle,
        EventKind::AgentError,
        EventKind::AgentInactive,
        EventKind::AgentShutdownRequested,
        EventKind::AgentTerminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task.created",
            EventKind::TaskUpdated => "task.updated",
            EventKind::TaskClaimed => "task.claimed",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskUnblocked => "task.unblocked",
            EventKind::TaskReassigned => "task.reassigned",
            EventKind::TaskDeleted => "task.deleted",
            EventKind::AgentRegistered => "agent.registered",
            EventKind::AgentActive => "agent.active",
            EventKind::AgentIdle => "agent.idle",
            EventKind::AgentError => "agent.error",
            EventKind::AgentInactive => "agent.inactive",
            EventKind::AgentShutdownRequested => "agent.shutdown_requested",
            EventKind::AgentTerminated => "agent.terminated",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown event type: {}", s)))
    }
}

/// A domain event. Transient: never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub team_name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl DispatchEvent {
    /// Build an event. A non-object payload is stored under `"value"`.
    pub fn new(kind: EventKind, team: &str, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: Uuid::new_v4(),
            kind,
            team_name: team.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Look up a payload field. Dotted paths descend into nested objects.
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.payload.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }
}

pub type Handler = Arc<dyn Fn(DispatchEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it keeps the handler registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = lock_registry(&registry);
            if let Some(list) = registry.handlers.get_mut(&self.kind) {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// Event bus instance. Cheap to clone; clones share subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(DispatchEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        let mut registry = lock_registry(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.entry(kind).or_default().push((id, handler));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Deliver `event` to every handler registered for its kind, in
    /// registration order.
    pub async fn emit(&self, event: DispatchEvent) {
        let handlers: Vec<Handler> = {
            let registry = lock_registry(&self.registry);
            match registry.handlers.get(&event.kind) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };
        tlog_trace!(
            "EventBus::emit {} team={} handlers={}",
            event.kind,
            event.team_name,
            handlers.len()
        );

        for handler in handlers {
            let started = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone())));
            let future = match started {
                Ok(future) => future,
                Err(_) => {
                    tlog_warn!("Event handler panicked for {}", event.kind);
                    continue;
                }
            };
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tlog_warn!("Event handler failed for {}: {}", event.kind, e),
                Err(_) => tlog_warn!("Event handler panicked for {}", event.kind),
            }
        }
    }

    /// Remove every subscription.
    pub fn clear(&self) {
        lock_registry(&self.registry).handlers.clear();
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock_registry(&self.registry)
            .handlers
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = lock_registry(&self.registry);
        let total: usize = registry.handlers.values().map(Vec::len).sum();
        f.debug_struct("EventBus").field("subscribers", &total).finish()
    }
}

// Handlers never run under this mutex, so a poisoned registry is still consistent.
fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
