//! Event-driven orchestration: the event bus, rule dispatch and agent
//! liveness.

pub mod bus;
pub mod dispatch;
pub mod health;
pub mod rules;

pub use bus::{DispatchEvent, EventBus, EventKind, Subscription};
pub use dispatch::DispatchEngine;
pub use health::{AgentLifecycle, HealthConfig, KillReport, SweepReport, SweeperHandle};
pub use rules::{
    DispatchAction, DispatchCondition, DispatchLogEntry, DispatchRule, Operator, Resource,
    DISPATCH_LOG_CAP,
};
