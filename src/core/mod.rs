//! Core task model and the persisted dependency graph.
//!
//! `task` holds the data types, `dag` the in-memory petgraph view used for
//! cycle checks and ordering, and `graph` the lock-protected operations on
//! a team's task files.

pub mod dag;
pub mod graph;
pub mod task;

pub use dag::DependencyGraph;
pub use graph::{ReassignReason, ReconcileReport, TaskGraph};
pub use task::{NewTask, Task, TaskId, TaskPatch, TaskPriority, TaskStatus};
