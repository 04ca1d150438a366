//! Integration test suite for troupe.
//!
//! These tests drive a [`troupe::Coordinator`] over a temporary root and
//! check the behaviour that spans components: cascades through the task
//! graph, concurrent claims, agent failure handling and rule dispatch.
//!
//! # Test Categories
//!
//! - `task_graph`: Dependencies, cascades and crash repair
//! - `concurrency`: Claim-once and lost-update checks under contention
//! - `agent_lifecycle`: Heartbeats, the stale sweep and termination
//! - `dispatch`: Rule ordering, actions, the recursion cap and the log cap
//!
//! No tmux server is needed; panes go through a recording fake.

mod fixtures;

mod agent_lifecycle;
mod concurrency;
mod dispatch;
mod task_graph;
