//! Filesystem-backed shared state.
//!
//! Every mutation in the crate funnels through [`Store::locked_update`] (or a
//! `LockManager::with_lock` section around several [`Store`] calls), which
//! makes each per-file read-modify-write linearizable across processes.

pub mod layout;
pub mod lock;
pub mod store;

pub use layout::Layout;
pub use lock::{LockGuard, LockManager};
pub use store::{Schema, Store};
