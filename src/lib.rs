pub mod agent;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod team;
pub mod tmux;
pub mod util;

pub use coordinator::Coordinator;
pub use error::{Error, ErrorKind, Result};
