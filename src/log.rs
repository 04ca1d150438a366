//! Leveled file logging shared by every troupe process on a root.
//!
//! Levels, from most to least severe:
//! - ERROR: an operation could not complete
//! - WARN: recoverable surprises (handler failures, recursion cap, dead panes)
//! - INFO: state transitions (task completed, agent marked inactive)
//! - DEBUG: lock and store traffic, per-event dispatch
//! - TRACE: bus fan-out
//!
//! Several processes append to `<root>/logs/troupe.log`, so every line
//! carries the pid. The file is rotated to `troupe.log.1` once it passes
//! [`MAX_LOG_BYTES`]. `TROUPE_LOG=<level>` picks the level and
//! `TROUPE_DEBUG=1` is shorthand for `debug`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Size at which the log is moved aside.
pub const MAX_LOG_BYTES: u64 = 8 * 1024 * 1024;

const LOG_FILE: &str = "troupe.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Level requested by the environment, if any.
fn level_from_env() -> Option<LogLevel> {
    if let Some(level) = std::env::var("TROUPE_LOG").ok().and_then(|v| v.parse().ok()) {
        return Some(level);
    }
    std::env::var("TROUPE_DEBUG")
        .ok()
        .filter(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .map(|_| LogLevel::Debug)
}

/// Start logging to `<log_dir>/troupe.log`.
///
/// Only the first call in a process takes effect.
pub fn init(log_dir: &Path) {
    if let Some(level) = level_from_env() {
        set_level(level);
    }
    let _ = fs::create_dir_all(log_dir);
    LOG_PATH.set(log_dir.join(LOG_FILE)).ok();
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Move `path` to `path.1` when it has grown past `max_bytes`.
///
/// Two processes may race here; the loser's rename fails or moves a fresh
/// file, and either way the next append recreates the log.
fn rotate_if_needed(path: &Path, max_bytes: u64) {
    let too_big = fs::metadata(path).map(|m| m.len() > max_bytes).unwrap_or(false);
    if too_big {
        let mut rotated = path.as_os_str().to_owned();
        rotated.push(".1");
        let _ = fs::rename(path, PathBuf::from(rotated));
    }
}

fn format_line(level: LogLevel, msg: &str) -> String {
    format!(
        "[{}] [{}] [pid {}] {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        level.as_str(),
        std::process::id(),
        msg
    )
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    rotate_if_needed(path, MAX_LOG_BYTES);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", format_line(level, msg));
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log at INFO.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! tlog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! tlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log at DEBUG. Dropped unless the level is debug or trace.
#[macro_export]
macro_rules! tlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! tlog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
