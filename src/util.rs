//! Shared utility functions.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

const MAX_NAME_LENGTH: usize = 64;

/// Run a synchronous critical section on the blocking pool.
///
/// Locked read-modify-write cycles go through here so that no `.await`
/// ever happens while a file lock is held.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Validate a team or agent name that will become part of a file path.
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation(format!("{} name cannot be empty", what)));
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "{} name too long (max {} characters)",
            what, MAX_NAME_LENGTH
        )));
    }

    if name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::Validation(format!(
            "{} name '{}' may only contain ASCII letters, digits, '-', '_' and '.' \
             and cannot start with '.'",
            what, name
        )));
    }

    Ok(())
}
