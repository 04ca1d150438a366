use std::process::Command;

use crate::{tlog_debug, tlog_warn, Error, Result};

/// Terminates the terminal pane an agent runs in.
///
/// Force-kill calls this best-effort: a pane that is already gone is not
/// an error, and any other failure is logged by the caller and ignored.
pub trait PaneController: Send + Sync {
    fn kill_pane(&self, pane_id: &str) -> Result<()>;
}

/// Pane controller backed by the `tmux` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tmux;

impl PaneController for Tmux {
    fn kill_pane(&self, pane_id: &str) -> Result<()> {
        tlog_debug!("Tmux::kill_pane pane={}", pane_id);
        let output = Command::new("tmux")
            .args(["kill-pane", "-t", pane_id])
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !is_missing_target(&stderr) {
                tlog_warn!("Failed to kill tmux pane '{}': {}", pane_id, stderr);
                return Err(Error::Tmux(format!(
                    "Failed to kill pane '{}': {}",
                    pane_id,
                    stderr.trim()
                )));
            }
            tlog_debug!("Tmux pane '{}' not found (already dead?)", pane_id);
        } else {
            tlog_debug!("Tmux pane killed: {}", pane_id);
        }
        Ok(())
    }
}

/// Pane controller that does nothing, for agents without a pane backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPanes;

impl PaneController for NoopPanes {
    fn kill_pane(&self, _pane_id: &str) -> Result<()> {
        Ok(())
    }
}

fn is_missing_target(stderr: &str) -> bool {
    stderr.contains("can't find pane")
        || stderr.contains("can't find window")
        || stderr.contains("no server running")
        || stderr.contains("error connecting to")
}
