//! Pre- and post-backup shell hooks.

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Run one configured hook through the shell. Non-zero exit is an error;
/// the caller decides whether that aborts the run (pre) or is only logged
/// (post).
pub async fn run_hook(label: &str, command: &str) -> Result<()> {
    info!(hook = label, command, "running hook");

    let output = Command::new("sh").arg("-c").arg(command).output().await?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    warn!(hook = label, status = %output.status, stderr = %stderr.trim(), "hook failed");
    Err(EngineError::Hook(format!(
        "{label} exited with {}",
        output.status
    )))
}
