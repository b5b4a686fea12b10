//! Stop the running unlist daemon.
//!
//! `stop` never kills the process outright. It sends SIGTERM, which the
//! daemon turns into its cooperative cancel flag: running jobs stop before
//! their next action (their tuples stay due), the scheduler drains, and the
//! daemon removes its own PID file as its last step. That file
//! disappearing is the signal that shutdown completed.

use crate::cli::start::{check_already_running, pid_file_path};
use anyhow::{bail, Context, Result};
use std::time::{Duration, Instant};

/// How long a draining daemon gets before we report failure.
const DRAIN_WAIT: Duration = Duration::from_secs(10);

pub async fn run() -> Result<()> {
    let pid_path = pid_file_path();
    // Also cleans up a stale PID file left by a crashed daemon.
    let Some(pid) = check_already_running() else {
        bail!("unlist is not running (no live PID at {})", pid_path.display());
    };

    println!("Stopping unlist (PID {pid})...");
    signal_terminate(pid)?;

    let waited = Instant::now();
    while waited.elapsed() < DRAIN_WAIT {
        if !pid_path.exists() {
            println!("unlist stopped.");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bail!(
        "unlist (PID {pid}) did not stop within {}s; it may still be draining a job",
        DRAIN_WAIT.as_secs()
    );
}

#[cfg(unix)]
fn signal_terminate(pid: i32) -> Result<()> {
    let status = std::process::Command::new("kill")
        .arg(pid.to_string())
        .status()
        .context("failed to send SIGTERM")?;
    if !status.success() {
        bail!("failed to send SIGTERM to PID {pid} (process may have already exited)");
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_terminate(_pid: i32) -> Result<()> {
    bail!("stop is only supported on unix hosts");
}
