//! Job commands: list, cancel, clear
//!
//! Confirmations reach the terminal as orchestrator notifications; these
//! functions only print data and per-item failures.

use anyhow::Result;
use chrono::Utc;

use gq_orchestrator::Orchestrator;

use crate::output::{format_jobs, print_error};

/// Execute the jobs command
pub fn jobs_command(orchestrator: &Orchestrator) -> Result<()> {
    let snapshot = orchestrator.snapshot();
    println!("{}", format_jobs(&snapshot.jobs, Utc::now()));
    Ok(())
}

/// Execute the cancel command
///
/// Every id is attempted; the command fails if any of them failed.
pub async fn cancel_command(orchestrator: &Orchestrator, ids: &[String]) -> Result<()> {
    let mut failed = 0;

    for id in ids {
        if let Err(e) = orchestrator.cancel_job(id).await {
            print_error(&format!("Failed to cancel job {}: {}", id, e));
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("Failed to cancel {} job(s)", failed);
    }

    Ok(())
}

/// Execute the clear command
pub async fn clear_command(orchestrator: &Orchestrator) -> Result<()> {
    let summary = orchestrator.clear_queue().await?;
    if summary.failed > 0 {
        anyhow::bail!("Failed to cancel {} job(s)", summary.failed);
    }
    Ok(())
}
