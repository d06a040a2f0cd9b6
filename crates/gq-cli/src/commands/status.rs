//! Status command implementation

use std::time::Duration;

use anyhow::Result;

use gq_orchestrator::Orchestrator;

use crate::output::format_status;

/// How long to give the push channel to open before reporting on it
const CONNECT_GRACE: Duration = Duration::from_secs(2);

/// Execute the status command
pub async fn status_command(orchestrator: &Orchestrator) -> Result<()> {
    let mut connection = orchestrator.connection();
    // A timeout only means the channel is still down; report it as such
    let _ = tokio::time::timeout(CONNECT_GRACE, connection.wait_for(|state| state.live)).await;

    let state = connection.borrow().clone();
    println!("{}", format_status(&orchestrator.snapshot(), &state));

    Ok(())
}
