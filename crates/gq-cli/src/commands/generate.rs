//! Generate command implementation

use std::time::Duration;

use anyhow::{Context, Result};

use gq_core::{GenerationResult, Job, JobStatus};
use gq_orchestrator::{Orchestrator, Snapshot};
use gq_protocol::GenerationRequest;

use crate::output::{print_info, print_success, print_warning, progress_bar};
use crate::session::Echo;

/// How a waited-for job left the queue
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Finished and its result was delivered to this session
    Completed(GenerationResult),
    /// Left the queue without a result reaching this session
    Finished,
}

/// Execute the generate command
///
/// Submits `request` and, unless `wait` is off, follows the job until it
/// leaves the queue.
pub async fn generate_command(
    orchestrator: &Orchestrator,
    echo: &Echo,
    request: GenerationRequest,
    wait: bool,
    timeout: Option<Duration>,
    quiet: bool,
) -> Result<()> {
    // Failures of this job may be reported before the request returns
    echo.take_error();
    let job = orchestrator.start_generation(request).await?;
    let id = job.key().to_string();

    if !wait {
        println!("{}", id);
        return Ok(());
    }
    if !quiet {
        print_info(&format!("Submitted job {}", id));
    }

    // From here on, failures only arrive as notifications
    echo.show_errors(true);

    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, wait_for_job(orchestrator, &job, quiet))
            .await
            .with_context(|| format!("Timed out waiting for job {}", id))??,
        None => wait_for_job(orchestrator, &job, quiet).await?,
    };

    match outcome {
        JobOutcome::Completed(result) => {
            if quiet {
                println!("{}", result.image_url);
            } else {
                print_success(&format!("Result {}: {}", result.id, result.image_url));
            }
            Ok(())
        }
        JobOutcome::Finished => {
            if let Some(error) = echo.take_error() {
                anyhow::bail!("Job {} failed: {}", id, error);
            }
            print_warning(&format!(
                "Job {} left the queue; run `genqueue results` to find its image",
                id
            ));
            Ok(())
        }
    }
}

/// Follow `job` through snapshots until it leaves the queue
///
/// Progress lines are printed on every status or progress change unless
/// `quiet`. Ctrl-C aborts the wait, not the job.
pub async fn wait_for_job(
    orchestrator: &Orchestrator,
    job: &Job,
    quiet: bool,
) -> Result<JobOutcome> {
    let mut snapshots = orchestrator.subscribe();
    let mut last: Option<(JobStatus, u8)> = None;
    let mut backend_id = job.backend_id.clone();

    loop {
        {
            let snapshot = snapshots.borrow_and_update();
            match snapshot.find_job(&job.local_id) {
                Some(active) => {
                    if active.backend_id.is_some() {
                        backend_id = active.backend_id.clone();
                    }
                    let state = (active.status, active.progress);
                    if !quiet && last != Some(state) {
                        print_info(&format!(
                            "{} {} {}",
                            active.key(),
                            active.status,
                            progress_bar(active.progress, 20)
                        ));
                    }
                    last = Some(state);
                }
                None => return Ok(outcome_for(&snapshot, backend_id.as_deref())),
            }
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    anyhow::bail!("Orchestrator shut down while waiting for job {}", job.key());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                anyhow::bail!("Interrupted; job {} keeps running", job.key());
            }
        }
    }
}

fn outcome_for(snapshot: &Snapshot, backend_id: Option<&str>) -> JobOutcome {
    backend_id
        .and_then(|id| {
            snapshot
                .results
                .iter()
                .find(|result| result.job_id.as_deref() == Some(id))
        })
        .map(|result| JobOutcome::Completed(result.clone()))
        .unwrap_or(JobOutcome::Finished)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(id: &str, job_id: Option<&str>) -> GenerationResult {
        GenerationResult {
            id: id.to_string(),
            job_id: job_id.map(str::to_string),
            prompt: "p".to_string(),
            negative_prompt: None,
            image_url: format!("/img/{}.png", id),
            image_urls: vec![format!("/img/{}.png", id)],
            thumbnail_url: None,
            parameters: Default::default(),
            created_at: Utc::now(),
            rating: None,
            is_favorite: false,
        }
    }

    #[test]
    fn test_outcome_matches_result_by_job_id() {
        let snapshot = Snapshot {
            results: vec![result("r1", Some("j1")), result("r2", Some("j2"))],
            ..Default::default()
        };
        match outcome_for(&snapshot, Some("j2")) {
            JobOutcome::Completed(found) => assert_eq!(found.id, "r2"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(outcome_for(&snapshot, Some("j3")), JobOutcome::Finished);
        assert_eq!(outcome_for(&snapshot, None), JobOutcome::Finished);
    }
}
