//! Run submission: create the run row, debit credits, enqueue its jobs.

use scrivener_db::{NewJob, NewRun, ScrivenerDb};
use scrivener_protocol::{JobPayload, JobScope, JobTarget};
use tracing::info;

use crate::error::{CoordinatorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// One job for the whole run; several subjects are concatenated (batch mode).
    Single,
    /// One job per subject file.
    FanOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedRun {
    /// Run id, or the session id for a test run.
    pub target_id: String,
    pub job_ids: Vec<String>,
}

/// Submit a payload for execution.
///
/// Persisted runs are created `QUEUED` with `total_jobs` fixed here and their
/// credit cost debited. Test runs (a session id instead of a run id) enqueue one
/// job and create no run row.
pub async fn submit_run(
    db: &ScrivenerDb,
    payload: &JobPayload,
    mode: SubmitMode,
    credits: i64,
    max_attempts: u32,
) -> Result<SubmittedRun> {
    let tenant_id = payload.tenant()?;

    let run_id = match payload.scope()? {
        JobScope::TestSession { session_id } => {
            let job_id = format!("test-{}", session_id);
            enqueue(db, &job_id, payload, max_attempts).await?;
            return Ok(SubmittedRun {
                target_id: session_id.to_string(),
                job_ids: vec![job_id],
            });
        }
        JobScope::Run { run_id } => run_id,
    };

    let subjects = payload.subjects();
    if mode == SubmitMode::FanOut && subjects.is_empty() {
        return Err(CoordinatorError::InvalidPayload(
            scrivener_protocol::PayloadError::MissingSubject(0),
        ));
    }
    let total_jobs = match mode {
        SubmitMode::Single => 1,
        SubmitMode::FanOut => subjects.len(),
    };

    let jobs = match mode {
        SubmitMode::Single => vec![NewJob {
            id: run_id.clone(),
            payload: encode(payload)?,
        }],
        SubmitMode::FanOut => subjects
            .into_iter()
            .enumerate()
            .map(|(index, subject)| {
                let unit = JobPayload {
                    subject_file: Some(subject.clone()),
                    subject_files: None,
                    ..payload.clone()
                };
                Ok(NewJob {
                    id: JobTarget::fan_out_job_id(&run_id, index as u32),
                    payload: encode(&unit)?,
                })
            })
            .collect::<Result<Vec<_>>>()?,
    };

    // Run row, debit and queue rows commit together.
    db.create_run_with_jobs(
        &NewRun {
            run_id: run_id.clone(),
            tenant_id: tenant_id.to_string(),
            workflow_id: payload.workflow.id.clone(),
            total_jobs: total_jobs as i64,
            credits,
        },
        &jobs,
        max_attempts,
    )
    .await?;
    let job_ids: Vec<String> = jobs.into_iter().map(|job| job.id).collect();

    info!(
        run_id = %run_id,
        tenant_id,
        jobs = job_ids.len(),
        credits,
        "Run submitted"
    );
    Ok(SubmittedRun {
        target_id: run_id,
        job_ids,
    })
}

async fn enqueue(db: &ScrivenerDb, job_id: &str, payload: &JobPayload, max_attempts: u32) -> Result<()> {
    db.enqueue_job(job_id, &encode(payload)?, max_attempts).await?;
    Ok(())
}

fn encode(payload: &JobPayload) -> Result<String> {
    serde_json::to_string(payload)
        .map_err(|e| CoordinatorError::persistence(format!("Failed to encode job payload: {}", e)))
}
