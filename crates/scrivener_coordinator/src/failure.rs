//! Failure hooks fired by the queue.
//!
//! Neither hook returns an error. They run after the job's own error has already
//! been handled, and a failure here must not take down the worker and every
//! other job in flight on it; store trouble is logged instead.

use scrivener_db::{DeadLetterEntry, ScrivenerDb};
use scrivener_protocol::defaults::RUN_ERROR_MAX_CHARS;
use scrivener_protocol::{truncate_message, JobScope, JobTarget, PerFileResult, ProgressEvent, QueuedJob};
use tracing::{debug, error, info, warn};

use crate::coordinator::ExecutionCoordinator;
use crate::error::CoordinatorError;

impl ExecutionCoordinator {
    /// An attempt failed and the queue will retry. Fan-out units show `retrying`
    /// for their index; counters and dead letters are untouched.
    pub async fn on_attempt_failed(&self, job: &QueuedJob, err: &CoordinatorError) {
        let payload = &job.payload;
        let (Ok(tenant_id), Ok(JobScope::Run { run_id })) = (payload.tenant(), payload.scope()) else {
            return;
        };
        let Ok(JobTarget::FanOut { index, .. }) = JobTarget::for_run(&job.id, &run_id) else {
            return;
        };
        let file_name = payload
            .subject_at(index)
            .map(|f| f.name.clone())
            .unwrap_or_else(|_| format!("file-{}", index));

        let retrying = PerFileResult::retrying(
            index,
            file_name,
            &err.to_string(),
            job.attempts_made,
            job.max_attempts,
        );
        if let Err(e) = self
            .db
            .upsert_transient_file_result(tenant_id, &run_id, &retrying)
            .await
        {
            warn!(job_id = %job.id, run_id = %run_id, index, error = %e, "Failed to record retrying state");
        }
    }

    /// Attempts exhausted (or the error is permanent).
    ///
    /// Always attempts a dead-letter entry first, then drives the run to its
    /// failure outcome: the fan-out failure path for one file, or `FAILED` for a
    /// single-job run.
    pub async fn on_job_failed(&self, job: &QueuedJob, error_message: &str) {
        let payload = &job.payload;
        let tenant_id = payload.tenant().ok();
        let run_id = match payload.scope() {
            Ok(JobScope::Run { run_id }) => Some(run_id),
            _ => None,
        };

        let entry = DeadLetterEntry {
            original_job_id: job.id.clone(),
            run_id: run_id.clone(),
            tenant_id: tenant_id.map(str::to_string),
            failed_at: ScrivenerDb::now_millis(),
            attempts_made: job.attempts_made,
            error_message: truncate_message(error_message, RUN_ERROR_MAX_CHARS),
            payload: serde_json::to_string(payload).unwrap_or_default(),
        };
        self.send_dead_letter(&entry).await;

        let Some(tenant_id) = tenant_id else {
            warn!(job_id = %job.id, "Failed job has no tenant id; run state left unchanged");
            return;
        };

        let run_id = match payload.scope() {
            Ok(JobScope::Run { run_id }) => run_id,
            Ok(JobScope::TestSession { session_id }) => {
                self.notifier.notify(ProgressEvent::RunError {
                    session_id,
                    message: truncate_message(error_message, RUN_ERROR_MAX_CHARS),
                });
                return;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed job has no usable target; run state left unchanged");
                return;
            }
        };

        match JobTarget::for_run(&job.id, &run_id) {
            Ok(JobTarget::FanOut { index, .. }) => {
                self.fail_file(tenant_id, &run_id, index, job, error_message).await
            }
            Ok(JobTarget::Single { .. }) => {
                self.fail_single(tenant_id, &run_id, job, error_message).await
            }
            Err(e) => {
                warn!(job_id = %job.id, run_id = %run_id, error = %e, "Unparseable job id; run state left unchanged");
            }
        }
    }

    /// Dead-letter a job whose payload could not be decoded at all.
    pub async fn dead_letter_unparseable(&self, job_id: &str, raw_payload: &str, attempts_made: u32, error_message: &str) {
        let entry = DeadLetterEntry {
            original_job_id: job_id.to_string(),
            run_id: None,
            tenant_id: None,
            failed_at: ScrivenerDb::now_millis(),
            attempts_made,
            error_message: truncate_message(error_message, RUN_ERROR_MAX_CHARS),
            payload: raw_payload.to_string(),
        };
        self.send_dead_letter(&entry).await;
    }

    async fn send_dead_letter(&self, entry: &DeadLetterEntry) {
        if let Err(e) = self.dead_letters.enqueue(entry).await {
            error!(
                job_id = %entry.original_job_id,
                error = %e,
                "Failed to write dead-letter entry"
            );
        }
    }

    async fn fail_file(&self, tenant_id: &str, run_id: &str, index: u32, job: &QueuedJob, error_message: &str) {
        let file_name = job
            .payload
            .subject_at(index)
            .map(|f| f.name.clone())
            .unwrap_or_else(|_| format!("file-{}", index));
        let result = PerFileResult::failed(index, file_name, error_message, job.attempts_made, job.max_attempts);

        let counters = match self.db.record_file_outcome(tenant_id, run_id, &result).await {
            Ok(counters) => counters,
            Err(e) => {
                error!(job_id = %job.id, run_id, index, error = %e, "Failed to record file failure");
                return;
            }
        };

        match self.complete_unit(tenant_id, run_id, counters).await {
            Ok(outcome) => debug!(job_id = %job.id, run_id, index, ?outcome, "File failure recorded"),
            Err(e) => error!(job_id = %job.id, run_id, error = %e, "Failed to finalize run after file failure"),
        }
    }

    async fn fail_single(&self, tenant_id: &str, run_id: &str, job: &QueuedJob, error_message: &str) {
        let cause = error_message.lines().next().unwrap_or_default();
        let summary = truncate_message(
            &format!(
                "Workflow execution failed after {} attempts: {}",
                job.attempts_made, cause
            ),
            RUN_ERROR_MAX_CHARS,
        );

        match self.db.fail_run(tenant_id, run_id, &summary).await {
            Ok(Some(finalization)) => info!(
                job_id = %job.id,
                run_id,
                refunded = finalization.refunded_credits,
                "Single-job run marked FAILED"
            ),
            Ok(None) => debug!(job_id = %job.id, run_id, "Run already terminal; failure not recorded"),
            Err(e) => error!(job_id = %job.id, run_id, error = %e, "Failed to mark run FAILED"),
        }
    }
}
