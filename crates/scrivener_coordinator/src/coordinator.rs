//! Execution coordinator.
//!
//! Takes one dequeued job, drives generation for it, and records the outcome so
//! that sibling jobs of a fan-out run converge on one run record. All state lives
//! in the store; nothing is cached between calls.
//!
//! Per job:
//! 1. Validate the payload (tenant, exactly one target, job id grammar, subject).
//! 2. Activation guard: terminal runs make the job a no-op.
//! 3. Generate, persist the artifact, then record the outcome with one atomic
//!    statement that returns the post-increment counters.
//! 4. The worker whose returned counters show every unit done finalizes the run.

use chrono::Utc;
use scrivener_db::{Activation, Finalization, RunCounters, ScrivenerDb, SingleResult};
use scrivener_protocol::{
    truncate_message, FileRef, JobPayload, JobScope, JobTarget, PerFileResult, ProgressEvent,
    QueuedJob, RunStatus, SessionId, TokenUsage,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collaborators::{
    DeadLetterQueue, KnowledgeSource, OutputMetadata, OutputSink, ProgressNotifier,
    PromptAssembler, ProviderGateway, OUTPUT_SOURCE_TYPE,
};
use crate::error::{CoordinatorError, Result};
use crate::generation::{Generated, GenerationPipeline, GenerationSettings};
use crate::output::{render_filename, FilenameContext};

/// Collaborators wired into a coordinator.
pub struct Collaborators {
    pub assembler: Arc<dyn PromptAssembler>,
    pub gateway: Arc<dyn ProviderGateway>,
    pub sink: Arc<dyn OutputSink>,
    pub dead_letters: Arc<dyn DeadLetterQueue>,
    pub notifier: Arc<dyn ProgressNotifier>,
    pub knowledge: Option<Arc<dyn KnowledgeSource>>,
}

/// What processing a job did.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The run was already terminal; nothing was written.
    Skipped(RunStatus),
    /// The run turned terminal while this job was generating; its result was dropped.
    Discarded,
    /// Outcome recorded. `finalization` is set only for the job that finalized the run.
    Recorded {
        counters: RunCounters,
        finalization: Option<Finalization>,
    },
    /// An ephemeral test run finished; progress went to the session's subscribers.
    TestSession { completed: u32, failed: u32 },
}

/// Resolved target of a run job, checked before any state mutation.
enum RunUnit<'a> {
    Single,
    File { index: u32, subject: &'a FileRef },
}

pub struct ExecutionCoordinator {
    pub(crate) db: ScrivenerDb,
    pipeline: GenerationPipeline,
    sink: Arc<dyn OutputSink>,
    pub(crate) dead_letters: Arc<dyn DeadLetterQueue>,
    pub(crate) notifier: Arc<dyn ProgressNotifier>,
}

impl ExecutionCoordinator {
    pub fn new(db: ScrivenerDb, collaborators: Collaborators, settings: GenerationSettings) -> Self {
        let pipeline = GenerationPipeline::new(
            collaborators.assembler,
            collaborators.gateway,
            collaborators.knowledge,
            settings,
        );
        Self {
            db,
            pipeline,
            sink: collaborators.sink,
            dead_letters: collaborators.dead_letters,
            notifier: collaborators.notifier,
        }
    }

    pub fn db(&self) -> &ScrivenerDb {
        &self.db
    }

    /// Process one delivery of a job.
    ///
    /// Errors propagate to the queue, which retries or fires the failure hook.
    pub async fn process(&self, job: &QueuedJob) -> Result<JobOutcome> {
        let payload = &job.payload;
        let tenant_id = payload.tenant()?;

        let run_id = match payload.scope()? {
            JobScope::TestSession { session_id } => {
                return Ok(self.run_test_session(tenant_id, session_id, payload).await);
            }
            JobScope::Run { run_id } => run_id,
        };

        let unit = match JobTarget::for_run(&job.id, &run_id)? {
            JobTarget::Single { .. } => RunUnit::Single,
            JobTarget::FanOut { index, .. } => RunUnit::File {
                index,
                subject: payload.subject_at(index)?,
            },
        };

        match self.db.activate_run(tenant_id, &run_id).await? {
            Activation::Terminal(status) => {
                info!(job_id = %job.id, run_id = %run_id, status = %status, "Run already terminal; job is a no-op");
                return Ok(JobOutcome::Skipped(status));
            }
            Activation::AlreadyRunning => match unit {
                RunUnit::Single => info!(
                    job_id = %job.id,
                    run_id = %run_id,
                    attempt = job.attempts_made,
                    "Run already RUNNING; recovering after a lost worker lock"
                ),
                RunUnit::File { index, .. } if job.attempts_made > 1 => info!(
                    job_id = %job.id,
                    run_id = %run_id,
                    index,
                    attempt = job.attempts_made,
                    "Run already RUNNING; redelivered file unit"
                ),
                RunUnit::File { .. } => debug!(job_id = %job.id, run_id = %run_id, "Run already RUNNING"),
            },
            Activation::Started => {}
        }

        match unit {
            RunUnit::Single => self.process_single(tenant_id, &run_id, job).await,
            RunUnit::File { index, subject } => {
                self.process_file(tenant_id, &run_id, index, subject, job).await
            }
        }
    }

    async fn process_single(&self, tenant_id: &str, run_id: &str, job: &QueuedJob) -> Result<JobOutcome> {
        let payload = &job.payload;
        let subjects = payload.subjects();
        let generated = self.pipeline.generate(tenant_id, payload, &subjects).await?;

        let single_file = match subjects.as_slice() {
            [only] => Some(only.name.as_str()),
            _ => None,
        };
        let asset_id = self
            .store_output(tenant_id, run_id, payload, &generated, single_file, None)
            .await?;

        let result = SingleResult {
            assembled_prompt: generated.prompt,
            raw_llm_response: generated.response,
            token_usage: generated.token_usage,
            output_asset_id: asset_id,
            warnings: generated.warnings,
        };
        let counters = self.db.store_single_result(tenant_id, run_id, &result).await?;
        self.complete_unit(tenant_id, run_id, counters).await
    }

    async fn process_file(
        &self,
        tenant_id: &str,
        run_id: &str,
        index: u32,
        subject: &FileRef,
        job: &QueuedJob,
    ) -> Result<JobOutcome> {
        let payload = &job.payload;
        let written = self
            .db
            .upsert_transient_file_result(tenant_id, run_id, &PerFileResult::processing(index, &subject.name))
            .await?;
        if !written {
            return self.resume_recorded_file(tenant_id, run_id, index, job).await;
        }

        let generated = self.pipeline.generate(tenant_id, payload, &[subject]).await?;
        let asset_id = self
            .store_output(tenant_id, run_id, payload, &generated, Some(&subject.name), Some(index))
            .await?;

        let result = PerFileResult::completed(
            index,
            &subject.name,
            generated.prompt,
            generated.response,
            generated.token_usage,
            asset_id,
        )
        .with_warnings(generated.warnings);

        let counters = self.db.record_file_outcome(tenant_id, run_id, &result).await?;
        self.complete_unit(tenant_id, run_id, counters).await
    }

    /// A redelivered unit whose index already holds an outcome: no new generation,
    /// only the completion test its previous worker may not have reached.
    async fn resume_recorded_file(
        &self,
        tenant_id: &str,
        run_id: &str,
        index: u32,
        job: &QueuedJob,
    ) -> Result<JobOutcome> {
        let run = self
            .db
            .get_run(tenant_id, run_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("Run {}", run_id)))?;
        if run.status.is_terminal() {
            info!(job_id = %job.id, run_id, status = %run.status, "Run turned terminal; job is a no-op");
            return Ok(JobOutcome::Skipped(run.status));
        }

        let status = run.per_file_result(index).map(|r| r.status);
        info!(
            job_id = %job.id,
            run_id,
            index,
            status = ?status,
            "File outcome already recorded; skipping generation"
        );
        self.complete_unit(tenant_id, run_id, Some(run.counters())).await
    }

    /// Completion test on the counters returned by the recording statement.
    pub(crate) async fn complete_unit(
        &self,
        tenant_id: &str,
        run_id: &str,
        counters: Option<RunCounters>,
    ) -> Result<JobOutcome> {
        let Some(counters) = counters else {
            warn!(run_id, "Run became terminal while the job was running; result dropped");
            return Ok(JobOutcome::Discarded);
        };

        let finalization = if counters.all_units_done() {
            self.db.finalize_run(tenant_id, run_id).await?
        } else {
            None
        };

        Ok(JobOutcome::Recorded {
            counters,
            finalization,
        })
    }

    async fn store_output(
        &self,
        tenant_id: &str,
        run_id: &str,
        payload: &JobPayload,
        generated: &Generated,
        file_name: Option<&str>,
        index: Option<u32>,
    ) -> Result<String> {
        let workflow = &payload.workflow;
        let format = workflow.output.format;
        let filename = render_filename(
            workflow.output.filename_template.as_deref(),
            &FilenameContext {
                workflow_name: &workflow.name,
                file_name,
                index,
                run_id,
                date: Utc::now().date_naive(),
            },
            format,
        );

        let metadata = OutputMetadata {
            tenant_id: tenant_id.to_string(),
            filename,
            mime_type: format.mime_type().to_string(),
            source_type: OUTPUT_SOURCE_TYPE.to_string(),
            run_id: Some(run_id.to_string()),
            uploaded_by: payload.user_id.clone(),
        };
        self.sink
            .store(generated.response.clone().into_bytes(), &metadata)
            .await
    }

    /// Ephemeral test run: every subject processed in this one job, nothing
    /// persisted, progress pushed to the session. Per-file failures are reported
    /// as events rather than retried.
    async fn run_test_session(&self, tenant_id: &str, session_id: SessionId, payload: &JobPayload) -> JobOutcome {
        let subjects = payload.subjects();
        let units: Vec<Option<&FileRef>> = if subjects.is_empty() {
            vec![None]
        } else {
            subjects.into_iter().map(Some).collect()
        };
        let total = units.len() as u32;

        let mut completed = 0u32;
        let mut failed = 0u32;
        let mut token_usage = TokenUsage::default();

        for (index, subject) in units.into_iter().enumerate() {
            let index = index as u32;
            let file_name = subject
                .map(|f| f.name.clone())
                .unwrap_or_else(|| payload.workflow.name.clone());

            self.notifier.notify(ProgressEvent::FileStart {
                session_id,
                index,
                file_name: file_name.clone(),
                total,
            });

            let subject_slice: Vec<&FileRef> = subject.into_iter().collect();
            let event = match self.pipeline.generate(tenant_id, payload, &subject_slice).await {
                Ok(generated) => {
                    completed += 1;
                    token_usage += generated.token_usage;
                    ProgressEvent::FileComplete {
                        session_id,
                        index,
                        file_name,
                        response: Some(generated.response),
                        token_usage: Some(generated.token_usage),
                        error: None,
                    }
                }
                Err(err) => {
                    failed += 1;
                    warn!(session_id = %session_id, index, error = %err, "Test run file failed");
                    ProgressEvent::FileComplete {
                        session_id,
                        index,
                        file_name,
                        response: None,
                        token_usage: None,
                        error: Some(truncate_message(
                            &err.to_string(),
                            scrivener_protocol::defaults::PER_FILE_ERROR_MAX_CHARS,
                        )),
                    }
                }
            };
            self.notifier.notify(event);
        }

        if completed == 0 {
            self.notifier.notify(ProgressEvent::RunError {
                session_id,
                message: format!("All {} files failed", failed),
            });
        } else {
            self.notifier.notify(ProgressEvent::RunComplete {
                session_id,
                completed,
                failed,
                token_usage,
            });
        }

        info!(session_id = %session_id, completed, failed, "Test run finished");
        JobOutcome::TestSession { completed, failed }
    }
}
