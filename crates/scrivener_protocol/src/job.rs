//! Inbound job payload and job-id grammar.
//!
//! A queued job carries exactly one of a run id (persisted run) or a test-run
//! session id (ephemeral, progress pushed to subscribers). Fan-out membership is
//! encoded in the queue job id as `{runId}:file:{index}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::defaults::FAN_OUT_MARKER;
use crate::events::SessionId;
use crate::types::OutputFormat;

/// Malformed job payloads. Raised before any state mutation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("job payload is missing a tenant id")]
    MissingTenant,

    #[error("job payload has neither a run id nor a session id")]
    MissingTarget,

    #[error("job payload has both a run id and a session id")]
    ConflictingTargets,

    #[error("invalid job id '{0}': file index is not a number")]
    InvalidJobId(String),

    #[error("job id '{job_id}' does not belong to run '{run_id}'")]
    MismatchedRunId { job_id: String, run_id: String },

    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("fan-out job for file {0} has no subject file")]
    MissingSubject(u32),
}

// ============================================================================
// Workflow definition
// ============================================================================

/// A named input slot the prompt template expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRole {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Model reference plus per-workflow parameter overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionParams {
    pub model_id: String,
    #[serde(default)]
    pub overrides: Map<String, Value>,
}

/// Where and how the generated text is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub prompt_template: String,
    #[serde(default)]
    pub input_roles: Vec<InputRole>,
    pub execution: ExecutionParams,
    #[serde(default)]
    pub knowledge_enabled: bool,
    #[serde(default)]
    pub output: OutputSpec,
}

/// Reference to a tenant-owned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A named context input: literal text or a file reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContextInput {
    Text { value: String },
    File { file: FileRef },
}

// ============================================================================
// Job payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// User that started the run; recorded as the artifact uploader.
    #[serde(default)]
    pub user_id: Option<String>,
    pub workflow: WorkflowDefinition,
    #[serde(default)]
    pub context_inputs: BTreeMap<String, ContextInput>,
    #[serde(default)]
    pub subject_file: Option<FileRef>,
    #[serde(default)]
    pub subject_files: Option<Vec<FileRef>>,
}

/// Which record a job reports into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobScope {
    Run { run_id: String },
    TestSession { session_id: SessionId },
}

impl JobPayload {
    /// Tenant id, required and non-blank.
    pub fn tenant(&self) -> Result<&str, PayloadError> {
        match self.tenant_id.as_deref().map(str::trim) {
            Some(tenant) if !tenant.is_empty() => Ok(tenant),
            _ => Err(PayloadError::MissingTenant),
        }
    }

    /// Resolve the single target of this job. Blank identifiers count as absent.
    pub fn scope(&self) -> Result<JobScope, PayloadError> {
        let run_id = non_blank(self.run_id.as_deref());
        let session_id = non_blank(self.session_id.as_deref());
        match (run_id, session_id) {
            (Some(_), Some(_)) => Err(PayloadError::ConflictingTargets),
            (None, None) => Err(PayloadError::MissingTarget),
            (Some(run_id), None) => Ok(JobScope::Run {
                run_id: run_id.to_string(),
            }),
            (None, Some(session_id)) => Ok(JobScope::TestSession {
                session_id: SessionId::parse(session_id)?,
            }),
        }
    }

    /// Subject files in order. `subjectFiles` takes precedence over `subjectFile`.
    pub fn subjects(&self) -> Vec<&FileRef> {
        match &self.subject_files {
            Some(files) if !files.is_empty() => files.iter().collect(),
            _ => self.subject_file.iter().collect(),
        }
    }

    /// Subject for one fan-out unit.
    ///
    /// A fan-out job normally carries only its own file in `subjectFile`; when it
    /// carries the whole ordered list the index selects from it.
    pub fn subject_at(&self, index: u32) -> Result<&FileRef, PayloadError> {
        match &self.subject_files {
            Some(files) if !files.is_empty() => files
                .get(index as usize)
                .ok_or(PayloadError::MissingSubject(index)),
            _ => self
                .subject_file
                .as_ref()
                .ok_or(PayloadError::MissingSubject(index)),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

// ============================================================================
// Job ids
// ============================================================================

/// Single-job vs fan-out handling, recovered from the queue job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTarget {
    Single { run_id: String },
    FanOut { run_id: String, index: u32 },
}

impl JobTarget {
    pub fn parse(job_id: &str) -> Result<Self, PayloadError> {
        match job_id.rsplit_once(FAN_OUT_MARKER) {
            Some((run_id, index)) => {
                let index = index
                    .parse::<u32>()
                    .map_err(|_| PayloadError::InvalidJobId(job_id.to_string()))?;
                Ok(JobTarget::FanOut {
                    run_id: run_id.to_string(),
                    index,
                })
            }
            None => Ok(JobTarget::Single {
                run_id: job_id.to_string(),
            }),
        }
    }

    /// Parse a job id and check it belongs to the payload's run.
    ///
    /// Single-job ids are opaque to the coordinator, so only fan-out ids are
    /// cross-checked against the run id.
    pub fn for_run(job_id: &str, run_id: &str) -> Result<Self, PayloadError> {
        match Self::parse(job_id)? {
            JobTarget::FanOut {
                run_id: prefix,
                index,
            } => {
                if prefix != run_id {
                    return Err(PayloadError::MismatchedRunId {
                        job_id: job_id.to_string(),
                        run_id: run_id.to_string(),
                    });
                }
                Ok(JobTarget::FanOut { run_id: prefix, index })
            }
            JobTarget::Single { .. } => Ok(JobTarget::Single {
                run_id: run_id.to_string(),
            }),
        }
    }

    pub fn fan_out_job_id(run_id: &str, index: u32) -> String {
        format!("{}{}{}", run_id, FAN_OUT_MARKER, index)
    }

    pub fn run_id(&self) -> &str {
        match self {
            JobTarget::Single { run_id } | JobTarget::FanOut { run_id, .. } => run_id,
        }
    }

    pub fn index(&self) -> Option<u32> {
        match self {
            JobTarget::Single { .. } => None,
            JobTarget::FanOut { index, .. } => Some(*index),
        }
    }
}

/// A job as delivered by the queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub payload: JobPayload,
    /// Attempts made including the current one (1-based).
    pub attempts_made: u32,
    pub max_attempts: u32,
}

impl QueuedJob {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> JobPayload {
        serde_json::from_value(serde_json::json!({
            "tenantId": "t-1",
            "runId": "run-1",
            "workflow": {
                "id": "wf-1",
                "name": "Summarize",
                "promptTemplate": "Summarize {{subject}}",
                "execution": { "modelId": "gpt-test", "overrides": { "temperature": 0.2 } }
            },
            "contextInputs": {
                "audience": { "type": "text", "value": "executives" },
                "style": { "type": "file", "file": { "id": "f-9", "name": "style.md" } }
            },
            "subjectFiles": [
                { "id": "f-1", "name": "a.pdf" },
                { "id": "f-2", "name": "b.pdf" }
            ],
            "subjectFile": { "id": "f-3", "name": "c.pdf" }
        }))
        .unwrap()
    }

    #[test]
    fn test_payload_deserializes_camel_case() {
        let payload = payload();
        assert_eq!(payload.workflow.execution.model_id, "gpt-test");
        assert_eq!(payload.workflow.output.format, OutputFormat::Markdown);
        assert!(matches!(
            payload.context_inputs.get("style"),
            Some(ContextInput::File { file }) if file.id == "f-9"
        ));
    }

    #[test]
    fn test_subject_files_take_precedence() {
        let payload = payload();
        let names: Vec<_> = payload.subjects().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.pdf", "b.pdf"]);
        assert_eq!(payload.subject_at(1).unwrap().name, "b.pdf");
        assert_eq!(payload.subject_at(5), Err(PayloadError::MissingSubject(5)));
    }

    #[test]
    fn test_scope_requires_exactly_one_target() {
        let mut payload = payload();
        assert_eq!(
            payload.scope().unwrap(),
            JobScope::Run {
                run_id: "run-1".into()
            }
        );

        payload.session_id = Some("2f1c1f8e-5d7a-4a63-9d0e-6a3c3b9a1c11".into());
        assert_eq!(payload.scope(), Err(PayloadError::ConflictingTargets));

        payload.run_id = Some("   ".into());
        assert!(matches!(payload.scope(), Ok(JobScope::TestSession { .. })));

        payload.session_id = None;
        assert_eq!(payload.scope(), Err(PayloadError::MissingTarget));
    }

    #[test]
    fn test_blank_tenant_is_rejected() {
        let mut payload = payload();
        payload.tenant_id = Some("  ".into());
        assert_eq!(payload.tenant(), Err(PayloadError::MissingTenant));
        payload.tenant_id = None;
        assert_eq!(payload.tenant(), Err(PayloadError::MissingTenant));
    }

    #[test]
    fn test_job_target_parse() {
        assert_eq!(
            JobTarget::parse("run-1").unwrap(),
            JobTarget::Single {
                run_id: "run-1".into()
            }
        );
        assert_eq!(
            JobTarget::parse("run-1:file:7").unwrap(),
            JobTarget::FanOut {
                run_id: "run-1".into(),
                index: 7
            }
        );
        assert!(matches!(
            JobTarget::parse("run-1:file:x"),
            Err(PayloadError::InvalidJobId(_))
        ));
        assert_eq!(JobTarget::fan_out_job_id("run-1", 3), "run-1:file:3");
    }

    #[test]
    fn test_job_target_for_run_checks_prefix() {
        assert!(JobTarget::for_run("run-1:file:0", "run-1").is_ok());
        assert!(matches!(
            JobTarget::for_run("run-2:file:0", "run-1"),
            Err(PayloadError::MismatchedRunId { .. })
        ));
        assert_eq!(
            JobTarget::for_run("queue-job-17", "run-1").unwrap(),
            JobTarget::Single {
                run_id: "run-1".into()
            }
        );
    }
}
