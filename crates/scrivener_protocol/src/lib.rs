//! Scrivener protocol types
//!
//! Canonical definitions shared by the run state store, the execution
//! coordinator and the worker binary:
//!
//! - run and per-file status enums (stored as enumerated strings)
//! - the inbound job payload and the fan-out job-id grammar (`{runId}:file:{index}`)
//! - progress events pushed to test-run session subscribers

pub mod defaults;
pub mod events;
pub mod job;
pub mod types;

pub use events::{ProgressEvent, SessionId};
pub use job::{
    ContextInput, ExecutionParams, FileRef, InputRole, JobPayload, JobScope, JobTarget,
    OutputSpec, PayloadError, QueuedJob, WorkflowDefinition,
};
pub use types::{
    truncate_message, FileResultStatus, OutputFormat, PerFileResult, RunStatus, TokenUsage,
};
