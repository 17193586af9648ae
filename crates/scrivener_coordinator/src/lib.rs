//! Scrivener workflow execution coordinator
//!
//! Consumes workflow jobs from the queue, drives generation through the
//! configured providers, and records per-file outcomes so that the jobs of one
//! fan-out run converge on a single, exactly-once finalized run record.

pub mod assembler;
pub mod cancel;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod error;
mod failure;
pub mod generation;
pub mod notify;
pub mod output;
pub mod params;
pub mod providers;
pub mod sink;
pub mod submit;
pub mod worker;

pub use assembler::TemplateAssembler;
pub use cancel::ShutdownToken;
pub use collaborators::{
    AssembledPrompt, AssemblyRequest, DeadLetterQueue, GenerationClient, GenerationRequest,
    GenerationResponse, KnowledgeSource, ModelLimits, OutputMetadata, OutputSink,
    ProgressNotifier, PromptAssembler, ProviderGateway, ResolvedModel,
};
pub use config::{load_config, ScrivenerConfig};
pub use coordinator::{Collaborators, ExecutionCoordinator, JobOutcome};
pub use error::{CoordinatorError, Result};
pub use generation::GenerationSettings;
pub use notify::{NotificationHub, SessionSubscription};
pub use providers::ConfigProviderGateway;
pub use sink::FsOutputSink;
pub use submit::{submit_run, SubmitMode, SubmittedRun};
pub use worker::{WorkerPool, WorkerSettings};
