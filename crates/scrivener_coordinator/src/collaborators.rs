//! Seams to the collaborators the coordinator drives.
//!
//! Every trait here has a reference implementation in this crate (see
//! `assembler`, `providers`, `sink`, `notify`) and a fake in the integration
//! tests.

use async_trait::async_trait;
use scrivener_db::{DeadLetterEntry, ScrivenerDb};
use scrivener_protocol::{
    ContextInput, FileRef, InputRole, ProgressEvent, TokenUsage, WorkflowDefinition,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::params::ParamSpec;

// ============================================================================
// Prompt assembly
// ============================================================================

pub struct AssemblyRequest<'a> {
    pub tenant_id: &'a str,
    pub template: &'a str,
    pub input_roles: &'a [InputRole],
    pub context_inputs: &'a BTreeMap<String, ContextInput>,
    /// One file for a fan-out unit; every file for a batch-mode single job.
    pub subjects: &'a [&'a FileRef],
    pub knowledge: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledPrompt {
    pub prompt: String,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait PromptAssembler: Send + Sync {
    async fn assemble(&self, request: AssemblyRequest<'_>) -> Result<AssembledPrompt>;
}

// ============================================================================
// Provider gateway
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    pub context_window: u64,
    /// Budget for completion tokens, checked after generation.
    pub max_output_tokens: Option<u64>,
}

/// A model ready to call.
#[derive(Clone)]
pub struct ResolvedModel {
    pub model_id: String,
    pub client: Arc<dyn GenerationClient>,
    pub limits: ModelLimits,
    pub supported_params: Vec<ParamSpec>,
    pub param_defaults: Map<String, Value>,
}

/// Resolves a model id. Fails with `ProviderDisabled` for a deactivated model or
/// provider and `NotFound` for an unknown one.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    async fn resolve(&self, model_id: &str) -> Result<ResolvedModel>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    pub text: String,
    pub token_usage: TokenUsage,
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse>;
}

// ============================================================================
// Output sink
// ============================================================================

pub const OUTPUT_SOURCE_TYPE: &str = "workflow_output";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMetadata {
    pub tenant_id: String,
    pub filename: String,
    pub mime_type: String,
    pub source_type: String,
    pub run_id: Option<String>,
    pub uploaded_by: Option<String>,
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Persist an artifact and return its asset id.
    async fn store(&self, bytes: Vec<u8>, metadata: &OutputMetadata) -> Result<String>;
}

// ============================================================================
// Knowledge
// ============================================================================

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    async fn knowledge_context(
        &self,
        tenant_id: &str,
        workflow: &WorkflowDefinition,
    ) -> Result<Option<String>>;
}

// ============================================================================
// Dead letters & notifications
// ============================================================================

#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn enqueue(&self, entry: &DeadLetterEntry) -> Result<()>;
}

#[async_trait]
impl DeadLetterQueue for ScrivenerDb {
    async fn enqueue(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.insert_dead_letter(entry).await?;
        Ok(())
    }
}

/// Receives progress events of ephemeral test runs.
pub trait ProgressNotifier: Send + Sync {
    fn notify(&self, event: ProgressEvent);
}
