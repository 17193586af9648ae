//! In-memory collaborators for coordinator tests.

#![allow(dead_code)]

use async_trait::async_trait;
use scrivener_coordinator::collaborators::{
    AssembledPrompt, AssemblyRequest, DeadLetterQueue, GenerationClient, GenerationRequest,
    GenerationResponse, ModelLimits, OutputMetadata, OutputSink, ProgressNotifier,
    PromptAssembler, ProviderGateway, ResolvedModel,
};
use scrivener_coordinator::{
    Collaborators, CoordinatorError, ExecutionCoordinator, GenerationSettings, Result,
    ShutdownToken, WorkerPool, WorkerSettings,
};
use scrivener_db::{DeadLetterEntry, ScrivenerDb};
use scrivener_protocol::{
    ExecutionParams, FileRef, JobPayload, OutputSpec, ProgressEvent, TokenUsage,
    WorkflowDefinition,
};
use serde_json::Map;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TENANT: &str = "tenant-1";
pub const MODEL: &str = "test-model";
pub const DISABLED_MODEL: &str = "retired-model";

/// Joins the template and subject names so tests can steer the fake client by file.
pub struct EchoAssembler;

#[async_trait]
impl PromptAssembler for EchoAssembler {
    async fn assemble(&self, request: AssemblyRequest<'_>) -> Result<AssembledPrompt> {
        let names: Vec<&str> = request.subjects.iter().map(|f| f.name.as_str()).collect();
        Ok(AssembledPrompt {
            prompt: format!("{}\n{}", request.template, names.join(",")),
            warnings: Vec::new(),
        })
    }
}

/// Fails any prompt mentioning one of `failing` names; counts every call.
#[derive(Default)]
pub struct ScriptedClient {
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn fail_on(&self, file_name: &str) {
        self.failing.lock().unwrap().insert(file_name.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing.lock().unwrap().clone();
        if failing.iter().any(|name| request.prompt.contains(name.as_str())) {
            return Err(CoordinatorError::generation("provider returned 502"));
        }
        Ok(GenerationResponse {
            text: format!("summary of: {}", request.prompt),
            token_usage: TokenUsage::new(10, 5, 15),
        })
    }
}

pub struct FakeGateway {
    pub client: Arc<ScriptedClient>,
    pub context_window: u64,
}

#[async_trait]
impl ProviderGateway for FakeGateway {
    async fn resolve(&self, model_id: &str) -> Result<ResolvedModel> {
        match model_id {
            MODEL => Ok(ResolvedModel {
                model_id: model_id.to_string(),
                client: self.client.clone(),
                limits: ModelLimits {
                    context_window: self.context_window,
                    max_output_tokens: None,
                },
                supported_params: Vec::new(),
                param_defaults: Map::new(),
            }),
            DISABLED_MODEL => Err(CoordinatorError::ProviderDisabled(model_id.to_string())),
            other => Err(CoordinatorError::NotFound(format!("Model '{}'", other))),
        }
    }
}

#[derive(Default)]
pub struct MemorySink {
    pub stored: Mutex<Vec<(String, OutputMetadata)>>,
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn store(&self, _bytes: Vec<u8>, metadata: &OutputMetadata) -> Result<String> {
        let mut stored = self.stored.lock().unwrap();
        let asset_id = format!("asset-{}", stored.len() + 1);
        stored.push((asset_id.clone(), metadata.clone()));
        Ok(asset_id)
    }
}

#[derive(Default)]
pub struct RecordingDeadLetters {
    pub entries: Mutex<Vec<DeadLetterEntry>>,
}

#[async_trait]
impl DeadLetterQueue for RecordingDeadLetters {
    async fn enqueue(&self, entry: &DeadLetterEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressNotifier for RecordingNotifier {
    fn notify(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub db: ScrivenerDb,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub client: Arc<ScriptedClient>,
    pub sink: Arc<MemorySink>,
    pub dead_letters: Arc<RecordingDeadLetters>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub async fn new(monthly: i64, purchased: i64) -> Self {
        Self::with_context_window(monthly, purchased, 100_000).await
    }

    pub async fn with_context_window(monthly: i64, purchased: i64, context_window: u64) -> Self {
        let db = ScrivenerDb::open_in_memory().await.unwrap();
        db.create_tenant(TENANT, "Acme", monthly, purchased)
            .await
            .unwrap();

        let client = Arc::new(ScriptedClient::default());
        let sink = Arc::new(MemorySink::default());
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let coordinator = Arc::new(ExecutionCoordinator::new(
            db.clone(),
            Collaborators {
                assembler: Arc::new(EchoAssembler),
                gateway: Arc::new(FakeGateway {
                    client: client.clone(),
                    context_window,
                }),
                sink: sink.clone(),
                dead_letters: dead_letters.clone(),
                notifier: notifier.clone(),
                knowledge: None,
            },
            GenerationSettings::default(),
        ));

        Self {
            db,
            coordinator,
            client,
            sink,
            dead_letters,
            notifier,
        }
    }

    /// A pool that retries immediately, for draining the queue inline.
    pub fn pool(&self) -> WorkerPool {
        self.pool_with(1, ShutdownToken::new())
    }

    pub fn pool_with(&self, concurrency: usize, shutdown: ShutdownToken) -> WorkerPool {
        WorkerPool::new(
            self.db.clone(),
            self.coordinator.clone(),
            WorkerSettings {
                concurrency,
                lock_duration: Duration::from_secs(60),
                poll_interval: Duration::from_millis(10),
                retry_backoff_base: Duration::ZERO,
                retry_backoff_max: Duration::ZERO,
            },
            shutdown,
        )
    }

    /// Claim and handle jobs until the queue has nothing due.
    pub async fn drain(&self) -> usize {
        let pool = self.pool();
        let mut handled = 0;
        while let Some(claimed) = self.db.claim_job(60_000).await.unwrap() {
            pool.handle(claimed).await;
            handled += 1;
        }
        handled
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.notifier.events.lock().unwrap().clone()
    }

    pub fn dead_letter_entries(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.entries.lock().unwrap().clone()
    }
}

pub fn file(index: usize) -> FileRef {
    FileRef {
        id: format!("file-id-{}", index),
        name: format!("report-{}.txt", index),
        mime_type: Some("text/plain".to_string()),
    }
}

pub fn workflow(model_id: &str) -> WorkflowDefinition {
    WorkflowDefinition {
        id: "wf-summary".to_string(),
        name: "Summary".to_string(),
        prompt_template: "Summarize {{subject}}".to_string(),
        input_roles: Vec::new(),
        execution: ExecutionParams {
            model_id: model_id.to_string(),
            overrides: Map::new(),
        },
        knowledge_enabled: false,
        output: OutputSpec::default(),
    }
}

pub fn run_payload(run_id: &str, subjects: Vec<FileRef>) -> JobPayload {
    JobPayload {
        tenant_id: Some(TENANT.to_string()),
        run_id: Some(run_id.to_string()),
        session_id: None,
        user_id: Some("user-1".to_string()),
        workflow: workflow(MODEL),
        context_inputs: BTreeMap::new(),
        subject_file: None,
        subject_files: Some(subjects),
    }
}

pub fn session_payload(session_id: &str, subjects: Vec<FileRef>) -> JobPayload {
    JobPayload {
        run_id: None,
        session_id: Some(session_id.to_string()),
        ..run_payload("unused", subjects)
    }
}
