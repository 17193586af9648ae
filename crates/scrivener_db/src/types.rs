//! Typed records returned by the state store.
//!
//! Raw driver rows never leave this crate; every query result is normalized into
//! one of these types, with `Option` standing for the zero-rows case.

use scrivener_protocol::{PerFileResult, RunStatus, TokenUsage};
use serde::{Deserialize, Serialize};

// ============================================================================
// Tenants
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub monthly_credit_allowance: i64,
    pub purchased_credits: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

// ============================================================================
// Runs
// ============================================================================

/// Parameters for creating a run at enqueue time.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: String,
    pub tenant_id: String,
    pub workflow_id: String,
    /// Number of jobs the run fans out to (1 for single-job runs). Fixed here.
    pub total_jobs: i64,
    /// Credit cost of the run, split into monthly and purchased portions.
    pub credits: i64,
}

/// A queue row created together with its run.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    /// JSON-encoded job payload.
    pub payload: String,
}

/// Full run row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub tenant_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub total_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub assembled_prompt: Option<String>,
    pub raw_llm_response: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub output_asset_ids: Vec<String>,
    pub per_file_results: Vec<PerFileResult>,
    pub credits_consumed: i64,
    pub credits_from_monthly: i64,
    pub credits_from_purchased: i64,
    pub error_message: Option<String>,
    pub validation_warnings: Vec<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub updated_at: i64,
}

impl WorkflowRun {
    pub fn counters(&self) -> RunCounters {
        RunCounters {
            completed_jobs: self.completed_jobs,
            failed_jobs: self.failed_jobs,
            total_jobs: self.total_jobs,
        }
    }

    pub fn is_fan_out(&self) -> bool {
        !self.per_file_results.is_empty()
    }

    pub fn per_file_result(&self, index: u32) -> Option<&PerFileResult> {
        self.per_file_results.iter().find(|r| r.index == index)
    }
}

/// Post-increment counter values returned by the same statement that changed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunCounters {
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub total_jobs: i64,
}

impl RunCounters {
    /// `>=` rather than `==` so a duplicate delivery that over-counts still
    /// reaches finalization (which is a no-op on an already terminal run).
    pub fn all_units_done(&self) -> bool {
        self.completed_jobs + self.failed_jobs >= self.total_jobs
    }
}

/// Result of the QUEUED → RUNNING guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// This call won the transition and stamped `started_at`.
    Started,
    /// Already running: a redelivery after a lost worker lock.
    AlreadyRunning,
    /// Terminal status; the job must be a no-op.
    Terminal(RunStatus),
}

/// Result fields of a single-job run.
#[derive(Debug, Clone)]
pub struct SingleResult {
    pub assembled_prompt: String,
    pub raw_llm_response: String,
    pub token_usage: TokenUsage,
    pub output_asset_id: String,
    pub warnings: Vec<String>,
}

/// What a finalization decided. Returned only by the call that made the transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    pub run_id: String,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub token_usage: Option<TokenUsage>,
    pub duration_ms: i64,
    /// Purchased credits returned to the tenant (0 when no refund was owed).
    pub refunded_credits: i64,
}

// ============================================================================
// Queue
// ============================================================================

/// A job claimed from the queue.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub payload: String,
    /// Attempts made including this claim (1-based).
    pub attempts_made: u32,
    pub max_attempts: u32,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: u64,
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

// ============================================================================
// Dead letters
// ============================================================================

/// Record of a retry-exhausted job kept for inspection and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub original_job_id: String,
    pub run_id: Option<String>,
    pub tenant_id: Option<String>,
    pub failed_at: i64,
    pub attempts_made: u32,
    pub error_message: String,
    /// Original job payload as JSON text.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: i64,
    #[serde(flatten)]
    pub entry: DeadLetterEntry,
}

/// Lifecycle of a queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueJobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl QueueJobState {
    pub fn from_db(raw: &str) -> Option<Self> {
        match raw {
            "QUEUED" => Some(Self::Queued),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}
