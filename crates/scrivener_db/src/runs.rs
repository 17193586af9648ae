//! Workflow run operations.
//!
//! Concurrency rules for this module:
//! - A decision value (counters used for the completion test) is produced by the
//!   same statement that changed it, via `RETURNING`.
//! - Multi-statement decisions (finalization, refund) start with a write to the run
//!   row so the transaction holds SQLite's write lock before it reads anything.
//! - Every mutating statement is guarded on a non-terminal status.

use scrivener_protocol::{FileResultStatus, PerFileResult, RunStatus, TokenUsage};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, warn};

use crate::credits::{debit_run_credits, lock_tenant_row, refund_purchased_credits};
use crate::error::{DbError, Result};
use crate::queue::insert_job;
use crate::types::*;
use crate::ScrivenerDb;

/// Status guard shared by every mutating statement.
const NON_TERMINAL: &str = "status IN ('QUEUED', 'RUNNING')";

/// The per-file list with any entry at index `?1` removed, then `?2` appended.
const REPLACE_FILE_ENTRY: &str = r#"json_insert(
        COALESCE(
            (SELECT json_group_array(json(e.value))
             FROM json_each(workflow_runs.per_file_results) AS e
             WHERE json_extract(e.value, '$.index') <> ?1),
            '[]'),
        '$[#]', json(?2))"#;

/// True when index `?1` already holds a terminal entry.
const INDEX_ALREADY_TERMINAL: &str = r#"EXISTS (
        SELECT 1 FROM json_each(workflow_runs.per_file_results) AS e
        WHERE json_extract(e.value, '$.index') = ?1
          AND json_extract(e.value, '$.status') IN ('completed', 'failed'))"#;

/// True when index `?1` already holds the opposite terminal status `?7`.
const INDEX_HOLDS_OTHER_OUTCOME: &str = r#"EXISTS (
        SELECT 1 FROM json_each(workflow_runs.per_file_results) AS e
        WHERE json_extract(e.value, '$.index') = ?1
          AND json_extract(e.value, '$.status') = ?7)"#;

/// Output asset list without the asset previously recorded for index `?1`.
const ASSETS_WITHOUT_INDEX: &str = r#"COALESCE(
        (SELECT json_group_array(a.value)
         FROM json_each(workflow_runs.output_asset_ids) AS a
         WHERE a.value IS NOT (
             SELECT json_extract(e.value, '$.output_asset_id')
             FROM json_each(workflow_runs.per_file_results) AS e
             WHERE json_extract(e.value, '$.index') = ?1)),
        '[]')"#;

impl ScrivenerDb {
    // ========================================================================
    // Creation & lookup
    // ========================================================================

    /// Create a run in `QUEUED` state and debit its credit cost.
    ///
    /// Monthly allowance is consumed first; the remainder comes from purchased
    /// credit. Fails with `InsufficientCredits` when neither covers the cost.
    pub async fn create_run(&self, new_run: &NewRun) -> Result<WorkflowRun> {
        self.create_run_with_jobs(new_run, &[], 1).await
    }

    /// Create a run, debit its credits and enqueue its jobs in one transaction.
    ///
    /// Either everything lands or nothing does: a failed job insert (for example
    /// a job id already in the queue) rolls back the run row and the debit.
    pub async fn create_run_with_jobs(
        &self,
        new_run: &NewRun,
        jobs: &[NewJob],
        max_attempts: u32,
    ) -> Result<WorkflowRun> {
        if new_run.total_jobs < 1 {
            return Err(DbError::invalid_state(format!(
                "Run {} must have at least one job",
                new_run.run_id
            )));
        }

        let mut tx = self.pool.begin().await?;
        lock_tenant_row(&mut *tx, &new_run.tenant_id).await?;
        let split = debit_run_credits(&mut *tx, &new_run.tenant_id, new_run.credits).await?;

        let now = Self::now_millis();
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                id, tenant_id, workflow_id, status, total_jobs,
                credits_consumed, credits_from_monthly, credits_from_purchased,
                created_at, updated_at
            )
            VALUES (?, ?, ?, 'QUEUED', ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new_run.run_id)
        .bind(&new_run.tenant_id)
        .bind(&new_run.workflow_id)
        .bind(new_run.total_jobs)
        .bind(new_run.credits)
        .bind(split.from_monthly)
        .bind(split.from_purchased)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for job in jobs {
            insert_job(&mut *tx, job, max_attempts).await?;
        }

        tx.commit().await?;

        info!(
            run_id = %new_run.run_id,
            tenant_id = %new_run.tenant_id,
            total_jobs = new_run.total_jobs,
            enqueued = jobs.len(),
            from_monthly = split.from_monthly,
            from_purchased = split.from_purchased,
            "Run created"
        );

        self.get_run(&new_run.tenant_id, &new_run.run_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("Run {}", new_run.run_id)))
    }

    /// Get a run by ID, scoped to its tenant.
    pub async fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ? AND tenant_id = ?")
            .bind(run_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_run).transpose()
    }

    // ========================================================================
    // Activation guard
    // ========================================================================

    /// QUEUED → RUNNING, stamping `started_at` exactly once.
    ///
    /// The transition is a conditional update on `status = 'QUEUED'`, so of two
    /// racing fan-out units only one can win it.
    pub async fn activate_run(&self, tenant_id: &str, run_id: &str) -> Result<Activation> {
        let mut tx = self.pool.begin().await?;
        let now = Self::now_millis();

        let claimed = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'RUNNING', started_at = ?, updated_at = ?
            WHERE id = ? AND tenant_id = ? AND status = 'QUEUED'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(run_id)
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 1 {
            tx.commit().await?;
            info!(run_id, tenant_id, "Run started");
            return Ok(Activation::Started);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE id = ? AND tenant_id = ?")
                .bind(run_id)
                .bind(tenant_id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.commit().await?;

        let status = status.ok_or_else(|| DbError::not_found(format!("Run {}", run_id)))?;
        match parse_status(&status)? {
            RunStatus::Running => Ok(Activation::AlreadyRunning),
            terminal if terminal.is_terminal() => Ok(Activation::Terminal(terminal)),
            other => Err(DbError::invalid_state(format!(
                "Run {} stayed {} after activation",
                run_id, other
            ))),
        }
    }

    // ========================================================================
    // Per-file recording
    // ========================================================================

    /// Write a transient (`pending`/`processing`/`retrying`) entry for one index.
    ///
    /// Never overwrites a terminal entry and never touches counters. Returns false
    /// when nothing was written (run terminal, or index already terminal).
    pub async fn upsert_transient_file_result(
        &self,
        tenant_id: &str,
        run_id: &str,
        result: &PerFileResult,
    ) -> Result<bool> {
        if result.status.is_terminal() {
            return Err(DbError::invalid_state(format!(
                "{} is not a transient file status",
                result.status
            )));
        }

        let sql = format!(
            r#"
            UPDATE workflow_runs
            SET per_file_results = {replace},
                updated_at = ?3
            WHERE id = ?4 AND tenant_id = ?5 AND {guard}
              AND NOT {terminal}
            "#,
            replace = REPLACE_FILE_ENTRY,
            guard = NON_TERMINAL,
            terminal = INDEX_ALREADY_TERMINAL,
        );

        let written = sqlx::query(&sql)
            .bind(i64::from(result.index))
            .bind(serde_json::to_string(result)?)
            .bind(Self::now_millis())
            .bind(run_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        debug!(run_id, index = result.index, status = %result.status, written, "Transient file result");
        Ok(written > 0)
    }

    /// Record a terminal (`completed`/`failed`) outcome for one index.
    ///
    /// One statement replaces the entry at this index, replaces the index's
    /// output asset, bumps the matching counter and returns the post-increment
    /// counters. The counter is only bumped the first time an index turns
    /// terminal, so a redelivered outcome cannot count twice.
    ///
    /// An index keeps its first terminal status: a `failed` write onto a
    /// `completed` index (or the reverse) leaves the entry and its asset as they
    /// are, and the counters come back unchanged.
    ///
    /// Returns `None` when the run is already terminal (nothing written).
    pub async fn record_file_outcome(
        &self,
        tenant_id: &str,
        run_id: &str,
        result: &PerFileResult,
    ) -> Result<Option<RunCounters>> {
        let (counter, other_outcome) = match result.status {
            FileResultStatus::Completed => ("completed_jobs", FileResultStatus::Failed),
            FileResultStatus::Failed => ("failed_jobs", FileResultStatus::Completed),
            other => {
                return Err(DbError::invalid_state(format!(
                    "{} is not a terminal file status",
                    other
                )))
            }
        };

        let sql = format!(
            r#"
            UPDATE workflow_runs
            SET per_file_results = CASE
                    WHEN {conflict} THEN per_file_results
                    ELSE {replace}
                END,
                output_asset_ids = CASE
                    WHEN {conflict} THEN output_asset_ids
                    WHEN ?3 IS NULL THEN {assets}
                    ELSE json_insert({assets}, '$[#]', ?3)
                END,
                {counter} = {counter} + CASE WHEN {terminal} THEN 0 ELSE 1 END,
                updated_at = ?4
            WHERE id = ?5 AND tenant_id = ?6 AND {guard}
            RETURNING completed_jobs, failed_jobs, total_jobs
            "#,
            replace = REPLACE_FILE_ENTRY,
            assets = ASSETS_WITHOUT_INDEX,
            counter = counter,
            terminal = INDEX_ALREADY_TERMINAL,
            conflict = INDEX_HOLDS_OTHER_OUTCOME,
            guard = NON_TERMINAL,
        );

        let row = sqlx::query(&sql)
            .bind(i64::from(result.index))
            .bind(serde_json::to_string(result)?)
            .bind(result.output_asset_id.as_deref())
            .bind(Self::now_millis())
            .bind(run_id)
            .bind(tenant_id)
            .bind(other_outcome.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let counters = row.as_ref().map(row_to_counters);
        match counters {
            Some(c) => info!(
                run_id,
                index = result.index,
                status = %result.status,
                completed = c.completed_jobs,
                failed = c.failed_jobs,
                total = c.total_jobs,
                "File outcome recorded"
            ),
            None => warn!(
                run_id,
                index = result.index,
                "File outcome ignored: run is terminal or missing"
            ),
        }
        Ok(counters)
    }

    /// Store the result fields of a single-job run.
    ///
    /// The single unit is the whole run, so `completed_jobs` saturates at
    /// `total_jobs` and a redelivery rewrites the same fields.
    pub async fn store_single_result(
        &self,
        tenant_id: &str,
        run_id: &str,
        result: &SingleResult,
    ) -> Result<Option<RunCounters>> {
        let sql = format!(
            r#"
            UPDATE workflow_runs
            SET assembled_prompt = ?,
                raw_llm_response = ?,
                token_usage = ?,
                output_asset_ids = json_array(?),
                validation_warnings = ?,
                completed_jobs = MIN(completed_jobs + 1, total_jobs),
                updated_at = ?
            WHERE id = ? AND tenant_id = ? AND {guard}
            RETURNING completed_jobs, failed_jobs, total_jobs
            "#,
            guard = NON_TERMINAL,
        );

        let row = sqlx::query(&sql)
            .bind(&result.assembled_prompt)
            .bind(&result.raw_llm_response)
            .bind(serde_json::to_string(&result.token_usage)?)
            .bind(&result.output_asset_id)
            .bind(serde_json::to_string(&result.warnings)?)
            .bind(Self::now_millis())
            .bind(run_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_counters))
    }

    // ========================================================================
    // Finalization
    // ========================================================================

    /// Decide and write the final status of a run.
    ///
    /// Runs under the run's write lock. Returns `None` when the run was already
    /// terminal, which makes a duplicate trigger a clean no-op (no second status
    /// write, no second refund).
    pub async fn finalize_run(&self, tenant_id: &str, run_id: &str) -> Result<Option<Finalization>> {
        let mut tx = self.pool.begin().await?;
        let run = lock_and_load_run(&mut *tx, tenant_id, run_id).await?;

        if run.status.is_terminal() {
            tx.commit().await?;
            debug!(run_id, status = %run.status, "Finalization skipped: run already terminal");
            return Ok(None);
        }

        let status = RunStatus::from_counts(run.completed_jobs, run.failed_jobs);
        let token_usage = if run.is_fan_out() {
            Some(
                run.per_file_results
                    .iter()
                    .filter_map(|r| r.token_usage)
                    .sum::<TokenUsage>(),
            )
        } else {
            run.token_usage
        };
        let error_message = fan_out_error_summary(&run, status);

        let finalization = write_terminal(
            &mut *tx,
            &run,
            TerminalUpdate {
                status,
                failed_jobs: run.failed_jobs,
                token_usage,
                error_message,
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            run_id,
            tenant_id,
            status = %finalization.status,
            duration_ms = finalization.duration_ms,
            refunded = finalization.refunded_credits,
            "Run finalized"
        );
        Ok(Some(finalization))
    }

    /// Mark a single-job run `FAILED` directly (own finalization, refund included).
    ///
    /// Guarded like activation: a terminal run is left untouched and `None` is
    /// returned.
    pub async fn fail_run(
        &self,
        tenant_id: &str,
        run_id: &str,
        error_message: &str,
    ) -> Result<Option<Finalization>> {
        let mut tx = self.pool.begin().await?;
        let run = lock_and_load_run(&mut *tx, tenant_id, run_id).await?;

        if run.status.is_terminal() {
            tx.commit().await?;
            debug!(run_id, status = %run.status, "Failure skipped: run already terminal");
            return Ok(None);
        }

        let finalization = write_terminal(
            &mut *tx,
            &run,
            TerminalUpdate {
                status: RunStatus::Failed,
                failed_jobs: (run.total_jobs - run.completed_jobs).max(1),
                token_usage: run.token_usage,
                error_message: Some(error_message.to_string()),
            },
        )
        .await?;
        tx.commit().await?;

        warn!(
            run_id,
            tenant_id,
            refunded = finalization.refunded_credits,
            error = error_message,
            "Run failed"
        );
        Ok(Some(finalization))
    }

    /// Mark a non-terminal run `CANCELLED`. In-flight jobs become no-ops at their
    /// next activation check or terminal write.
    pub async fn cancel_run(&self, tenant_id: &str, run_id: &str) -> Result<bool> {
        let now = Self::now_millis();
        let sql = format!(
            r#"
            UPDATE workflow_runs
            SET status = 'CANCELLED', completed_at = ?, updated_at = ?
            WHERE id = ? AND tenant_id = ? AND {guard}
            "#,
            guard = NON_TERMINAL,
        );
        let cancelled = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(run_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if cancelled > 0 {
            info!(run_id, tenant_id, "Run cancelled");
        }
        Ok(cancelled > 0)
    }
}

struct TerminalUpdate {
    status: RunStatus,
    failed_jobs: i64,
    token_usage: Option<TokenUsage>,
    error_message: Option<String>,
}

/// Take the run's write lock, then read it.
///
/// A no-op write comes first so the transaction never upgrades from a read lock,
/// which SQLite would answer with SQLITE_BUSY instead of waiting.
async fn lock_and_load_run(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    run_id: &str,
) -> Result<WorkflowRun> {
    let locked = sqlx::query("UPDATE workflow_runs SET updated_at = ? WHERE id = ? AND tenant_id = ?")
        .bind(ScrivenerDb::now_millis())
        .bind(run_id)
        .bind(tenant_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if locked == 0 {
        return Err(DbError::not_found(format!("Run {}", run_id)));
    }

    let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ? AND tenant_id = ?")
        .bind(run_id)
        .bind(tenant_id)
        .fetch_one(&mut *conn)
        .await?;
    row_to_run(&row)
}

/// Write a terminal status, refunding purchased credit when the run ends `FAILED`.
/// Caller holds the run lock and has checked the run is not terminal.
async fn write_terminal(
    conn: &mut SqliteConnection,
    run: &WorkflowRun,
    update: TerminalUpdate,
) -> Result<Finalization> {
    let now = ScrivenerDb::now_millis();
    let duration_ms = (now - run.started_at.unwrap_or(run.created_at)).max(0);
    let failed = update.status == RunStatus::Failed;

    let refunded_credits = if failed && run.credits_from_purchased > 0 {
        refund_purchased_credits(&mut *conn, &run.tenant_id, &run.id, run.credits_from_purchased)
            .await?;
        run.credits_from_purchased
    } else {
        0
    };

    // A failed run gives back everything: purchased by refund, monthly by no
    // longer counting in the monthly aggregate.
    let (consumed, from_monthly, from_purchased) = if failed {
        (0, 0, 0)
    } else {
        (
            run.credits_consumed,
            run.credits_from_monthly,
            run.credits_from_purchased,
        )
    };

    let token_usage_json = update
        .token_usage
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let sql = format!(
        r#"
        UPDATE workflow_runs
        SET status = ?, failed_jobs = ?, token_usage = ?, error_message = ?,
            credits_consumed = ?, credits_from_monthly = ?, credits_from_purchased = ?,
            completed_at = ?, duration_ms = ?, updated_at = ?
        WHERE id = ? AND tenant_id = ? AND {guard}
        "#,
        guard = NON_TERMINAL,
    );
    let written = sqlx::query(&sql)
        .bind(update.status.as_str())
        .bind(update.failed_jobs)
        .bind(token_usage_json)
        .bind(update.error_message.as_deref())
        .bind(consumed)
        .bind(from_monthly)
        .bind(from_purchased)
        .bind(now)
        .bind(duration_ms)
        .bind(now)
        .bind(&run.id)
        .bind(&run.tenant_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if written == 0 {
        return Err(DbError::invalid_state(format!(
            "Run {} changed while locked for finalization",
            run.id
        )));
    }

    Ok(Finalization {
        run_id: run.id.clone(),
        status: update.status,
        counters: RunCounters {
            completed_jobs: run.completed_jobs,
            failed_jobs: update.failed_jobs,
            total_jobs: run.total_jobs,
        },
        token_usage: update.token_usage,
        duration_ms,
        refunded_credits,
    })
}

fn fan_out_error_summary(run: &WorkflowRun, status: RunStatus) -> Option<String> {
    match status {
        RunStatus::Failed => {
            let first_error = run
                .per_file_results
                .iter()
                .filter(|r| r.status == FileResultStatus::Failed)
                .find_map(|r| r.error_message.clone());
            Some(match first_error {
                Some(error) => format!("All {} files failed. First error: {}", run.total_jobs, error),
                None => format!("All {} files failed", run.total_jobs),
            })
        }
        RunStatus::CompletedWithErrors => Some(format!(
            "{} of {} files failed",
            run.failed_jobs, run.total_jobs
        )),
        _ => run.error_message.clone(),
    }
}

fn parse_status(raw: &str) -> Result<RunStatus> {
    raw.parse::<RunStatus>()
        .map_err(|e| DbError::invalid_state(format!("Unknown run status: {}", e)))
}

fn row_to_counters(row: &SqliteRow) -> RunCounters {
    RunCounters {
        completed_jobs: row.get("completed_jobs"),
        failed_jobs: row.get("failed_jobs"),
        total_jobs: row.get("total_jobs"),
    }
}

fn row_to_run(row: &SqliteRow) -> Result<WorkflowRun> {
    let status: String = row.try_get("status")?;
    let token_usage: Option<String> = row.try_get("token_usage")?;
    let output_asset_ids: String = row.try_get("output_asset_ids")?;
    let per_file_results: String = row.try_get("per_file_results")?;
    let validation_warnings: String = row.try_get("validation_warnings")?;

    Ok(WorkflowRun {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        workflow_id: row.try_get("workflow_id")?,
        status: parse_status(&status)?,
        total_jobs: row.try_get("total_jobs")?,
        completed_jobs: row.try_get("completed_jobs")?,
        failed_jobs: row.try_get("failed_jobs")?,
        assembled_prompt: row.try_get("assembled_prompt")?,
        raw_llm_response: row.try_get("raw_llm_response")?,
        token_usage: token_usage
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        output_asset_ids: serde_json::from_str(&output_asset_ids)?,
        per_file_results: serde_json::from_str(&per_file_results)?,
        credits_consumed: row.try_get("credits_consumed")?,
        credits_from_monthly: row.try_get("credits_from_monthly")?,
        credits_from_purchased: row.try_get("credits_from_purchased")?,
        error_message: row.try_get("error_message")?,
        validation_warnings: serde_json::from_str(&validation_warnings)?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        updated_at: row.try_get("updated_at")?,
    })
}
