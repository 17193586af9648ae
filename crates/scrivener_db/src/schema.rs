//! Database schema creation for all Scrivener tables.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::Result;
use crate::ScrivenerDb;
use tracing::debug;

impl ScrivenerDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        self.create_tenant_tables().await?;
        self.create_run_tables().await?;
        self.create_queue_tables().await?;

        debug!("Database schema verified");
        Ok(())
    }

    /// Tenants and their credit balances
    async fn create_tenant_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                monthly_credit_allowance INTEGER NOT NULL DEFAULT 0,
                purchased_credits INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Workflow runs with embedded per-file results
    async fn create_run_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS workflow_runs (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'QUEUED' CHECK (status IN (
                    'QUEUED', 'RUNNING', 'COMPLETED', 'COMPLETED_WITH_ERRORS', 'FAILED', 'CANCELLED'
                )),
                total_jobs INTEGER NOT NULL DEFAULT 1,
                completed_jobs INTEGER NOT NULL DEFAULT 0,
                failed_jobs INTEGER NOT NULL DEFAULT 0,
                assembled_prompt TEXT,
                raw_llm_response TEXT,
                token_usage TEXT,
                output_asset_ids TEXT NOT NULL DEFAULT '[]',
                per_file_results TEXT NOT NULL DEFAULT '[]',
                credits_consumed INTEGER NOT NULL DEFAULT 0,
                credits_from_monthly INTEGER NOT NULL DEFAULT 0,
                credits_from_purchased INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                validation_warnings TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                duration_ms INTEGER,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_runs_tenant_status ON workflow_runs(tenant_id, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_runs_tenant_created ON workflow_runs(tenant_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Job queue and dead letters
    async fn create_queue_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS job_queue (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'QUEUED' CHECK (status IN (
                    'QUEUED', 'ACTIVE', 'COMPLETED', 'FAILED'
                )),
                attempts_made INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                locked_until INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                finished_at INTEGER
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_job_queue_claim ON job_queue(status, available_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS dead_letter_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_job_id TEXT NOT NULL,
                run_id TEXT,
                tenant_id TEXT,
                failed_at INTEGER NOT NULL,
                attempts_made INTEGER NOT NULL,
                error_message TEXT NOT NULL,
                payload TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dead_letter_run ON dead_letter_jobs(run_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
