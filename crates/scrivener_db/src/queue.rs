//! Job queue operations.
//!
//! At-least-once delivery: a claimed job carries a lock deadline, and a job whose
//! worker vanished (lock expired while still `ACTIVE`) is claimable again. Job ids
//! are caller-chosen so a fan-out enqueue is idempotent.

use sqlx::{Row, SqliteConnection};
use tracing::{debug, warn};

use crate::error::{DbError, Result};
use crate::types::*;
use crate::ScrivenerDb;

impl ScrivenerDb {
    /// Add a job. Returns false when a job with this id already exists.
    pub async fn enqueue_job(&self, job_id: &str, payload: &str, max_attempts: u32) -> Result<bool> {
        let now = Self::now_millis();
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO job_queue (id, payload, status, max_attempts, available_at, created_at)
            VALUES (?, ?, 'QUEUED', ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(payload)
        .bind(i64::from(max_attempts.max(1)))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        debug!(job_id, inserted, "Job enqueued");
        Ok(inserted > 0)
    }

    /// Claim the next due job (atomic claim).
    ///
    /// Picks a `QUEUED` job whose backoff has elapsed, or an `ACTIVE` job whose lock
    /// expired. Selection and claim are one statement, so two workers never claim
    /// the same row.
    pub async fn claim_job(&self, lock_duration_ms: i64) -> Result<Option<ClaimedJob>> {
        let now = Self::now_millis();
        let row = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'ACTIVE',
                attempts_made = attempts_made + 1,
                locked_until = ?1
            WHERE id = (
                SELECT id FROM job_queue
                WHERE (status = 'QUEUED' AND available_at <= ?2)
                   OR (status = 'ACTIVE' AND locked_until < ?2)
                ORDER BY available_at ASC, created_at ASC
                LIMIT 1
            )
            RETURNING id, payload, attempts_made, max_attempts
            "#,
        )
        .bind(now + lock_duration_ms)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let attempts_made: i64 = row.try_get("attempts_made")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;
        let job = ClaimedJob {
            id: row.try_get("id")?,
            payload: row.try_get("payload")?,
            attempts_made: u32::try_from(attempts_made).unwrap_or(u32::MAX),
            max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
        };

        if job.attempts_made > 1 {
            debug!(job_id = %job.id, attempt = job.attempts_made, "Job redelivered");
        }
        Ok(Some(job))
    }

    /// Mark a claimed job done.
    pub async fn complete_job(&self, job_id: &str) -> Result<()> {
        self.finish_job(job_id, "COMPLETED", None).await
    }

    /// Mark a claimed job permanently failed.
    pub async fn fail_job(&self, job_id: &str, error: &str) -> Result<()> {
        self.finish_job(job_id, "FAILED", Some(error)).await
    }

    /// Put a claimed job back with a backoff delay.
    pub async fn retry_job(&self, job_id: &str, error: &str, backoff_ms: i64) -> Result<()> {
        let now = Self::now_millis();
        let updated = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'QUEUED', available_at = ?, locked_until = NULL, last_error = ?
            WHERE id = ? AND status = 'ACTIVE'
            "#,
        )
        .bind(now + backoff_ms.max(0))
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            warn!(job_id, "Retry ignored: job is not active");
        }
        Ok(())
    }

    async fn finish_job(&self, job_id: &str, status: &str, error: Option<&str>) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = ?, finished_at = ?, locked_until = NULL,
                last_error = COALESCE(?, last_error)
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(Self::now_millis())
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(DbError::not_found(format!("Job {}", job_id)));
        }
        Ok(())
    }

    /// Current state of a queue row.
    pub async fn job_state(&self, job_id: &str) -> Result<Option<QueueJobState>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM job_queue WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        status
            .map(|s| {
                QueueJobState::from_db(&s)
                    .ok_or_else(|| DbError::invalid_state(format!("Unknown job status: {}", s)))
            })
            .transpose()
    }

    /// Get queue statistics
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total,
                COALESCE(SUM(CASE WHEN status = 'QUEUED' THEN 1 ELSE 0 END), 0) as queued,
                COALESCE(SUM(CASE WHEN status = 'ACTIVE' THEN 1 ELSE 0 END), 0) as active,
                COALESCE(SUM(CASE WHEN status = 'COMPLETED' THEN 1 ELSE 0 END), 0) as completed,
                COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0) as failed
            FROM job_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |name: &str| -> Result<u64> {
            let value: i64 = row.try_get(name)?;
            Ok(u64::try_from(value).unwrap_or(0))
        };

        Ok(QueueStats {
            total: count("total")?,
            queued: count("queued")?,
            active: count("active")?,
            completed: count("completed")?,
            failed: count("failed")?,
        })
    }
}

/// Insert a queue row inside the caller's transaction.
///
/// Unlike `enqueue_job` this fails on an existing id, so the enclosing
/// transaction rolls back instead of silently sharing a stale row.
pub(crate) async fn insert_job(
    conn: &mut SqliteConnection,
    job: &NewJob,
    max_attempts: u32,
) -> Result<()> {
    let now = ScrivenerDb::now_millis();
    sqlx::query(
        r#"
        INSERT INTO job_queue (id, payload, status, max_attempts, available_at, created_at)
        VALUES (?, ?, 'QUEUED', ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(&job.payload)
    .bind(i64::from(max_attempts.max(1)))
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    debug!(job_id = %job.id, "Job enqueued with run");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let db = ScrivenerDb::open_in_memory().await.unwrap();
        assert!(db.enqueue_job("run-1:file:0", "{}", 3).await.unwrap());
        assert!(!db.enqueue_job("run-1:file:0", "{}", 3).await.unwrap());
        assert_eq!(db.queue_stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_claim_complete_cycle() {
        let db = ScrivenerDb::open_in_memory().await.unwrap();
        db.enqueue_job("job-a", r#"{"k":1}"#, 3).await.unwrap();

        let job = db.claim_job(60_000).await.unwrap().unwrap();
        assert_eq!(job.id, "job-a");
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.max_attempts, 3);
        assert!(db.claim_job(60_000).await.unwrap().is_none());

        db.complete_job("job-a").await.unwrap();
        assert_eq!(
            db.job_state("job-a").await.unwrap(),
            Some(QueueJobState::Completed)
        );

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_retry_respects_backoff() {
        let db = ScrivenerDb::open_in_memory().await.unwrap();
        db.enqueue_job("job-b", "{}", 3).await.unwrap();

        db.claim_job(60_000).await.unwrap().unwrap();
        db.retry_job("job-b", "boom", 60_000).await.unwrap();
        assert!(db.claim_job(60_000).await.unwrap().is_none());

        db.enqueue_job("job-c", "{}", 3).await.unwrap();
        db.retry_job("job-c", "not active", 0).await.unwrap();
        assert_eq!(db.job_state("job-c").await.unwrap(), Some(QueueJobState::Queued));
    }

    #[tokio::test]
    async fn test_expired_lock_is_redelivered() {
        let db = ScrivenerDb::open_in_memory().await.unwrap();
        db.enqueue_job("job-d", "{}", 3).await.unwrap();

        // Negative lock duration: the claim is already stale.
        let first = db.claim_job(-1).await.unwrap().unwrap();
        assert_eq!(first.attempts_made, 1);

        let second = db.claim_job(60_000).await.unwrap().unwrap();
        assert_eq!(second.id, "job-d");
        assert_eq!(second.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_fail_job_records_error() {
        let db = ScrivenerDb::open_in_memory().await.unwrap();
        db.enqueue_job("job-e", "{}", 1).await.unwrap();
        db.claim_job(60_000).await.unwrap();
        db.fail_job("job-e", "bad payload").await.unwrap();

        assert_eq!(db.job_state("job-e").await.unwrap(), Some(QueueJobState::Failed));
        assert!(db.fail_job("missing", "x").await.unwrap_err().is_not_found());
    }
}
