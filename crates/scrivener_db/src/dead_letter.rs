//! Dead-letter storage for jobs that exhausted their retries.

use sqlx::Row;
use tracing::info;

use crate::error::Result;
use crate::types::{DeadLetterEntry, DeadLetterRecord};
use crate::ScrivenerDb;

impl ScrivenerDb {
    /// Store a dead-letter entry. Returns the new row id.
    pub async fn insert_dead_letter(&self, entry: &DeadLetterEntry) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO dead_letter_jobs (
                original_job_id, run_id, tenant_id, failed_at, attempts_made, error_message, payload
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.original_job_id)
        .bind(entry.run_id.as_deref())
        .bind(entry.tenant_id.as_deref())
        .bind(entry.failed_at)
        .bind(i64::from(entry.attempts_made))
        .bind(&entry.error_message)
        .bind(&entry.payload)
        .execute(&self.pool)
        .await?;

        info!(
            job_id = %entry.original_job_id,
            run_id = entry.run_id.as_deref().unwrap_or("-"),
            attempts = entry.attempts_made,
            "Job moved to dead letter"
        );
        Ok(result.last_insert_rowid())
    }

    /// Most recent dead letters first.
    pub async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetterRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, original_job_id, run_id, tenant_id, failed_at, attempts_made, error_message, payload
            FROM dead_letter_jobs
            ORDER BY failed_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let attempts: i64 = row.try_get("attempts_made")?;
                Ok(DeadLetterRecord {
                    id: row.try_get("id")?,
                    entry: DeadLetterEntry {
                        original_job_id: row.try_get("original_job_id")?,
                        run_id: row.try_get("run_id")?,
                        tenant_id: row.try_get("tenant_id")?,
                        failed_at: row.try_get("failed_at")?,
                        attempts_made: u32::try_from(attempts).unwrap_or(0),
                        error_message: row.try_get("error_message")?,
                        payload: row.try_get("payload")?,
                    },
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_id: &str, failed_at: i64) -> DeadLetterEntry {
        DeadLetterEntry {
            original_job_id: job_id.to_string(),
            run_id: Some("run-1".to_string()),
            tenant_id: None,
            failed_at,
            attempts_made: 3,
            error_message: "provider timed out".to_string(),
            payload: r#"{"tenantId":"t-1"}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_dead_letters_listed_newest_first() {
        let db = ScrivenerDb::open_in_memory().await.unwrap();
        db.insert_dead_letter(&entry("old", 1_000)).await.unwrap();
        db.insert_dead_letter(&entry("new", 2_000)).await.unwrap();

        let records = db.list_dead_letters(10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].entry.original_job_id, "new");
        assert_eq!(records[1].entry, entry("old", 1_000));

        assert_eq!(db.list_dead_letters(1).await.unwrap().len(), 1);
    }
}
