//! Tenant credit balances.
//!
//! Two balances exist: a monthly allowance and purchased credit. Monthly usage is
//! never stored as a balance; it is a live aggregate of `credits_from_monthly`
//! over the current month's non-failed runs, so a failed run gives its monthly
//! share back simply by no longer counting. Purchased credit is a real balance and
//! is refunded explicitly (see [`refund_purchased_credits`]).

use chrono::{Datelike, TimeZone, Utc};
use sqlx::{Row, SqliteConnection};
use tracing::info;

use crate::error::{DbError, Result};
use crate::types::Tenant;
use crate::ScrivenerDb;

/// How a run's cost was split across the two balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CreditSplit {
    pub from_monthly: i64,
    pub from_purchased: i64,
}

impl ScrivenerDb {
    /// Create a tenant with the given balances.
    pub async fn create_tenant(
        &self,
        tenant_id: &str,
        name: &str,
        monthly_credit_allowance: i64,
        purchased_credits: i64,
    ) -> Result<()> {
        let now = Self::now_millis();
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, monthly_credit_allowance, purchased_credits, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tenant_id)
        .bind(name)
        .bind(monthly_credit_allowance)
        .bind(purchased_credits)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a tenant by ID
    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = ?")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Tenant {
            id: row.get("id"),
            name: row.get("name"),
            monthly_credit_allowance: row.get("monthly_credit_allowance"),
            purchased_credits: row.get("purchased_credits"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    /// Monthly credit consumed this calendar month (UTC) by non-failed runs.
    pub async fn monthly_credits_used(&self, tenant_id: &str) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        monthly_credits_used(&mut conn, tenant_id).await
    }
}

pub(crate) async fn monthly_credits_used(
    conn: &mut SqliteConnection,
    tenant_id: &str,
) -> Result<i64> {
    let used: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(credits_from_monthly), 0)
        FROM workflow_runs
        WHERE tenant_id = ? AND status <> 'FAILED' AND created_at >= ?
        "#,
    )
    .bind(tenant_id)
    .bind(month_start_millis())
    .fetch_one(conn)
    .await?;

    Ok(used)
}

/// Take an exclusive lock on a tenant row.
///
/// SQLite has no `SELECT ... FOR UPDATE`; a no-op write is the first statement of
/// the transaction so the write lock is held from here until commit, serializing
/// concurrent debits and refunds.
pub(crate) async fn lock_tenant_row(conn: &mut SqliteConnection, tenant_id: &str) -> Result<()> {
    let locked = sqlx::query("UPDATE tenants SET updated_at = ? WHERE id = ?")
        .bind(ScrivenerDb::now_millis())
        .bind(tenant_id)
        .execute(conn)
        .await?
        .rows_affected();

    if locked == 0 {
        return Err(DbError::not_found(format!("Tenant {}", tenant_id)));
    }
    Ok(())
}

/// Split a run's cost across the monthly allowance and purchased credit and debit
/// the purchased share. Caller must hold the tenant lock.
pub(crate) async fn debit_run_credits(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    credits: i64,
) -> Result<CreditSplit> {
    let row = sqlx::query(
        "SELECT monthly_credit_allowance, purchased_credits FROM tenants WHERE id = ?",
    )
    .bind(tenant_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DbError::not_found(format!("Tenant {}", tenant_id)))?;

    let allowance: i64 = row.get("monthly_credit_allowance");
    let purchased: i64 = row.get("purchased_credits");
    let used = monthly_credits_used(&mut *conn, tenant_id).await?;

    let split = split_credits(credits, (allowance - used).max(0));
    if split.from_purchased > purchased {
        return Err(DbError::InsufficientCredits {
            tenant_id: tenant_id.to_string(),
            needed: credits,
            available: (allowance - used).max(0) + purchased,
        });
    }

    if split.from_purchased > 0 {
        sqlx::query("UPDATE tenants SET purchased_credits = purchased_credits - ? WHERE id = ?")
            .bind(split.from_purchased)
            .bind(tenant_id)
            .execute(&mut *conn)
            .await?;
    }

    Ok(split)
}

/// Return purchased credit to a tenant. Caller runs this inside the transaction
/// that decided the refund.
pub(crate) async fn refund_purchased_credits(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    run_id: &str,
    amount: i64,
) -> Result<()> {
    lock_tenant_row(&mut *conn, tenant_id).await?;
    sqlx::query("UPDATE tenants SET purchased_credits = purchased_credits + ? WHERE id = ?")
        .bind(amount)
        .bind(tenant_id)
        .execute(&mut *conn)
        .await?;

    info!(tenant_id, run_id, amount, "Refunded purchased credits");
    Ok(())
}

/// Monthly allowance is consumed first.
pub(crate) fn split_credits(credits: i64, monthly_available: i64) -> CreditSplit {
    let from_monthly = credits.min(monthly_available).max(0);
    CreditSplit {
        from_monthly,
        from_purchased: credits - from_monthly,
    }
}

fn month_start_millis() -> i64 {
    let now = Utc::now();
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .map(|start| start.timestamp_millis())
        .unwrap_or(0)
}
