//! Billing ledger: the metering transaction and ledger queries.
//!
//! `billing_transactions` is append-only. The only write path is
//! [`Database::record_charge`], which inserts the ledger row and advances the
//! worker's billing cursor in a single transaction.

use super::{
    BillingTransactionRow, BillingTransactionView, ChargeOutcome, Database, LedgerCharge,
    UsageTotals,
};
use anyhow::Result;
use chrono::{DateTime, Utc};

const TRANSACTION_COLUMNS: &str = "t.id, t.user_id, t.org_id, t.endpoint_id, t.cluster_id,
     t.worker_id, t.gpu_type, t.gpu_count, t.billing_period_start, t.billing_period_end,
     t.duration_seconds, t.price_per_hour, t.amount, t.status, t.error_message, t.created_at";

impl Database {
    /// Insert a ledger row and advance the worker in one transaction.
    ///
    /// The worker update is conditional on the billing cursor still being the
    /// value the charge was computed from. If another writer moved it, the
    /// insert is rolled back and [`ChargeOutcome::Superseded`] is returned.
    pub async fn record_charge(&self, charge: &LedgerCharge) -> Result<ChargeOutcome> {
        let t = &charge.transaction;
        let mut tx = self.pool.begin().await?;

        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO billing_transactions (user_id, org_id, endpoint_id, cluster_id, worker_id,
                 gpu_type, gpu_count, billing_period_start, billing_period_end, duration_seconds,
                 price_per_hour, amount, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'success')
             ON CONFLICT (worker_id, billing_period_start) DO NOTHING
             RETURNING id",
        )
        .bind(&t.user_id)
        .bind(&t.org_id)
        .bind(t.endpoint_id)
        .bind(&t.cluster_id)
        .bind(&t.worker_id)
        .bind(&t.gpu_type)
        .bind(t.gpu_count)
        .bind(t.billing_period_start)
        .bind(t.billing_period_end)
        .bind(t.duration_seconds)
        .bind(t.price_per_hour)
        .bind(t.amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(transaction_id) = inserted else {
            tx.rollback().await?;
            return Ok(ChargeOutcome::Superseded);
        };

        let updated = sqlx::query(
            "UPDATE workers SET
               last_billed_at = $2,
               total_billed_seconds = total_billed_seconds + $3,
               total_billed_amount = total_billed_amount + $4,
               billing_status = CASE WHEN $5 THEN 'final_billed' ELSE billing_status END,
               updated_at = NOW()
             WHERE worker_id = $1
               AND billing_status = 'active'
               AND last_billed_at IS NOT DISTINCT FROM $6",
        )
        .bind(&t.worker_id)
        .bind(t.billing_period_end)
        .bind(t.duration_seconds)
        .bind(t.amount)
        .bind(charge.finalize)
        .bind(charge.expected_last_billed_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ChargeOutcome::Superseded);
        }

        tx.commit().await?;
        Ok(ChargeOutcome::Recorded { transaction_id })
    }

    pub async fn list_worker_transactions(
        &self,
        worker_id: &str,
    ) -> Result<Vec<BillingTransactionRow>> {
        let rows = sqlx::query_as::<_, BillingTransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM billing_transactions t
             WHERE t.worker_id = $1 ORDER BY t.billing_period_start"
        ))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// A tenant's ledger, newest first, with endpoint names attached.
    pub async fn list_user_transactions(
        &self,
        user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BillingTransactionView>> {
        let rows = sqlx::query_as::<_, BillingTransactionView>(&format!(
            "SELECT {TRANSACTION_COLUMNS}, e.logical_name, e.spec_name
             FROM billing_transactions t
             LEFT JOIN user_endpoints e ON e.id = t.endpoint_id
             WHERE t.user_id = $1
             ORDER BY t.created_at DESC, t.id DESC
             LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Successful charges for a tenant whose billing period starts in `[from, to)`.
    pub async fn usage_totals(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals> {
        let totals = sqlx::query_as::<_, UsageTotals>(
            "SELECT COUNT(*)::BIGINT AS transaction_count,
                    COALESCE(SUM(duration_seconds), 0)::BIGINT AS total_seconds,
                    COALESCE(SUM(amount), 0)::BIGINT AS total_amount
             FROM billing_transactions
             WHERE user_id = $1 AND status = 'success'
               AND billing_period_start >= $2 AND billing_period_start < $3",
        )
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(totals)
    }
}
