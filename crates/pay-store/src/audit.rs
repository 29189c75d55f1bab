//! Relational audit trail for payments.
//!
//! The audit store is recovery-only: it is written off the hot path and read
//! once at startup to re-enqueue payments that never reached a terminal
//! state. The summary endpoint never touches it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pay_common::{Payment, PaymentJob, PaymentStatus, ProcessorKind};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::Result;

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert the row for a newly accepted payment. A duplicate
    /// `correlation_id` is ignored, matching the ingress dedup.
    async fn record_accepted(&self, payment: &Payment) -> Result<()>;

    async fn mark_processing(&self, payment_id: Uuid) -> Result<()>;

    async fn mark_completed(
        &self,
        payment_id: Uuid,
        processor: ProcessorKind,
        processed_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_failed(&self, payment_id: Uuid) -> Result<()>;

    /// Jobs for every payment still in Pending or Processing, oldest first.
    /// Used at startup to recover work lost with a crashed worker.
    async fn scan_incomplete(&self) -> Result<Vec<PaymentJob>>;

    /// Test-only wipe.
    async fn clear(&self) -> Result<()>;
}

// ============================================================================
// Postgres
// ============================================================================

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payments (
                id UUID PRIMARY KEY,
                correlation_id UUID NOT NULL UNIQUE,
                amount_cents BIGINT NOT NULL,
                status TEXT NOT NULL,
                processor TEXT,
                requested_at TIMESTAMPTZ NOT NULL,
                processed_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS idx_payments_status ON payments(status);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn record_accepted(&self, payment: &Payment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (id, correlation_id, amount_cents, status, requested_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(payment.id)
        .bind(payment.correlation_id)
        .bind(payment.amount_cents)
        .bind(payment.status.as_str())
        .bind(payment.requested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_processing(&self, payment_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE payments SET status = $1 WHERE id = $2 AND status = $3")
            .bind(PaymentStatus::Processing.as_str())
            .bind(payment_id)
            .bind(PaymentStatus::Pending.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        payment_id: Uuid,
        processor: ProcessorKind,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE payments SET status = $1, processor = $2, processed_at = $3 WHERE id = $4",
        )
        .bind(PaymentStatus::Completed.as_str())
        .bind(processor.as_str())
        .bind(processed_at)
        .bind(payment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, payment_id: Uuid) -> Result<()> {
        // Completed is terminal; a late failure mark must not regress it.
        sqlx::query("UPDATE payments SET status = $1 WHERE id = $2 AND status != $3")
            .bind(PaymentStatus::Failed.as_str())
            .bind(payment_id)
            .bind(PaymentStatus::Completed.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn scan_incomplete(&self) -> Result<Vec<PaymentJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, amount_cents, requested_at
            FROM payments
            WHERE status IN ('pending', 'processing')
            ORDER BY requested_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let jobs: Vec<PaymentJob> = rows
            .into_iter()
            .map(|row| PaymentJob {
                payment_id: row.get("id"),
                correlation_id: row.get("correlation_id"),
                amount_cents: row.get("amount_cents"),
                requested_at: row.get("requested_at"),
            })
            .collect();

        if !jobs.is_empty() {
            info!(count = jobs.len(), "found incomplete payments in audit store");
        }
        Ok(jobs)
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("TRUNCATE payments").execute(&self.pool).await?;
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-memory audit trail, used in tests and when the gateway runs without a
/// relational store (`AUDIT_ENABLED=false`).
#[derive(Default)]
pub struct MemoryAuditStore {
    rows: Mutex<HashMap<Uuid, Payment>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, payment_id: Uuid) -> Option<PaymentStatus> {
        self.rows.lock().get(&payment_id).map(|p| p.status)
    }

    pub fn row(&self, payment_id: Uuid) -> Option<Payment> {
        self.rows.lock().get(&payment_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn record_accepted(&self, payment: &Payment) -> Result<()> {
        let mut rows = self.rows.lock();
        let duplicate = rows
            .values()
            .any(|p| p.correlation_id == payment.correlation_id);
        if !duplicate {
            rows.insert(payment.id, payment.clone());
        }
        Ok(())
    }

    async fn mark_processing(&self, payment_id: Uuid) -> Result<()> {
        let mut rows = self.rows.lock();
        if let Some(payment) = rows.get_mut(&payment_id) {
            if payment.status == PaymentStatus::Pending {
                payment.status = PaymentStatus::Processing;
            }
        }
        Ok(())
    }

    async fn mark_completed(
        &self,
        payment_id: Uuid,
        processor: ProcessorKind,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut rows = self.rows.lock();
        if let Some(payment) = rows.get_mut(&payment_id) {
            payment.status = PaymentStatus::Completed;
            payment.processor = Some(processor);
            payment.processed_at = Some(processed_at);
        }
        Ok(())
    }

    async fn mark_failed(&self, payment_id: Uuid) -> Result<()> {
        let mut rows = self.rows.lock();
        if let Some(payment) = rows.get_mut(&payment_id) {
            if payment.status != PaymentStatus::Completed {
                payment.status = PaymentStatus::Failed;
            }
        }
        Ok(())
    }

    async fn scan_incomplete(&self) -> Result<Vec<PaymentJob>> {
        let rows = self.rows.lock();
        let mut incomplete: Vec<&Payment> = rows
            .values()
            .filter(|p| {
                matches!(
                    p.status,
                    PaymentStatus::Pending | PaymentStatus::Processing
                )
            })
            .collect();
        incomplete.sort_by_key(|p| p.requested_at);
        Ok(incomplete.into_iter().map(Payment::job).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.rows.lock().clear();
        Ok(())
    }
}
