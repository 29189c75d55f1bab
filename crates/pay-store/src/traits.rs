//! Trait seams between the routing engine and its storage.
//!
//! Production runs against Redis; tests run against the in-memory
//! implementations. The worker pool and HTTP layer only ever see these
//! traits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pay_common::{PaymentJob, ProcessorHealth, ProcessorKind, SummaryTotals};
use uuid::Uuid;

use crate::Result;

/// A durable FIFO of payment jobs shared by all gateway replicas.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job. Must succeed before the ingress acknowledges a payment.
    async fn publish(&self, job: &PaymentJob) -> Result<()>;

    /// Put a job back at the tail of the queue, byte-for-byte identical to
    /// what was consumed. No delay, no priority.
    async fn requeue(&self, job: &PaymentJob) -> Result<()>;

    /// Number of jobs currently waiting.
    async fn depth(&self) -> Result<u64>;

    /// A dedicated consumer handle. Blocking consumes must not stall other
    /// traffic, so each worker owns one of these.
    async fn consumer(&self) -> Result<Box<dyn JobConsumer>>;
}

/// A blocking consumer over the job queue. At-most-one delivery per call.
#[async_trait]
pub trait JobConsumer: Send {
    /// Block up to `timeout` for the next job; `Ok(None)` on timeout.
    async fn consume(&mut self, timeout: Duration) -> Result<Option<PaymentJob>>;
}

/// Shared, TTL-bounded record of processor availability.
#[async_trait]
pub trait HealthCache: Send + Sync {
    /// `Ok(None)` when no entry exists or it has expired.
    async fn get(&self, kind: ProcessorKind) -> Result<Option<ProcessorHealth>>;

    async fn put(&self, kind: ProcessorKind, health: &ProcessorHealth, ttl: Duration) -> Result<()>;

    /// Atomically claim the right to probe `kind`. Returns false when any
    /// replica already probed within `window`, which keeps the fleet under
    /// the processors' one-call-per-window rate limit.
    async fn claim_probe(&self, kind: ProcessorKind, window: Duration) -> Result<bool>;
}

/// Outcome of the atomic completion step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// First completion for this correlation id; aggregates were incremented.
    Recorded,
    /// The completion flag was already set; nothing changed.
    AlreadyCompleted,
}

/// Per-processor aggregates plus the dedup flags that guard them.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Best-effort ingress dedup: true the first time a correlation id is
    /// seen, false on resubmission.
    async fn try_accept(&self, correlation_id: Uuid) -> Result<bool>;

    /// Undo [`try_accept`](Self::try_accept) when the enqueue that followed
    /// it failed, so the client can retry the same correlation id.
    async fn release_accept(&self, correlation_id: Uuid) -> Result<()>;

    /// Atomically record a completed payment: set the completion flag,
    /// increment the processor's aggregates, and index the payment by its
    /// `requested_at` for windowed summaries. Idempotent per correlation id.
    async fn complete(&self, job: &PaymentJob, processor: ProcessorKind)
        -> Result<CompletionOutcome>;

    /// Aggregated totals, optionally bounded (inclusive) by `requested_at`.
    async fn summary(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<SummaryTotals>;
}

/// Test-only wipe of all queue, aggregate, dedup, and health state.
#[async_trait]
pub trait PurgeStore: Send + Sync {
    async fn purge(&self) -> Result<()>;
}
