//! In-memory implementations of the storage seams.
//!
//! Single-process stand-ins used by unit and integration tests. Jobs are held
//! as serialized JSON so queue round-trips exercise the same encoding as the
//! Redis store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pay_common::{PaymentJob, ProcessorHealth, ProcessorKind, ProcessorTotals, SummaryTotals};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::traits::{
    CompletionOutcome, HealthCache, JobConsumer, JobQueue, PurgeStore, SummaryStore,
};
use crate::Result;

#[derive(Default)]
struct IndexEntry {
    requested_at_ms: i64,
    amount_cents: i64,
}

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<String>>,
    accepted: Mutex<HashSet<Uuid>>,
    completed: Mutex<HashSet<Uuid>>,
    totals: Mutex<SummaryTotals>,
    index: Mutex<HashMap<ProcessorKind, Vec<IndexEntry>>>,
    health: Mutex<HashMap<ProcessorKind, (ProcessorHealth, Instant)>>,
    probes: Mutex<HashMap<ProcessorKind, Instant>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    notify: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn publish(&self, job: &PaymentJob) -> Result<()> {
        let body = serde_json::to_string(job)?;
        self.inner.queue.lock().push_back(body);
        self.notify.notify_one();
        Ok(())
    }

    async fn requeue(&self, job: &PaymentJob) -> Result<()> {
        self.publish(job).await
    }

    async fn depth(&self) -> Result<u64> {
        Ok(self.inner.queue.lock().len() as u64)
    }

    async fn consumer(&self) -> Result<Box<dyn JobConsumer>> {
        Ok(Box::new(MemoryJobConsumer {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
        }))
    }
}

pub struct MemoryJobConsumer {
    inner: Arc<Inner>,
    notify: Arc<Notify>,
}

#[async_trait]
impl JobConsumer for MemoryJobConsumer {
    async fn consume(&mut self, timeout: Duration) -> Result<Option<PaymentJob>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(body) = self.inner.queue.lock().pop_front() {
                let job: PaymentJob = serde_json::from_str(&body)?;
                return Ok(Some(job));
            }

            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn try_accept(&self, correlation_id: Uuid) -> Result<bool> {
        Ok(self.inner.accepted.lock().insert(correlation_id))
    }

    async fn release_accept(&self, correlation_id: Uuid) -> Result<()> {
        self.inner.accepted.lock().remove(&correlation_id);
        Ok(())
    }

    async fn complete(
        &self,
        job: &PaymentJob,
        processor: ProcessorKind,
    ) -> Result<CompletionOutcome> {
        // Flag check, aggregate update, and index insert under one lock to
        // mirror the atomicity of the Redis script.
        let mut completed = self.inner.completed.lock();
        if !completed.insert(job.correlation_id) {
            return Ok(CompletionOutcome::AlreadyCompleted);
        }

        let mut totals = self.inner.totals.lock();
        let entry = totals.for_kind_mut(processor);
        entry.total_requests += 1;
        entry.total_amount_cents += job.amount_cents;

        self.inner
            .index
            .lock()
            .entry(processor)
            .or_default()
            .push(IndexEntry {
                requested_at_ms: job.requested_at.timestamp_millis(),
                amount_cents: job.amount_cents,
            });

        Ok(CompletionOutcome::Recorded)
    }

    async fn summary(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<SummaryTotals> {
        if from.is_none() && to.is_none() {
            return Ok(*self.inner.totals.lock());
        }

        let min = from.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let max = to.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX);

        let index = self.inner.index.lock();
        let mut out = SummaryTotals::default();
        for kind in ProcessorKind::ALL {
            let mut totals = ProcessorTotals::default();
            for entry in index.get(&kind).map(Vec::as_slice).unwrap_or(&[]) {
                if entry.requested_at_ms >= min && entry.requested_at_ms <= max {
                    totals.total_requests += 1;
                    totals.total_amount_cents += entry.amount_cents;
                }
            }
            *out.for_kind_mut(kind) = totals;
        }
        Ok(out)
    }
}

#[async_trait]
impl HealthCache for MemoryStore {
    async fn get(&self, kind: ProcessorKind) -> Result<Option<ProcessorHealth>> {
        let mut health = self.inner.health.lock();
        match health.get(&kind) {
            Some((entry, expiry)) if *expiry > Instant::now() => Ok(Some(*entry)),
            Some(_) => {
                health.remove(&kind);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        kind: ProcessorKind,
        health: &ProcessorHealth,
        ttl: Duration,
    ) -> Result<()> {
        self.inner
            .health
            .lock()
            .insert(kind, (*health, Instant::now() + ttl));
        Ok(())
    }

    async fn claim_probe(&self, kind: ProcessorKind, window: Duration) -> Result<bool> {
        let mut probes = self.inner.probes.lock();
        let now = Instant::now();
        match probes.get(&kind) {
            Some(last) if now.duration_since(*last) < window => Ok(false),
            _ => {
                probes.insert(kind, now);
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl PurgeStore for MemoryStore {
    async fn purge(&self) -> Result<()> {
        self.inner.queue.lock().clear();
        self.inner.accepted.lock().clear();
        self.inner.completed.lock().clear();
        *self.inner.totals.lock() = SummaryTotals::default();
        self.inner.index.lock().clear();
        self.inner.health.lock().clear();
        self.inner.probes.lock().clear();
        Ok(())
    }
}
