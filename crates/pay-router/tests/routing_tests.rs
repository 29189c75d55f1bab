//! Routing and worker pool tests
//!
//! Drives the routing engine through scripted processor behavior and the
//! in-memory storage seams:
//! - processor preference and failover
//! - breaker gating of repeatedly failing processors
//! - requeue-on-exhaustion and terminal rejection
//! - exactly-once aggregation under duplicate deliveries
//! - graceful shutdown with in-flight jobs

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pay_common::{PaymentJob, PaymentStatus, ProcessorHealth, ProcessorKind};
use pay_router::{
    BreakerState, HealthMonitor, HealthMonitorConfig, PaymentRouter, ProcessorAck, ProcessorApi,
    ProcessorError, RouteOutcome, ServiceHealth, WorkerPool, WorkerPoolConfig,
};
use pay_store::{AuditStore, HealthCache, JobQueue, MemoryAuditStore, MemoryStore, SummaryStore};
use tokio::sync::broadcast;
use uuid::Uuid;

/// One scripted reply for a processor.
#[derive(Clone)]
enum Reply {
    Ok(ProcessorAck),
    Transient,
    Permanent(u16),
    SlowOk(Duration),
}

/// Processor mock: replies are consumed per processor in order; an empty
/// script means unconditional success.
#[derive(Default)]
struct ScriptedProcessor {
    replies: Mutex<HashMap<ProcessorKind, VecDeque<Reply>>>,
    calls: Mutex<Vec<(ProcessorKind, Uuid)>>,
    failing_health: Mutex<HashSet<ProcessorKind>>,
}

impl ScriptedProcessor {
    fn new() -> Self {
        Self::default()
    }

    fn push(&self, kind: ProcessorKind, reply: Reply) {
        self.replies.lock().entry(kind).or_default().push_back(reply);
    }

    fn push_n(&self, kind: ProcessorKind, reply: Reply, n: usize) {
        for _ in 0..n {
            self.push(kind, reply.clone());
        }
    }

    fn calls_to(&self, kind: ProcessorKind) -> usize {
        self.calls.lock().iter().filter(|(k, _)| *k == kind).count()
    }

    fn set_health_failing(&self, kind: ProcessorKind) {
        self.failing_health.lock().insert(kind);
    }
}

#[async_trait]
impl ProcessorApi for ScriptedProcessor {
    async fn submit_payment(
        &self,
        kind: ProcessorKind,
        job: &PaymentJob,
    ) -> Result<ProcessorAck, ProcessorError> {
        self.calls.lock().push((kind, job.correlation_id));
        let reply = self
            .replies
            .lock()
            .get_mut(&kind)
            .and_then(|queue| queue.pop_front());

        match reply {
            None | Some(Reply::Ok(ProcessorAck::Processed)) => Ok(ProcessorAck::Processed),
            Some(Reply::Ok(ack)) => Ok(ack),
            Some(Reply::Transient) => Err(ProcessorError::Transient {
                kind,
                reason: "scripted failure".to_string(),
            }),
            Some(Reply::Permanent(status)) => Err(ProcessorError::Permanent { kind, status }),
            Some(Reply::SlowOk(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(ProcessorAck::Processed)
            }
        }
    }

    async fn check_health(&self, kind: ProcessorKind) -> Result<ServiceHealth, ProcessorError> {
        Ok(ServiceHealth {
            failing: self.failing_health.lock().contains(&kind),
            min_response_time: 1,
        })
    }
}

fn job_of(cents: i64) -> PaymentJob {
    PaymentJob {
        payment_id: Uuid::new_v4(),
        correlation_id: Uuid::new_v4(),
        amount_cents: cents,
        requested_at: Utc::now(),
    }
}

struct Harness {
    store: MemoryStore,
    audit: Arc<MemoryAuditStore>,
    processor: Arc<ScriptedProcessor>,
    router: Arc<PaymentRouter>,
}

fn harness() -> Harness {
    let store = MemoryStore::new();
    let audit = Arc::new(MemoryAuditStore::new());
    let processor = Arc::new(ScriptedProcessor::new());
    let router = Arc::new(PaymentRouter::new(
        processor.clone(),
        Arc::new(store.clone()),
    ));
    Harness {
        store,
        audit,
        processor,
        router,
    }
}

fn pool_of(h: &Harness, workers: usize) -> WorkerPool {
    WorkerPool::new(
        Arc::new(h.store.clone()),
        Arc::new(h.store.clone()),
        h.audit.clone(),
        h.router.clone(),
        WorkerPoolConfig {
            workers,
            consume_timeout: Duration::from_millis(50),
            completion_attempts: 3,
        },
    )
}

// ============================================================================
// Routing Decision
// ============================================================================

#[tokio::test]
async fn test_default_processor_preferred() {
    let h = harness();
    let outcome = h.router.route(&job_of(1990)).await;

    assert_eq!(outcome, RouteOutcome::Completed(ProcessorKind::Default));
    assert_eq!(h.processor.calls_to(ProcessorKind::Default), 1);
    assert_eq!(h.processor.calls_to(ProcessorKind::Fallback), 0);
}

#[tokio::test]
async fn test_falls_back_when_default_fails() {
    let h = harness();
    h.processor.push(ProcessorKind::Default, Reply::Transient);

    let outcome = h.router.route(&job_of(1000)).await;
    assert_eq!(outcome, RouteOutcome::Completed(ProcessorKind::Fallback));
    assert_eq!(h.processor.calls_to(ProcessorKind::Default), 1);
    assert_eq!(h.processor.calls_to(ProcessorKind::Fallback), 1);
}

#[tokio::test]
async fn test_exhausted_when_both_fail() {
    let h = harness();
    h.processor.push(ProcessorKind::Default, Reply::Transient);
    h.processor.push(ProcessorKind::Fallback, Reply::Transient);

    assert_eq!(h.router.route(&job_of(1000)).await, RouteOutcome::Exhausted);
}

#[tokio::test]
async fn test_permanent_rejection_stops_routing() {
    let h = harness();
    h.processor.push(ProcessorKind::Default, Reply::Permanent(400));

    let outcome = h.router.route(&job_of(1000)).await;
    assert_eq!(
        outcome,
        RouteOutcome::Rejected {
            kind: ProcessorKind::Default,
            status: 400
        }
    );
    // No fallback attempt for an unprocessable payment.
    assert_eq!(h.processor.calls_to(ProcessorKind::Fallback), 0);
}

#[tokio::test]
async fn test_duplicate_ack_counts_as_success() {
    let h = harness();
    h.processor
        .push(ProcessorKind::Default, Reply::Ok(ProcessorAck::Duplicate));

    let outcome = h.router.route(&job_of(1000)).await;
    assert_eq!(outcome, RouteOutcome::Completed(ProcessorKind::Default));
    assert_eq!(
        h.router.breakers().for_kind(ProcessorKind::Default).state(),
        BreakerState::Closed
    );
}

#[tokio::test]
async fn test_breaker_opens_and_skips_default() {
    let h = harness();
    h.processor.push_n(ProcessorKind::Default, Reply::Transient, 3);

    // Three consecutive transient failures trip the default breaker.
    for _ in 0..3 {
        let outcome = h.router.route(&job_of(1000)).await;
        assert_eq!(outcome, RouteOutcome::Completed(ProcessorKind::Fallback));
    }
    assert_eq!(
        h.router.breakers().for_kind(ProcessorKind::Default).state(),
        BreakerState::Open
    );

    // The next payment goes straight to fallback without touching default.
    let before = h.processor.calls_to(ProcessorKind::Default);
    let outcome = h.router.route(&job_of(1000)).await;
    assert_eq!(outcome, RouteOutcome::Completed(ProcessorKind::Fallback));
    assert_eq!(h.processor.calls_to(ProcessorKind::Default), before);
}

#[tokio::test]
async fn test_cached_unhealthy_default_is_skipped() {
    let h = harness();
    let entry = ProcessorHealth {
        healthy: false,
        min_response_time_ms: 900,
        checked_at: Utc::now(),
    };
    h.store
        .put(ProcessorKind::Default, &entry, Duration::from_secs(30))
        .await
        .unwrap();

    let outcome = h.router.route(&job_of(1000)).await;
    assert_eq!(outcome, RouteOutcome::Completed(ProcessorKind::Fallback));
    assert_eq!(h.processor.calls_to(ProcessorKind::Default), 0);
}

#[tokio::test]
async fn test_absent_health_entry_assumed_healthy() {
    let h = harness();
    let outcome = h.router.route(&job_of(1000)).await;
    assert_eq!(outcome, RouteOutcome::Completed(ProcessorKind::Default));
}

// ============================================================================
// Worker Pool
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_completes_payment_end_to_end() {
    let h = harness();
    let payment = pay_common::Payment::accepted(Uuid::new_v4(), 1990, Utc::now());
    h.audit.record_accepted(&payment).await.unwrap();
    h.store.publish(&payment.job()).await.unwrap();

    let pool = pool_of(&h, 2);
    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.shutdown().await;

    let summary = h.store.summary(None, None).await.unwrap();
    assert_eq!(summary.default.total_requests, 1);
    assert_eq!(summary.default.total_amount_cents, 1990);
    assert_eq!(summary.fallback.total_requests, 0);
    assert_eq!(
        h.audit.status_of(payment.id),
        Some(PaymentStatus::Completed)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_requeues_when_processors_down() {
    let h = harness();
    h.processor.push_n(ProcessorKind::Default, Reply::Transient, 10);
    h.processor.push_n(ProcessorKind::Fallback, Reply::Transient, 10);

    let job = job_of(1000);
    h.store.publish(&job).await.unwrap();

    let pool = pool_of(&h, 1);
    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    pool.shutdown().await;

    // The job cycled through the queue instead of being dropped or failed:
    // shutdown drains an in-flight job back to the queue before the worker
    // exits.
    let summary = h.store.summary(None, None).await.unwrap();
    assert_eq!(summary.default.total_requests, 0);
    assert_eq!(summary.fallback.total_requests, 0);
    assert_eq!(h.store.depth().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_marks_rejected_payment_failed() {
    let h = harness();
    h.processor.push(ProcessorKind::Default, Reply::Permanent(400));

    let payment = pay_common::Payment::accepted(Uuid::new_v4(), 1000, Utc::now());
    h.audit.record_accepted(&payment).await.unwrap();
    h.store.publish(&payment.job()).await.unwrap();

    let pool = pool_of(&h, 1);
    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    pool.shutdown().await;

    assert_eq!(h.audit.status_of(payment.id), Some(PaymentStatus::Failed));
    assert_eq!(h.store.depth().await.unwrap(), 0);
    let summary = h.store.summary(None, None).await.unwrap();
    assert_eq!(summary.default.total_requests, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_delivery_increments_once() {
    let h = harness();
    let job = job_of(500);
    // The same job delivered twice, as after a requeue race.
    h.store.publish(&job).await.unwrap();
    h.store.publish(&job).await.unwrap();

    let pool = pool_of(&h, 2);
    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.shutdown().await;

    let summary = h.store.summary(None, None).await.unwrap();
    assert_eq!(summary.default.total_requests, 1);
    assert_eq!(summary.default.total_amount_cents, 500);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_requeue_preserves_requested_at_through_worker() {
    let h = harness();
    h.processor.push(ProcessorKind::Default, Reply::Transient);
    h.processor.push(ProcessorKind::Fallback, Reply::Transient);

    let job = job_of(750);
    h.store.publish(&job).await.unwrap();

    let pool = pool_of(&h, 1);
    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    pool.shutdown().await;

    // Second pass succeeded (script exhausted); the aggregate is indexed
    // under the original requested_at.
    let from = job.requested_at - chrono::Duration::milliseconds(1);
    let to = job.requested_at + chrono::Duration::milliseconds(1);
    let summary = h.store.summary(Some(from), Some(to)).await.unwrap();
    assert_eq!(summary.default.total_requests, 1);
    assert_eq!(summary.default.total_amount_cents, 750);
}

// ============================================================================
// Health Monitor
// ============================================================================

#[tokio::test]
async fn test_health_monitor_populates_cache() {
    let h = harness();
    let monitor = HealthMonitor::new(
        h.processor.clone(),
        Arc::new(h.store.clone()),
        HealthMonitorConfig {
            check_interval: Duration::from_millis(20),
            cache_ttl: Duration::from_secs(5),
        },
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = monitor.spawn(shutdown_rx);

    tokio::time::sleep(Duration::from_millis(40)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    let default_entry = h.store.get(ProcessorKind::Default).await.unwrap().unwrap();
    let fallback_entry = h.store.get(ProcessorKind::Fallback).await.unwrap().unwrap();
    assert!(default_entry.healthy);
    assert!(fallback_entry.healthy);
}

#[tokio::test]
async fn test_health_monitor_records_failing_processor() {
    let h = harness();
    h.processor.set_health_failing(ProcessorKind::Default);

    let monitor = HealthMonitor::new(
        h.processor.clone(),
        Arc::new(h.store.clone()),
        HealthMonitorConfig {
            check_interval: Duration::from_millis(20),
            cache_ttl: Duration::from_secs(5),
        },
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = monitor.spawn(shutdown_rx);

    tokio::time::sleep(Duration::from_millis(40)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    let default_entry = h.store.get(ProcessorKind::Default).await.unwrap().unwrap();
    let fallback_entry = h.store.get(ProcessorKind::Fallback).await.unwrap().unwrap();
    assert!(!default_entry.healthy);
    assert!(fallback_entry.healthy);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_drains_in_flight_job() {
    let h = harness();
    h.processor.push(
        ProcessorKind::Default,
        Reply::SlowOk(Duration::from_millis(100)),
    );

    let job = job_of(1200);
    h.store.publish(&job).await.unwrap();

    let pool = pool_of(&h, 1);
    pool.start().await.unwrap();
    // Let the worker pick the job up, then shut down mid-call.
    tokio::time::sleep(Duration::from_millis(30)).await;
    pool.shutdown().await;

    // The in-flight job was driven to completion before the worker exited.
    let summary = h.store.summary(None, None).await.unwrap();
    assert_eq!(summary.default.total_requests, 1);
    assert_eq!(summary.default.total_amount_cents, 1200);
    assert_eq!(h.store.depth().await.unwrap(), 0);
}
