//! Worker pool consuming the job queue.
//!
//! Each worker is a long-lived task performing a blocking consume with a
//! finite timeout, so shutdown is deterministic: a worker holding a job
//! finishes routing it (to completion, requeue, or terminal failure) before
//! exiting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use pay_common::{PaymentJob, ProcessorKind};
use pay_store::{AuditStore, CompletionOutcome, JobConsumer, JobQueue, SummaryStore};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::routing::{PaymentRouter, RouteOutcome};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// How long a consume blocks before re-checking for shutdown.
    pub consume_timeout: Duration,
    /// Bounded retries for the atomic completion write.
    pub completion_attempts: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            consume_timeout: Duration::from_secs(10),
            completion_attempts: 3,
        }
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    summary: Arc<dyn SummaryStore>,
    audit: Arc<dyn AuditStore>,
    router: Arc<PaymentRouter>,
    config: WorkerPoolConfig,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
struct WorkerContext {
    queue: Arc<dyn JobQueue>,
    summary: Arc<dyn SummaryStore>,
    audit: Arc<dyn AuditStore>,
    router: Arc<PaymentRouter>,
    completion_attempts: u32,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        summary: Arc<dyn SummaryStore>,
        audit: Arc<dyn AuditStore>,
        router: Arc<PaymentRouter>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            summary,
            audit,
            router,
            config,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    /// Spawn the workers. Each gets its own queue consumer so blocking
    /// consumes never contend.
    pub async fn start(&self) -> pay_store::Result<()> {
        let context = WorkerContext {
            queue: self.queue.clone(),
            summary: self.summary.clone(),
            audit: self.audit.clone(),
            router: self.router.clone(),
            completion_attempts: self.config.completion_attempts,
        };

        for worker_id in 0..self.config.workers {
            let consumer = self.queue.consumer().await?;
            let shutdown_rx = self.shutdown_tx.subscribe();
            let context = context.clone();
            let consume_timeout = self.config.consume_timeout;

            let handle = tokio::spawn(async move {
                run_worker(worker_id, consumer, context, consume_timeout, shutdown_rx).await;
            });
            self.handles.lock().push(handle);
        }

        info!(workers = self.config.workers, "payment workers started");
        Ok(())
    }

    /// Signal shutdown and join every worker. In-flight jobs are drained to
    /// completion or requeue before the workers exit.
    pub async fn shutdown(&self) {
        info!("worker pool shutting down");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    mut consumer: Box<dyn JobConsumer>,
    context: WorkerContext,
    consume_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!(worker_id, "worker started");

    // The shutdown check sits between consumes rather than racing them: a
    // consume that has already popped a job must always be driven to
    // completion or requeue. Shutdown latency is bounded by the consume
    // timeout plus one job.
    loop {
        match shutdown_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        match consumer.consume(consume_timeout).await {
            Ok(Some(job)) => process_job(&context, job).await,
            Ok(None) => {}
            Err(e) => {
                error!(worker_id, error = %e, "queue consume failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    debug!(worker_id, "worker exited");
}

async fn process_job(context: &WorkerContext, job: PaymentJob) {
    if let Err(e) = context.audit.mark_processing(job.payment_id).await {
        warn!(payment_id = %job.payment_id, error = %e, "audit processing mark failed");
    }

    match context.router.route(&job).await {
        RouteOutcome::Completed(kind) => complete_job(context, &job, kind).await,
        RouteOutcome::Rejected { kind, status } => {
            warn!(
                payment_id = %job.payment_id,
                processor = %kind,
                status,
                "payment rejected, recording terminal failure"
            );
            if let Err(e) = context.audit.mark_failed(job.payment_id).await {
                warn!(payment_id = %job.payment_id, error = %e, "audit failure mark failed");
            }
        }
        RouteOutcome::Exhausted => {
            debug!(payment_id = %job.payment_id, "no processor available, requeueing");
            if let Err(e) = context.queue.requeue(&job).await {
                error!(
                    payment_id = %job.payment_id,
                    error = %e,
                    "requeue failed, recording terminal failure"
                );
                if let Err(e) = context.audit.mark_failed(job.payment_id).await {
                    warn!(payment_id = %job.payment_id, error = %e, "audit failure mark failed");
                }
            }
        }
    }
}

async fn complete_job(context: &WorkerContext, job: &PaymentJob, processor: ProcessorKind) {
    for attempt in 1..=context.completion_attempts {
        match context.summary.complete(job, processor).await {
            Ok(outcome) => {
                if outcome == CompletionOutcome::AlreadyCompleted {
                    debug!(
                        payment_id = %job.payment_id,
                        "completion already recorded, aggregates untouched"
                    );
                }
                if let Err(e) = context
                    .audit
                    .mark_completed(job.payment_id, processor, Utc::now())
                    .await
                {
                    warn!(payment_id = %job.payment_id, error = %e, "audit completion mark failed");
                }
                return;
            }
            Err(e) => {
                warn!(
                    payment_id = %job.payment_id,
                    attempt,
                    error = %e,
                    "completion write failed"
                );
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
        }
    }

    // The aggregate store is unreachable. Requeue rather than lose the
    // payment: the processor dedups the resubmission by correlation id and
    // the completion flag keeps the aggregates exactly-once.
    error!(
        payment_id = %job.payment_id,
        "completion retries exhausted, requeueing"
    );
    if let Err(e) = context.queue.requeue(job).await {
        error!(payment_id = %job.payment_id, error = %e, "requeue after failed completion also failed");
    }
}
