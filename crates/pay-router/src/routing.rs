//! The routing decision: which processor gets a payment, if any.
//!
//! Default is attempted first, fallback second. A processor is eligible when
//! its breaker is not open and the cached health entry, if present, reports
//! healthy. An absent or unreadable health entry is treated as healthy; the
//! breaker remains the final filter when the cache degrades.

use std::sync::Arc;

use pay_common::{PaymentJob, ProcessorKind};
use pay_store::HealthCache;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerState, ProcessorBreakers};
use crate::processors::{ProcessorAck, ProcessorApi, ProcessorError};

/// Result of one routing pass over both processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A processor accepted the payment.
    Completed(ProcessorKind),
    /// A processor decisively rejected the payment; it must not be retried.
    Rejected { kind: ProcessorKind, status: u16 },
    /// No processor was available; the job goes back on the queue.
    Exhausted,
}

pub struct PaymentRouter {
    processors: Arc<dyn ProcessorApi>,
    breakers: ProcessorBreakers,
    health: Arc<dyn HealthCache>,
}

impl PaymentRouter {
    pub fn new(processors: Arc<dyn ProcessorApi>, health: Arc<dyn HealthCache>) -> Self {
        Self {
            processors,
            breakers: ProcessorBreakers::new(),
            health,
        }
    }

    /// Try the default processor, then the fallback.
    pub async fn route(&self, job: &PaymentJob) -> RouteOutcome {
        for kind in ProcessorKind::ALL {
            if !self.eligible(kind).await {
                debug!(
                    payment_id = %job.payment_id,
                    processor = %kind,
                    "processor skipped"
                );
                continue;
            }

            let breaker = self.breakers.for_kind(kind);
            let generation = match breaker.acquire() {
                Ok(generation) => generation,
                Err(e) => {
                    debug!(processor = %kind, reason = %e, "breaker refused dispatch");
                    continue;
                }
            };

            match self.processors.submit_payment(kind, job).await {
                Ok(ack) => {
                    breaker.record(generation, true);
                    if ack == ProcessorAck::Duplicate {
                        info!(
                            payment_id = %job.payment_id,
                            processor = %kind,
                            "processor already held this correlation id"
                        );
                    }
                    return RouteOutcome::Completed(kind);
                }
                Err(ProcessorError::Permanent { status, .. }) => {
                    // A decisive 4xx means the processor is alive; the
                    // payment itself is unprocessable.
                    breaker.record(generation, true);
                    return RouteOutcome::Rejected { kind, status };
                }
                Err(err @ ProcessorError::Transient { .. }) => {
                    breaker.record(generation, false);
                    warn!(
                        payment_id = %job.payment_id,
                        processor = %kind,
                        error = %err,
                        "processor attempt failed"
                    );
                }
            }
        }

        RouteOutcome::Exhausted
    }

    async fn eligible(&self, kind: ProcessorKind) -> bool {
        if self.breakers.for_kind(kind).state() == BreakerState::Open {
            return false;
        }

        match self.health.get(kind).await {
            Ok(Some(entry)) => entry.healthy,
            Ok(None) => true,
            Err(e) => {
                warn!(processor = %kind, error = %e, "health cache unreadable, assuming healthy");
                true
            }
        }
    }

    pub fn breakers(&self) -> &ProcessorBreakers {
        &self.breakers
    }

    pub fn reset_breakers(&self) {
        self.breakers.reset_all();
    }
}
