//! Background probe loop feeding the shared health cache.
//!
//! Wakes every `check_interval`, and for each processor first claims the
//! shared probe slot in the cache (so a fleet of replicas collectively stays
//! under the processors' one-probe-per-interval rate limit), then issues the
//! service-health call and writes the outcome with a TTL. A local governor
//! limiter backstops the shared claim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use pay_common::{ProcessorHealth, ProcessorKind};
use pay_store::HealthCache;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::processors::ProcessorApi;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Probe cadence per processor; also the shared claim window.
    pub check_interval: Duration,
    /// TTL of the written cache entry.
    pub cache_ttl: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(30),
        }
    }
}

struct ProbeLimiters {
    default: Option<DirectRateLimiter>,
    fallback: Option<DirectRateLimiter>,
}

impl ProbeLimiters {
    fn new(interval: Duration) -> Self {
        let make = || Quota::with_period(interval).map(RateLimiter::direct);
        Self {
            default: make(),
            fallback: make(),
        }
    }

    fn for_kind(&self, kind: ProcessorKind) -> Option<&DirectRateLimiter> {
        match kind {
            ProcessorKind::Default => self.default.as_ref(),
            ProcessorKind::Fallback => self.fallback.as_ref(),
        }
    }
}

pub struct HealthMonitor {
    processors: Arc<dyn ProcessorApi>,
    cache: Arc<dyn HealthCache>,
    config: HealthMonitorConfig,
    limiters: ProbeLimiters,
}

impl HealthMonitor {
    pub fn new(
        processors: Arc<dyn ProcessorApi>,
        cache: Arc<dyn HealthCache>,
        config: HealthMonitorConfig,
    ) -> Self {
        let limiters = ProbeLimiters::new(config.check_interval);
        Self {
            processors,
            cache,
            config,
            limiters,
        }
    }

    /// Run until the shutdown signal fires. The first tick is immediate so a
    /// fresh process populates the cache right away.
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.check_interval.as_secs(),
                "health monitor started"
            );
            let mut ticker = tokio::time::interval(self.config.check_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.check_all().await,
                    _ = shutdown_rx.recv() => {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn check_all(&self) {
        for kind in ProcessorKind::ALL {
            self.check_processor(kind).await;
        }
    }

    async fn check_processor(&self, kind: ProcessorKind) {
        if let Some(limiter) = self.limiters.for_kind(kind) {
            if limiter.check().is_err() {
                debug!(processor = %kind, "probe rate limited locally");
                return;
            }
        }

        match self.cache.claim_probe(kind, self.config.check_interval).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(processor = %kind, "probe claimed by another replica");
                return;
            }
            Err(e) => {
                warn!(processor = %kind, error = %e, "probe claim failed");
                return;
            }
        }

        let started = Instant::now();
        let (healthy, min_response_time_ms) = match self.processors.check_health(kind).await {
            Ok(health) => (!health.failing, health.min_response_time),
            Err(e) => {
                warn!(processor = %kind, error = %e, "health probe failed");
                (false, started.elapsed().as_millis() as u64)
            }
        };

        let entry = ProcessorHealth {
            healthy,
            min_response_time_ms,
            checked_at: Utc::now(),
        };
        if let Err(e) = self.cache.put(kind, &entry, self.config.cache_ttl).await {
            warn!(processor = %kind, error = %e, "failed to write health cache");
            return;
        }

        debug!(
            processor = %kind,
            healthy,
            min_response_time_ms,
            "health probe recorded"
        );
    }
}
