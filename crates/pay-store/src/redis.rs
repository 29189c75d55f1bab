//! Redis implementation of the queue, health cache, and summary store.
//!
//! Layout:
//! - `payments:queue`            list, LPUSH publish / BRPOP consume (FIFO)
//! - `accepted:{correlation}`    ingress dedup flag, SET NX, 24 h TTL
//! - `completed:{correlation}`   completion flag, written by the Lua script;
//!                               never expires (at most one aggregate
//!                               increment per correlation id, ever)
//! - `summary:{processor}`       hash {total_requests, total_amount_cents}
//! - `summary:index:{processor}` zset of payment_id:amount_cents scored by
//!                               requested_at epoch millis
//! - `health:{processor}`        hash {healthy, min_response_time_ms,
//!                               checked_at_ms}, 30 s TTL
//! - `health:probe:{processor}`  probe claim, SET NX PX

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pay_common::{PaymentJob, ProcessorHealth, ProcessorKind, ProcessorTotals, SummaryTotals};
use tracing::debug;
use uuid::Uuid;

use crate::traits::{
    CompletionOutcome, HealthCache, JobConsumer, JobQueue, PurgeStore, SummaryStore,
};
use crate::{Result, StoreError};

const QUEUE_KEY: &str = "payments:queue";
const ACCEPT_TTL_SECS: i64 = 86_400;

/// Sets the completion flag, bumps the aggregates, and indexes the payment by
/// `requested_at`, all in one server-side step. Returns 0 when the flag was
/// already set.
///
/// The flag carries no TTL: a recovered job republished long after the
/// original completion must still find it set.
///
/// KEYS: [completion flag, summary hash, summary index]
/// ARGV: [amount_cents, requested_at_millis, payment_id:amount_cents]
const COMPLETE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('SET', KEYS[1], '1')
redis.call('HINCRBY', KEYS[2], 'total_requests', 1)
redis.call('HINCRBY', KEYS[2], 'total_amount_cents', ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
return 1
"#;

fn summary_key(kind: ProcessorKind) -> String {
    format!("summary:{}", kind)
}

fn index_key(kind: ProcessorKind) -> String {
    format!("summary:index:{}", kind)
}

fn health_key(kind: ProcessorKind) -> String {
    format!("health:{}", kind)
}

fn probe_key(kind: ProcessorKind) -> String {
    format!("health:probe:{}", kind)
}

fn accepted_key(correlation_id: Uuid) -> String {
    format!("accepted:{}", correlation_id)
}

fn completed_key(correlation_id: Uuid) -> String {
    format!("completed:{}", correlation_id)
}

/// Shared Redis store. Cloneable; all clones share one multiplexed
/// connection for non-blocking commands. Blocking consumes go through
/// dedicated connections handed out by [`JobQueue::consumer`].
#[derive(Clone)]
pub struct RedisStore {
    client: ::redis::Client,
    conn: ConnectionManager,
    complete_script: Arc<Script>,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            complete_script: Arc::new(Script::new(COMPLETE_SCRIPT)),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn totals_for(&self, kind: ProcessorKind) -> Result<ProcessorTotals> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(summary_key(kind)).await?;

        let total_requests = fields
            .get("total_requests")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let total_amount_cents = fields
            .get("total_amount_cents")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(ProcessorTotals {
            total_requests,
            total_amount_cents,
        })
    }

    async fn windowed_totals_for(
        &self,
        kind: ProcessorKind,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ProcessorTotals> {
        let mut conn = self.conn.clone();
        let min = from
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_else(|| "-inf".to_string());
        let max = to
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_else(|| "+inf".to_string());

        let members: Vec<String> = conn.zrangebyscore(index_key(kind), min, max).await?;

        let mut totals = ProcessorTotals::default();
        for member in members {
            let (_, cents) = member
                .rsplit_once(':')
                .ok_or_else(|| StoreError::Malformed(format!("summary index entry {member}")))?;
            let cents: i64 = cents
                .parse()
                .map_err(|_| StoreError::Malformed(format!("summary index entry {member}")))?;
            totals.total_requests += 1;
            totals.total_amount_cents += cents;
        }
        Ok(totals)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        // KEYS is acceptable here: purge is a test-only operation.
        let keys: Vec<String> = conn.keys(pattern).await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisStore {
    async fn publish(&self, job: &PaymentJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(job)?;
        let _: () = conn.lpush(QUEUE_KEY, body).await?;
        Ok(())
    }

    async fn requeue(&self, job: &PaymentJob) -> Result<()> {
        // Tail of the FIFO is the publish side; a requeued job waits behind
        // everything already queued.
        self.publish(job).await
    }

    async fn depth(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(QUEUE_KEY).await?;
        Ok(len)
    }

    async fn consumer(&self) -> Result<Box<dyn JobConsumer>> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(Box::new(RedisJobConsumer { conn }))
    }
}

/// Consumer with its own connection so BRPOP never stalls the shared one.
pub struct RedisJobConsumer {
    conn: MultiplexedConnection,
}

#[async_trait]
impl JobConsumer for RedisJobConsumer {
    async fn consume(&mut self, timeout: Duration) -> Result<Option<PaymentJob>> {
        let popped: Option<(String, String)> = self
            .conn
            .brpop(QUEUE_KEY, timeout.as_secs_f64())
            .await?;

        match popped {
            Some((_, body)) => {
                let job: PaymentJob = serde_json::from_str(&body)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SummaryStore for RedisStore {
    async fn try_accept(&self, correlation_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let accepted: Option<String> = ::redis::cmd("SET")
            .arg(accepted_key(correlation_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ACCEPT_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(accepted.is_some())
    }

    async fn release_accept(&self, correlation_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(accepted_key(correlation_id)).await?;
        Ok(())
    }

    async fn complete(
        &self,
        job: &PaymentJob,
        processor: ProcessorKind,
    ) -> Result<CompletionOutcome> {
        let mut conn = self.conn.clone();
        let member = format!("{}:{}", job.payment_id, job.amount_cents);

        let applied: i64 = self
            .complete_script
            .key(completed_key(job.correlation_id))
            .key(summary_key(processor))
            .key(index_key(processor))
            .arg(job.amount_cents)
            .arg(job.requested_at.timestamp_millis())
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        if applied == 1 {
            Ok(CompletionOutcome::Recorded)
        } else {
            debug!(
                correlation_id = %job.correlation_id,
                "completion flag already set, skipping aggregate update"
            );
            Ok(CompletionOutcome::AlreadyCompleted)
        }
    }

    async fn summary(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<SummaryTotals> {
        if from.is_none() && to.is_none() {
            return Ok(SummaryTotals {
                default: self.totals_for(ProcessorKind::Default).await?,
                fallback: self.totals_for(ProcessorKind::Fallback).await?,
            });
        }

        Ok(SummaryTotals {
            default: self
                .windowed_totals_for(ProcessorKind::Default, from, to)
                .await?,
            fallback: self
                .windowed_totals_for(ProcessorKind::Fallback, from, to)
                .await?,
        })
    }
}

#[async_trait]
impl HealthCache for RedisStore {
    async fn get(&self, kind: ProcessorKind) -> Result<Option<ProcessorHealth>> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(health_key(kind)).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        let healthy = fields.get("healthy").map(|v| v == "1").unwrap_or(false);
        let min_response_time_ms = fields
            .get("min_response_time_ms")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let checked_at = fields
            .get("checked_at_ms")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Ok(Some(ProcessorHealth {
            healthy,
            min_response_time_ms,
            checked_at,
        }))
    }

    async fn put(
        &self,
        kind: ProcessorKind,
        health: &ProcessorHealth,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = health_key(kind);
        let _: () = ::redis::pipe()
            .atomic()
            .hset_multiple(
                &key,
                &[
                    ("healthy", if health.healthy { "1" } else { "0" }.to_string()),
                    (
                        "min_response_time_ms",
                        health.min_response_time_ms.to_string(),
                    ),
                    (
                        "checked_at_ms",
                        health.checked_at.timestamp_millis().to_string(),
                    ),
                ],
            )
            .ignore()
            .expire(&key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_probe(&self, kind: ProcessorKind, window: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = ::redis::cmd("SET")
            .arg(probe_key(kind))
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(window.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(claimed.is_some())
    }
}

#[async_trait]
impl PurgeStore for RedisStore {
    async fn purge(&self) -> Result<()> {
        let mut conn = self.conn.clone();

        let mut fixed: Vec<String> = vec![QUEUE_KEY.to_string()];
        for kind in ProcessorKind::ALL {
            fixed.push(summary_key(kind));
            fixed.push(index_key(kind));
            fixed.push(health_key(kind));
            fixed.push(probe_key(kind));
        }
        let _: () = conn.del(fixed).await?;

        self.delete_matching("accepted:*").await?;
        self.delete_matching("completed:*").await?;
        Ok(())
    }
}
