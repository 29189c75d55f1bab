use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

// ============================================================================
// Processor Identity
// ============================================================================

/// The two external payment processors a payment can be routed to.
///
/// `Default` is the cheaper processor and is always tried first; `Fallback`
/// is costlier and only used when the default is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    Default,
    Fallback,
}

impl ProcessorKind {
    pub const ALL: [ProcessorKind; 2] = [ProcessorKind::Default, ProcessorKind::Fallback];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorKind::Default => "default",
            ProcessorKind::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payment Domain Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

/// A payment as recorded in the audit store.
///
/// Status advances Pending -> Processing -> (Completed | Failed) and never
/// moves backwards. `processor` and `processed_at` are set only on Completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub amount_cents: i64,
    pub status: PaymentStatus,
    pub processor: Option<ProcessorKind>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// A freshly accepted payment, stamped with the ingress timestamp.
    pub fn accepted(correlation_id: Uuid, amount_cents: i64, requested_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            amount_cents,
            status: PaymentStatus::Pending,
            processor: None,
            requested_at,
            processed_at: None,
        }
    }

    pub fn job(&self) -> PaymentJob {
        PaymentJob {
            payment_id: self.id,
            correlation_id: self.correlation_id,
            amount_cents: self.amount_cents,
            requested_at: self.requested_at,
        }
    }
}

/// The unit of work carried on the job queue.
///
/// `requested_at` is the original ingress timestamp and is carried verbatim
/// through any number of requeues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentJob {
    pub payment_id: Uuid,
    pub correlation_id: Uuid,
    pub amount_cents: i64,
    pub requested_at: DateTime<Utc>,
}

// ============================================================================
// Aggregation Types
// ============================================================================

/// Running tally for one processor. Amounts are held in integer cents; the
/// HTTP layer converts to two-decimal currency units at the edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorTotals {
    pub total_requests: u64,
    pub total_amount_cents: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryTotals {
    pub default: ProcessorTotals,
    pub fallback: ProcessorTotals,
}

impl SummaryTotals {
    pub fn for_kind(&self, kind: ProcessorKind) -> &ProcessorTotals {
        match kind {
            ProcessorKind::Default => &self.default,
            ProcessorKind::Fallback => &self.fallback,
        }
    }

    pub fn for_kind_mut(&mut self, kind: ProcessorKind) -> &mut ProcessorTotals {
        match kind {
            ProcessorKind::Default => &mut self.default,
            ProcessorKind::Fallback => &mut self.fallback,
        }
    }
}

// ============================================================================
// Health Types
// ============================================================================

/// Last observed availability of a processor, as written by the health
/// monitor. An absent cache entry means "unknown"; readers assume healthy and
/// let the circuit breaker filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorHealth {
    pub healthy: bool,
    pub min_response_time_ms: u64,
    pub checked_at: DateTime<Utc>,
}

// ============================================================================
// Amount and Timestamp Helpers
// ============================================================================

/// Parse a currency amount into integer cents.
///
/// Accepts positive values with at most two fractional digits; anything else
/// (zero, negative, sub-cent precision, non-finite) is rejected.
pub fn amount_to_cents(amount: f64) -> Option<i64> {
    if !amount.is_finite() || amount <= 0.0 {
        return None;
    }
    let scaled = amount * 100.0;
    let cents = scaled.round();
    if (scaled - cents).abs() > 1e-6 {
        return None;
    }
    if cents > i64::MAX as f64 {
        return None;
    }
    Some(cents as i64)
}

/// Render integer cents as a currency amount with two-decimal precision.
pub fn cents_to_amount(cents: i64) -> f64 {
    (cents as f64) / 100.0
}

/// RFC 3339 with millisecond precision and a literal `Z`, the format the
/// external processors require for `requestedAt`.
pub fn format_rfc3339_millis(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_amount_to_cents_accepts_two_decimals() {
        assert_eq!(amount_to_cents(19.90), Some(1990));
        assert_eq!(amount_to_cents(0.01), Some(1));
        assert_eq!(amount_to_cents(100.0), Some(10000));
    }

    #[test]
    fn test_amount_to_cents_rejects_invalid() {
        assert_eq!(amount_to_cents(0.0), None);
        assert_eq!(amount_to_cents(-5.0), None);
        assert_eq!(amount_to_cents(1.001), None);
        assert_eq!(amount_to_cents(f64::NAN), None);
        assert_eq!(amount_to_cents(f64::INFINITY), None);
    }

    #[test]
    fn test_timestamp_format_millis_z() {
        let ts = Utc.with_ymd_and_hms(2025, 7, 10, 12, 34, 56).unwrap()
            + chrono::Duration::milliseconds(789);
        assert_eq!(format_rfc3339_millis(&ts), "2025-07-10T12:34:56.789Z");
    }

    #[test]
    fn test_job_round_trips_through_json() {
        let payment = Payment::accepted(Uuid::new_v4(), 1990, Utc::now());
        let job = payment.job();
        let bytes = serde_json::to_string(&job).unwrap();
        let back: PaymentJob = serde_json::from_str(&bytes).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.requested_at, payment.requested_at);
    }

    #[test]
    fn test_processor_kind_wire_names() {
        assert_eq!(serde_json::to_string(&ProcessorKind::Default).unwrap(), "\"default\"");
        assert_eq!(serde_json::to_string(&ProcessorKind::Fallback).unwrap(), "\"fallback\"");
    }
}
