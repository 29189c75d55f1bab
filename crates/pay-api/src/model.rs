//! Request and response DTOs for the gateway API.

use pay_common::{cents_to_amount, ProcessorTotals, SummaryTotals};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// Client-supplied idempotency key for the payment.
    pub correlation_id: Uuid,
    /// Positive amount with at most two fractional digits.
    pub amount: f64,
}

/// Fixed acknowledgement body; no client-visible identifier is returned.
#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentAcceptedResponse {
    pub message: String,
}

impl Default for PaymentAcceptedResponse {
    fn default() -> Self {
        Self {
            message: "payment accepted for processing".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default, IntoParams)]
pub struct SummaryQuery {
    /// Inclusive lower bound on `requested_at`, RFC 3339.
    pub from: Option<String>,
    /// Inclusive upper bound on `requested_at`, RFC 3339.
    pub to: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorSummaryResponse {
    pub total_requests: u64,
    pub total_amount: f64,
}

impl From<ProcessorTotals> for ProcessorSummaryResponse {
    fn from(totals: ProcessorTotals) -> Self {
        Self {
            total_requests: totals.total_requests,
            total_amount: cents_to_amount(totals.total_amount_cents),
        }
    }
}

/// Both processors always appear, zeros included.
#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentsSummaryResponse {
    pub default: ProcessorSummaryResponse,
    pub fallback: ProcessorSummaryResponse,
}

impl From<SummaryTotals> for PaymentsSummaryResponse {
    fn from(totals: SummaryTotals) -> Self {
        Self {
            default: totals.default.into(),
            fallback: totals.fallback.into(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BreakerStatesResponse {
    pub default: String,
    pub fallback: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// UP or DEGRADED.
    pub status: String,
    pub version: String,
    pub queue_depth: Option<u64>,
    pub workers: usize,
    pub breakers: BreakerStatesResponse,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProbeResponse {
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PurgeResponse {
    pub message: String,
}
