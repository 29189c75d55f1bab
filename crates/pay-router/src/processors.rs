//! HTTP client for the external payment processors.
//!
//! Sends payment submissions and service-health probes, and classifies every
//! outcome into transient (retryable via requeue), permanent (terminal), or
//! duplicate (the processor already holds this correlation id).

use std::time::Duration;

use async_trait::async_trait;
use pay_common::{cents_to_amount, format_rfc3339_millis, PaymentJob, ProcessorKind};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The exact acknowledgement body a processor returns on success.
const SUCCESS_MESSAGE: &str = "payment processed successfully";

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("transient failure from {kind} processor: {reason}")]
    Transient { kind: ProcessorKind, reason: String },

    #[error("{kind} processor rejected the payment with status {status}")]
    Permanent { kind: ProcessorKind, status: u16 },
}

/// How a processor accepted a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorAck {
    Processed,
    /// The processor reported this correlation id as already accepted. The
    /// payment is done as far as this processor is concerned.
    Duplicate,
}

/// Response of `GET /payments/service-health`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub failing: bool,
    pub min_response_time: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessorPaymentRequest {
    correlation_id: Uuid,
    amount: f64,
    requested_at: String,
}

#[derive(Debug, Deserialize)]
struct ProcessorPaymentResponse {
    message: String,
}

/// Seam between the routing engine and the outside world; tests drive the
/// router through scripted implementations of this trait.
#[async_trait]
pub trait ProcessorApi: Send + Sync {
    async fn submit_payment(
        &self,
        kind: ProcessorKind,
        job: &PaymentJob,
    ) -> Result<ProcessorAck, ProcessorError>;

    async fn check_health(&self, kind: ProcessorKind) -> Result<ServiceHealth, ProcessorError>;
}

#[derive(Debug, Clone)]
pub struct ProcessorClientConfig {
    pub default_url: String,
    pub fallback_url: String,
    /// Connect timeout for all calls.
    pub connect_timeout: Duration,
    /// Per-call deadline for payment submissions. There is no in-call retry;
    /// retry happens by requeueing.
    pub request_timeout: Duration,
    /// Deadline for service-health probes.
    pub health_timeout: Duration,
}

impl Default for ProcessorClientConfig {
    fn default() -> Self {
        Self {
            default_url: "http://payment-processor-default:8080".to_string(),
            fallback_url: "http://payment-processor-fallback:8080".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(3),
        }
    }
}

pub struct ProcessorClient {
    config: ProcessorClientConfig,
    client: reqwest::Client,
}

impl ProcessorClient {
    pub fn new(config: ProcessorClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn base_url(&self, kind: ProcessorKind) -> &str {
        match kind {
            ProcessorKind::Default => &self.config.default_url,
            ProcessorKind::Fallback => &self.config.fallback_url,
        }
    }

    fn transient(kind: ProcessorKind, reason: impl Into<String>) -> ProcessorError {
        ProcessorError::Transient {
            kind,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ProcessorApi for ProcessorClient {
    async fn submit_payment(
        &self,
        kind: ProcessorKind,
        job: &PaymentJob,
    ) -> Result<ProcessorAck, ProcessorError> {
        let body = ProcessorPaymentRequest {
            correlation_id: job.correlation_id,
            amount: cents_to_amount(job.amount_cents),
            requested_at: format_rfc3339_millis(&job.requested_at),
        };

        let url = format!("{}/payments", self.base_url(kind));
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transient(kind, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let ack: ProcessorPaymentResponse = response
                .json()
                .await
                .map_err(|e| Self::transient(kind, format!("invalid response body: {e}")))?;
            if ack.message == SUCCESS_MESSAGE {
                return Ok(ProcessorAck::Processed);
            }
            return Err(Self::transient(
                kind,
                format!("unexpected response message: {}", ack.message),
            ));
        }

        match status {
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Ok(ProcessorAck::Duplicate),
            s if s.is_client_error() => Err(ProcessorError::Permanent {
                kind,
                status: s.as_u16(),
            }),
            s => Err(Self::transient(kind, format!("status {s}"))),
        }
    }

    async fn check_health(&self, kind: ProcessorKind) -> Result<ServiceHealth, ProcessorError> {
        let url = format!("{}/payments/service-health", self.base_url(kind));
        let response = self
            .client
            .get(&url)
            .timeout(self.config.health_timeout)
            .send()
            .await
            .map_err(|e| Self::transient(kind, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::transient(kind, format!("health status {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| Self::transient(kind, format!("invalid health body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    #[test]
    fn test_payment_request_wire_shape() {
        let requested_at = Utc.with_ymd_and_hms(2025, 7, 10, 12, 34, 56).unwrap()
            + chrono::Duration::milliseconds(7);
        let body = ProcessorPaymentRequest {
            correlation_id: Uuid::nil(),
            amount: cents_to_amount(1990),
            requested_at: format_rfc3339_millis(&requested_at),
        };

        let json: serde_json::Value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json["correlationId"],
            "00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(json["amount"], 19.9);
        assert_eq!(json["requestedAt"], "2025-07-10T12:34:56.007Z");
    }

    #[test]
    fn test_service_health_wire_shape() {
        let health: ServiceHealth =
            serde_json::from_str(r#"{"failing": false, "minResponseTime": 42}"#).unwrap();
        assert!(!health.failing);
        assert_eq!(health.min_response_time, 42);
    }
}
