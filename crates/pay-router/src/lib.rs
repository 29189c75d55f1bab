//! Payment routing engine
//!
//! This crate provides the asynchronous core of the gateway:
//! - CircuitBreaker: per-processor state machine gating outbound calls
//! - ProcessorClient: HTTP client for the external payment processors
//! - PaymentRouter: routing decision combining breakers and cached health
//! - WorkerPool: long-lived workers consuming the job queue
//! - HealthMonitor: background probe loop feeding the shared health cache

pub mod breaker;
pub mod health_monitor;
pub mod processors;
pub mod routing;
pub mod worker;

pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker, Counts, ProcessorBreakers};
pub use health_monitor::{HealthMonitor, HealthMonitorConfig};
pub use processors::{
    ProcessorAck, ProcessorApi, ProcessorClient, ProcessorClientConfig, ProcessorError,
    ServiceHealth,
};
pub use routing::{PaymentRouter, RouteOutcome};
pub use worker::{WorkerPool, WorkerPoolConfig};
