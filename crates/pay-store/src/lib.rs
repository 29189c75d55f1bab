//! Storage adapters for the payment gateway
//!
//! This crate provides:
//! - Trait seams for the job queue, health cache, and summary/aggregate store
//! - RedisStore: the production implementation (queue, health, aggregates)
//! - AuditStore: relational payment audit trail for crash recovery
//! - In-memory implementations of every seam for tests

pub mod audit;
pub mod error;
pub mod memory;
pub mod redis;
pub mod traits;

pub use crate::audit::{AuditStore, MemoryAuditStore, PgAuditStore};
pub use crate::error::StoreError;
pub use crate::memory::MemoryStore;
pub use crate::redis::RedisStore;
pub use crate::traits::{
    CompletionOutcome, HealthCache, JobConsumer, JobQueue, PurgeStore, SummaryStore,
};

pub type Result<T> = std::result::Result<T, StoreError>;
