//! Core library for API health monitoring
//!
//! This crate provides:
//! - Latency, error-rate, pattern and cross-environment analyzers
//! - The periodic analysis scheduler
//! - Alert generation, lifecycle and deduplicated notification
//! - Collaborator traits with an in-memory implementation
//! - Health checks and observability

pub mod alerting;
pub mod analyzer;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod store;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{SentinelMetrics, StructuredLogger};
