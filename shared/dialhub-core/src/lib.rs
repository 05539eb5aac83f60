//! Dialhub Core - Shared domain types and service infrastructure
//!
//! This crate provides:
//! - The call-center domain model (campaigns, leads, calls, call events)
//! - Standard service trait all Dialhub services implement
//! - Error handling utilities
//! - Configuration management

pub mod config;
pub mod domain;
pub mod error;
pub mod service;

pub use config::ServiceConfig;
pub use domain::*;
pub use error::{CoreError, Result};
pub use service::{DependencyStatus, DialhubService, HealthStatus, MicroserviceRuntime, ReadinessStatus};
