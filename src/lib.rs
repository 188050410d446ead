//! Berth - a dependency-aware multi-service orchestrator
//!
//! Berth reads a compose-style topology of services, volumes and secrets,
//! and brings the services up in dependency order:
//!
//! - Topology loading and validation (compose-compatible YAML)
//! - Deterministic startup and shutdown ordering with cycle detection
//! - Named volumes and external secrets with reference counting
//! - Health-gated lifecycle supervision with restart policies
//! - A narrow runtime adapter for whatever actually runs the services

pub mod compose;
pub mod error;
pub mod runtime;
pub mod settings;
pub mod storage;
pub mod supervisor;

pub use error::{BerthError, Result};
