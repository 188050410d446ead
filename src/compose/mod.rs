//! Topology model and dependency resolution
//!
//! This module reads compose-style documents, validates them into a
//! [`Topology`] and computes startup and shutdown orders.

pub mod config;
pub mod parser;
pub mod resolver;
pub mod topology;

pub use config::{ComposeConfig, ServiceConfig};
pub use parser::ComposeParser;
pub use resolver::{order, reverse_order, DependencyGraph};
pub use topology::{
    Mount, PortMapping, Protocol, Provenance, RestartPolicy, SecretSource, Service, ServiceId,
    Topology,
};
