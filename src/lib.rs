//! edge-tunnel Library
//!
//! Origin-side tunnel agent: keeps an elastic pool of multiplexed edge
//! connections and proxies the streams they carry to local origins.
//! Exposed as a library for the binary and the integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{ConnectionPool, ConnectionSupervisor, StreamDispatcher, SupervisorSettings};
pub use config::{load_config, Config};
pub use domain::entities::{HandleState, StreamKind, StreamReport};
pub use domain::ports::{EdgeConnection, EdgeConnector, OriginDialer, OriginResolver};
pub use domain::services::{Autoscaler, ScalingPolicy};
pub use domain::value_objects::ConnIndex;
pub use infrastructure::{ShutdownController, TunnelMetrics};
