//! Infrastructure Layer
//!
//! Cross-cutting concerns: metrics, reconnect backoff and shutdown.

pub mod backoff;
pub mod metrics;
pub mod shutdown;

pub use backoff::{Backoff, BackoffConfig};
pub use metrics::{InFlightRequest, TunnelMetrics};
pub use shutdown::{shutdown_signal, DrainGuard, DrainTracker, ShutdownController};
