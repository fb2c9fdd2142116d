//! Application Layer
//!
//! Edge connection lifecycle, stream dispatch and the scaling supervisor.
//! Everything here talks to the outside world through the domain ports.

pub mod connection_handle;
pub mod connection_pool;
pub mod dispatcher;
pub mod http1;
pub mod relay;
pub mod supervisor;

pub use connection_handle::{
    Admission, AdmittedStream, Cancellation, ConnectionHandle, HandleSettings, HandleSnapshot,
};
pub use connection_pool::ConnectionPool;
pub use dispatcher::{StreamDispatcher, StreamError};
pub use supervisor::{ConnectionSupervisor, HandleEvent, SupervisorSettings};
