//! Domain Layer
//!
//! Tunnel entities, value objects, ports to the outside world and pure
//! policy services. Nothing here touches sockets.

pub mod entities;
pub mod ports;
pub mod services;
pub mod value_objects;
