//! Origin Resolver Port
//!
//! Defines the interface for mapping a stream's target descriptor to the
//! local service that should receive it.

use crate::domain::entities::OriginTarget;

/// A connectable origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginEndpoint {
    /// HTTP/1.1 service reachable over TCP (also used for WebSocket upgrades)
    Http { addr: String },
    /// Raw TCP service
    Tcp { addr: String },
    /// Answer every request with a fixed status without dialing anything
    Status(u16),
}

impl std::fmt::Display for OriginEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { addr } => write!(f, "http://{}", addr),
            Self::Tcp { addr } => write!(f, "tcp://{}", addr),
            Self::Status(code) => write!(f, "http_status:{}", code),
        }
    }
}

/// Resolver from target descriptor to origin endpoint.
///
/// This is an outbound port. Implementations may use static ingress rules,
/// a remotely managed configuration, or anything else.
pub trait OriginResolver: Send + Sync {
    /// Resolve the origin for a target.
    fn resolve(&self, target: &OriginTarget) -> Result<OriginEndpoint, ResolveError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no origin matches hostname {0:?}")]
    NoMatchingOrigin(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(
            OriginEndpoint::Tcp {
                addr: "db:5432".to_string()
            }
            .to_string(),
            "tcp://db:5432"
        );
        assert_eq!(OriginEndpoint::Status(503).to_string(), "http_status:503");
    }

    #[test]
    fn test_resolve_error_display() {
        let err = ResolveError::NoMatchingOrigin("app.example.com".to_string());
        assert_eq!(err.to_string(), "no origin matches hostname \"app.example.com\"");
    }
}
