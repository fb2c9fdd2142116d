//! Origin Dialer Port
//!
//! Defines the interface for opening byte streams to local origin services.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Bidirectional byte stream to an origin.
pub trait OriginIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> OriginIo for T {}

/// Dialer for origin connections.
///
/// The dispatcher speaks HTTP/1.1 or raw bytes over whatever this returns.
#[async_trait]
pub trait OriginDialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Box<dyn OriginIo>, OriginError>;
}

/// Errors raised while talking to an origin.
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("failed to connect to origin {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to origin {0}")]
    ConnectTimeout(String),
    #[error("origin sent a malformed response: {0}")]
    MalformedResponse(String),
    #[error("origin i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_error_display() {
        let err = OriginError::Connect {
            addr: "127.0.0.1:1".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to origin 127.0.0.1:1: refused"
        );
        assert_eq!(
            OriginError::ConnectTimeout("10.0.0.1:80".to_string()).to_string(),
            "timed out connecting to origin 10.0.0.1:80"
        );
    }
}
