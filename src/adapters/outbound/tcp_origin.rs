//! TCP Origin Dialer
//!
//! Implements `OriginDialer` with plain tokio TCP connects.

use crate::domain::ports::{OriginDialer, OriginError, OriginIo};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

pub struct TcpOriginDialer {
    connect_timeout: Duration,
}

impl TcpOriginDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl OriginDialer for TcpOriginDialer {
    async fn dial(&self, addr: &str) -> Result<Box<dyn OriginIo>, OriginError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| OriginError::ConnectTimeout(addr.to_string()))?
            .map_err(|source| OriginError::Connect {
                addr: addr.to_string(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        Ok(Box::new(stream))
    }
}
