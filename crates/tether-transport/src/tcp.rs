//! Plain TCP transport

use crate::{BoxedStream, TransportAcceptor, TransportConnector, TransportError, TransportResult};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Passes accepted connections through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainAcceptor;

#[async_trait]
impl TransportAcceptor for PlainAcceptor {
    async fn accept_stream(&self, stream: TcpStream) -> TransportResult<BoxedStream> {
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn protocol(&self) -> &'static str {
        "tcp"
    }
}

/// Dials plain TCP connections
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, addr: &str) -> TransportResult<BoxedStream> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        debug!("Connected to {} over tcp", addr);
        Ok(Box::new(stream))
    }

    fn protocol(&self) -> &'static str {
        "tcp"
    }
}
