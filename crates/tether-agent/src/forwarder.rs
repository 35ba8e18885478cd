use thiserror::Error;
use tokio::net::TcpStream;

/// Errors that can occur while reaching the local target
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to target address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },
}

/// Dials the local service that public traffic is forwarded to
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    target_address: String,
}

impl TcpForwarder {
    pub fn new(target_address: impl Into<String>) -> Self {
        Self {
            target_address: target_address.into(),
        }
    }

    pub fn target_address(&self) -> &str {
        &self.target_address
    }

    /// Open a fresh connection to the target
    pub async fn connect(&self) -> Result<TcpStream, ForwarderError> {
        let stream = TcpStream::connect(&self.target_address)
            .await
            .map_err(|e| ForwarderError::ConnectionFailed {
                address: self.target_address.clone(),
                source: e,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Check that the target accepts connections
    pub async fn probe(&self) -> Result<(), ForwarderError> {
        let stream = self.connect().await?;
        drop(stream);
        tracing::debug!(target_address = %self.target_address, "Target is reachable");
        Ok(())
    }
}
