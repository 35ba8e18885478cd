//! Transport layer for tether connections
//!
//! Every connection in the system (agent control connections, public client
//! connections, agent-to-target connections) is an ordered byte stream. This
//! crate hides whether that stream is plain TCP or TLS behind a boxed
//! [`TransportStream`], and provides the relay engine that splices two
//! streams together.
//!
//! ```text
//! ┌────────────────────┐   accept_stream()   ┌──────────────────────┐
//! │ TcpListener (relay)│ ──────────────────▶ │ TransportAcceptor    │
//! └────────────────────┘                     │  - PlainAcceptor     │
//!                                            │  - TlsServerAcceptor │
//!                                            └──────────────────────┘
//! ┌────────────────────┐     connect()       ┌──────────────────────┐
//! │ Agent              │ ──────────────────▶ │ TransportConnector   │
//! └────────────────────┘                     │  - TcpConnector      │
//!                                            │  - TlsConnector      │
//!                                            └──────────────────────┘
//! ```

pub mod relay;
pub mod tcp;
pub mod tls;

pub use relay::{relay, RelayEnd, RelayOutcome, RELAY_BUFFER_SIZE};
pub use tcp::{PlainAcceptor, TcpConnector};
pub use tls::{ServerVerification, TlsConnector, TlsServerAcceptor};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A reliable, ordered byte stream
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased stream handed to the control layer
pub type BoxedStream = Box<dyn TransportStream>;

/// Upgrades an accepted TCP connection into a transport stream
#[async_trait]
pub trait TransportAcceptor: Send + Sync {
    async fn accept_stream(&self, stream: TcpStream) -> TransportResult<BoxedStream>;

    /// Short protocol name for logs
    fn protocol(&self) -> &'static str;
}

/// Opens an outbound transport stream
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> TransportResult<BoxedStream>;

    /// Short protocol name for logs
    fn protocol(&self) -> &'static str;
}
