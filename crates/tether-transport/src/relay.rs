//! Relay engine: splices a per-request endpoint onto a session connection
//!
//! The session connection is long-lived and carries framed control messages
//! before and after each relay, so the engine borrows its halves instead of
//! taking ownership and never closes them. The endpoint is owned and is shut
//! down when the relay ends.

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Per-direction copy buffer
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// The first terminal event observed by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The endpoint reached end-of-stream
    EndpointClosed,
    /// Reading from or writing to the endpoint failed
    EndpointError,
    /// The session connection reached end-of-stream
    SessionClosed,
    /// Reading from or writing to the session connection failed
    SessionError,
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayEnd::EndpointClosed => "endpoint closed",
            RelayEnd::EndpointError => "endpoint error",
            RelayEnd::SessionClosed => "session closed",
            RelayEnd::SessionError => "session error",
        };
        f.write_str(s)
    }
}

/// Result of one relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub endpoint_to_session: u64,
    pub session_to_endpoint: u64,
    pub ended_by: RelayEnd,
}

impl RelayOutcome {
    /// Whether the session connection is unusable after this relay
    pub fn session_failed(&self) -> bool {
        matches!(
            self.ended_by,
            RelayEnd::SessionClosed | RelayEnd::SessionError
        )
    }
}

enum PumpEnd {
    SourceClosed,
    SourceError(io::Error),
    SinkError(io::Error),
}

/// Copy `reader` into `writer` until one of them fails or `reader` hits EOF.
///
/// Every read is forwarded and flushed as-is.
async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> PumpEnd
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return PumpEnd::SourceClosed,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return PumpEnd::SourceError(e),
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            return PumpEnd::SinkError(e);
        }
        if let Err(e) = writer.flush().await {
            return PumpEnd::SinkError(e);
        }
        *copied += n as u64;
    }
}

/// Relay bytes between `endpoint` and the session halves in both directions.
///
/// Ends at the first terminal event in either direction; the other direction
/// is cancelled. The endpoint is shut down before returning.
pub async fn relay<E, R, W>(
    endpoint: E,
    session_reader: &mut R,
    session_writer: &mut W,
) -> RelayOutcome
where
    E: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let (mut endpoint_reader, mut endpoint_writer) = tokio::io::split(endpoint);
    let mut endpoint_to_session = 0u64;
    let mut session_to_endpoint = 0u64;

    let ended_by = tokio::select! {
        end = pump(&mut endpoint_reader, session_writer, &mut endpoint_to_session) => match end {
            PumpEnd::SourceClosed => RelayEnd::EndpointClosed,
            PumpEnd::SourceError(e) => {
                debug!("Endpoint read failed: {}", e);
                RelayEnd::EndpointError
            }
            PumpEnd::SinkError(e) => {
                debug!("Session write failed: {}", e);
                RelayEnd::SessionError
            }
        },
        end = pump(session_reader, &mut endpoint_writer, &mut session_to_endpoint) => match end {
            PumpEnd::SourceClosed => RelayEnd::SessionClosed,
            PumpEnd::SourceError(e) => {
                debug!("Session read failed: {}", e);
                RelayEnd::SessionError
            }
            PumpEnd::SinkError(e) => {
                debug!("Endpoint write failed: {}", e);
                RelayEnd::EndpointError
            }
        },
    };

    let mut endpoint = endpoint_reader.unsplit(endpoint_writer);
    let _ = endpoint.shutdown().await;

    debug!(
        endpoint_to_session,
        session_to_endpoint,
        ended_by = %ended_by,
        "Relay finished"
    );

    RelayOutcome {
        endpoint_to_session,
        session_to_endpoint,
        ended_by,
    }
}
