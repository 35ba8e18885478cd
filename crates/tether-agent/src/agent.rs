//! Agent side of the control connection
//!
//! The agent holds a single connection to the relay. It waits for
//! `Incoming`, dials the target, acknowledges with `Ok` and then relays raw
//! bytes on that same connection until the target side finishes.

use crate::forwarder::TcpForwarder;
use std::fmt;
use tether_proto::{CodecError, Message, MessageCodec, MessageType};
use tether_transport::{relay, BoxedStream, TransportConnector, TransportError};
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Control connection error: {0}")]
    Codec(#[from] CodecError),

    #[error("Relay rejected the registration")]
    Rejected,

    #[error("Unexpected {0} during handshake")]
    UnexpectedMessage(MessageType),

    #[error("Connection to relay lost")]
    ConnectionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    AwaitingControl,
    Relaying,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::AwaitingControl => f.write_str("awaiting-control"),
            AgentState::Relaying => f.write_str("relaying"),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay control address (host:port)
    pub relay_addr: String,
    /// TLS server name expected on the relay certificate
    pub server_name: String,
    /// Local service public traffic is forwarded to (host:port)
    pub target_address: String,
    pub codec: MessageCodec,
}

impl AgentConfig {
    pub fn new(relay_addr: impl Into<String>, target_address: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            server_name: "localhost".to_string(),
            target_address: target_address.into(),
            codec: MessageCodec::default(),
        }
    }
}

/// A registered agent with its control connection
pub struct Agent {
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
    codec: MessageCodec,
    forwarder: TcpForwarder,
    public_addr: String,
    state: AgentState,
}

impl Agent {
    /// Connect to the relay and register.
    ///
    /// Returns once the relay has answered `Connect` with the public address.
    pub async fn connect(
        config: AgentConfig,
        connector: &dyn TransportConnector,
    ) -> Result<Self, AgentError> {
        info!(
            "Connecting to relay at {} ({})",
            config.relay_addr,
            connector.protocol()
        );
        let stream = connector.connect(&config.relay_addr).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let codec = config.codec;

        codec.write_message(&mut writer, &Message::connect()).await?;
        let reply = match codec.read_message(&mut reader).await {
            Ok(reply) => reply,
            Err(e) if e.is_clean_close() => return Err(AgentError::ConnectionLost),
            Err(e) => return Err(e.into()),
        };

        let public_addr = match reply.kind {
            MessageType::Ok => String::from_utf8_lossy(&reply.payload).into_owned(),
            MessageType::Error => return Err(AgentError::Rejected),
            other => return Err(AgentError::UnexpectedMessage(other)),
        };

        info!(
            public_addr = %public_addr,
            target_address = %config.target_address,
            "Registered with relay"
        );

        Ok(Self {
            reader,
            writer,
            codec,
            forwarder: TcpForwarder::new(config.target_address),
            public_addr,
            state: AgentState::AwaitingControl,
        })
    }

    /// Address external clients connect to
    pub fn public_addr(&self) -> &str {
        &self.public_addr
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Serve relay requests until the control connection ends.
    ///
    /// Only returns with an error: [`AgentError::ConnectionLost`] when the
    /// relay closes the connection.
    pub async fn run(mut self) -> Result<(), AgentError> {
        loop {
            let msg = match self.codec.read_message(&mut self.reader).await {
                Ok(msg) => msg,
                Err(e) if e.is_recoverable() => {
                    warn!("Ignoring message from relay: {}", e);
                    continue;
                }
                Err(e) if e.is_clean_close() => return Err(AgentError::ConnectionLost),
                Err(e) => return Err(e.into()),
            };

            match msg.kind {
                MessageType::Incoming => self.serve_incoming(msg).await?,
                MessageType::Error => warn!("Relay rejected the last message"),
                MessageType::Ok | MessageType::Connect => {
                    warn!("Unexpected {} from relay, ignoring", msg.kind)
                }
            }
        }
    }

    async fn serve_incoming(&mut self, msg: Message) -> Result<(), AgentError> {
        let correlation = msg.payload;

        let local = match self.forwarder.connect().await {
            Ok(local) => local,
            Err(e) => {
                warn!("Declining incoming connection: {}", e);
                self.codec
                    .write_message(&mut self.writer, &Message::error_with(correlation))
                    .await?;
                return Ok(());
            }
        };

        self.codec
            .write_message(&mut self.writer, &Message::ok(correlation))
            .await?;

        self.transition(AgentState::Relaying);
        let outcome = relay(local, &mut self.reader, &mut self.writer).await;

        if outcome.session_failed() {
            warn!("Relay connection failed while relaying ({})", outcome.ended_by);
            return Err(AgentError::ConnectionLost);
        }

        info!(
            target_address = %self.forwarder.target_address(),
            bytes_to_target = outcome.session_to_endpoint,
            bytes_from_target = outcome.endpoint_to_session,
            "Request complete"
        );
        self.transition(AgentState::AwaitingControl);
        Ok(())
    }

    fn transition(&mut self, next: AgentState) {
        debug!(from = %self.state, to = %next, "Agent state transition");
        self.state = next;
    }
}
