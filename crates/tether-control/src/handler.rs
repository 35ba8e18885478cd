//! Control connection state machine (relay side)
//!
//! ```text
//! Handshaking ──Connect──▶ Listening ──Ok(agent id)──▶ Relaying
//!      │                     ▲   │                        │
//!      │ failure             │   └──── relay finished ◀───┘
//!      ▼                     │
//!    Closed ◀── read/write failure or end-of-stream
//! ```
//!
//! The task running [`ControlHandler::handle_connection`] is the only reader
//! of the control connection. While `Relaying` the same read half feeds the
//! relay engine, so nothing else can consume those bytes.

use crate::connection::ControlSender;
use crate::port_allocator::{
    bind_public_listener, PortAllocator, PortAllocatorError, PortRange, DEFAULT_BIND_ATTEMPTS,
};
use crate::public_listener::{PublicListener, PublicListenerConfig};
use crate::registry::{RegistryError, SessionRegistry};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tether_proto::{CodecError, Message, MessageCodec, MessageType};
use tether_transport::{relay, BoxedStream, RelayEnd};
use tokio::io::ReadHalf;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Port allocation failed: {0}")]
    PortAllocation(#[from] PortAllocatorError),

    #[error("Registration failed: {0}")]
    Registration(#[from] RegistryError),

    #[error("Control connection error: {0}")]
    Codec(#[from] CodecError),

    #[error("Too many protocol errors ({0})")]
    TooManyProtocolErrors(u32),

    #[error("Control connection lost during relay ({0})")]
    SessionLost(RelayEnd),

    #[error("Control connection closed after a failed write or session removal")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Handshaking,
    Listening,
    Relaying,
    Closed,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlState::Handshaking => "handshaking",
            ControlState::Listening => "listening",
            ControlState::Relaying => "relaying",
            ControlState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Relay-side control settings
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Host name advertised in the handshake reply
    pub public_host: String,
    /// Address public listeners bind to
    pub bind_ip: IpAddr,
    pub port_range: PortRange,
    pub bind_attempts: u32,
    /// Consecutive protocol errors tolerated before the session is closed
    pub max_protocol_errors: u32,
    pub listener: PublicListenerConfig,
    pub codec: MessageCodec,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_range: PortRange::default(),
            bind_attempts: DEFAULT_BIND_ATTEMPTS,
            max_protocol_errors: 16,
            listener: PublicListenerConfig::default(),
            codec: MessageCodec::default(),
        }
    }
}

type ControlReader = ReadHalf<BoxedStream>;

/// Drives one control connection per call
pub struct ControlHandler {
    registry: SessionRegistry,
    allocator: Arc<dyn PortAllocator>,
    config: ControlConfig,
}

impl ControlHandler {
    pub fn new(
        registry: SessionRegistry,
        allocator: Arc<dyn PortAllocator>,
        config: ControlConfig,
    ) -> Self {
        Self {
            registry,
            allocator,
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Serve a control connection until it closes.
    ///
    /// The session is removed from the registry on every exit path.
    pub async fn handle_connection(
        &self,
        stream: BoxedStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ControlError> {
        let agent_id = peer_addr.to_string();
        let (mut reader, writer) = tokio::io::split(stream);
        let control = ControlSender::new(writer, self.config.codec);
        let mut state = ControlState::Handshaking;

        let result = match self.handshake(&agent_id, &mut reader, &control).await {
            Ok(()) => {
                transition(&agent_id, &mut state, ControlState::Listening);
                let result = self.serve(&agent_id, &mut reader, &control, &mut state).await;
                self.registry.remove(&agent_id);
                result
            }
            Err(e) => {
                control.close();
                Err(e)
            }
        };

        transition(&agent_id, &mut state, ControlState::Closed);
        result
    }

    /// Wait for `Connect`, open the public listener and reply with its address.
    ///
    /// On success the session is registered and its listener armed. On
    /// failure nothing is left registered under this agent id.
    async fn handshake(
        &self,
        agent_id: &str,
        reader: &mut ControlReader,
        control: &ControlSender,
    ) -> Result<(), ControlError> {
        let first = match self.config.codec.read_message(reader).await {
            Ok(msg) => msg,
            Err(e) if e.is_recoverable() => {
                reply_error(control).await;
                return Err(ControlError::Handshake(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if first.kind != MessageType::Connect {
            reply_error(control).await;
            return Err(ControlError::Handshake(format!(
                "expected Connect, got {}",
                first.kind
            )));
        }

        let listener = match bind_public_listener(
            self.allocator.as_ref(),
            self.config.bind_ip,
            self.config.bind_attempts,
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                warn!(agent_id = %agent_id, "Could not open public port: {}", e);
                reply_error(control).await;
                return Err(e.into());
            }
        };

        let port = listener.local_addr()?.port();
        let public_addr = format!("{}:{}", self.config.public_host, port);

        let (arm_tx, arm_rx) = oneshot::channel();
        let handle = PublicListener::new(
            agent_id.to_string(),
            listener,
            self.registry.clone(),
            control.clone(),
            self.config.listener.clone(),
        )
        .spawn(arm_rx);

        if let Err(e) = self
            .registry
            .create(agent_id, control.clone(), handle, public_addr.clone())
        {
            reply_error(control).await;
            return Err(e.into());
        }

        if let Err(e) = control.send(&Message::ok(public_addr.clone())).await {
            self.registry.remove(agent_id);
            return Err(e.into());
        }

        // Ok is on the wire, so an Incoming can no longer overtake it
        let _ = arm_tx.send(());

        info!(agent_id = %agent_id, public_addr = %public_addr, "Agent connected");
        Ok(())
    }

    async fn serve(
        &self,
        agent_id: &str,
        reader: &mut ControlReader,
        control: &ControlSender,
        state: &mut ControlState,
    ) -> Result<(), ControlError> {
        let codec = self.config.codec;
        let mut protocol_errors = 0u32;

        loop {
            let read = tokio::select! {
                read = codec.read_message(reader) => read,
                _ = control.closed() => {
                    info!(agent_id = %agent_id, "Control connection closed by relay");
                    return Err(ControlError::ConnectionClosed);
                }
            };

            let msg = match read {
                Ok(msg) => msg,
                Err(e) if e.is_recoverable() => {
                    warn!(agent_id = %agent_id, "Dropping message: {}", e);
                    self.protocol_error(control, &mut protocol_errors).await?;
                    continue;
                }
                Err(e) if e.is_clean_close() => {
                    info!(agent_id = %agent_id, "Agent disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            debug!(agent_id = %agent_id, "Received {}", msg);

            match msg.kind {
                MessageType::Ok => {
                    if msg.payload.as_ref() != agent_id.as_bytes() {
                        warn!(
                            agent_id = %agent_id,
                            payload = ?msg.payload_str(),
                            "Ok payload does not match agent id"
                        );
                        self.protocol_error(control, &mut protocol_errors).await?;
                        continue;
                    }

                    // Hold the writer before draining so an Incoming for the
                    // next connection cannot slip in ahead of the relay
                    let mut writer = control.lock_owned().await;
                    let Some(pending) = self.registry.drain_pending_slot(agent_id) else {
                        drop(writer);
                        warn!(agent_id = %agent_id, "Ok received with no pending connection");
                        self.protocol_error(control, &mut protocol_errors).await?;
                        continue;
                    };

                    transition(agent_id, state, ControlState::Relaying);
                    info!(
                        agent_id = %agent_id,
                        peer_addr = %pending.peer_addr,
                        "Relaying public connection"
                    );
                    let outcome = relay(pending.stream, reader, &mut *writer).await;
                    drop(writer);

                    if outcome.session_failed() {
                        return Err(ControlError::SessionLost(outcome.ended_by));
                    }

                    debug!(
                        agent_id = %agent_id,
                        sent = outcome.endpoint_to_session,
                        received = outcome.session_to_endpoint,
                        "Relay complete"
                    );
                    transition(agent_id, state, ControlState::Listening);
                    protocol_errors = 0;
                }
                MessageType::Error => {
                    if msg.payload.as_ref() != agent_id.as_bytes() {
                        // Counted, but never answered with another Error
                        warn!(
                            agent_id = %agent_id,
                            payload = ?msg.payload_str(),
                            "Error payload does not match agent id, ignoring"
                        );
                        self.count_protocol_error(&mut protocol_errors)?;
                        continue;
                    }

                    // Agent could not serve the pending connection
                    match self.registry.drain_pending_slot(agent_id) {
                        Some(pending) => info!(
                            agent_id = %agent_id,
                            peer_addr = %pending.peer_addr,
                            "Agent declined connection, closing it"
                        ),
                        None => debug!(agent_id = %agent_id, "Error from agent with empty slot"),
                    }
                    protocol_errors = 0;
                }
                MessageType::Connect | MessageType::Incoming => {
                    warn!(agent_id = %agent_id, "Unexpected {} while listening", msg.kind);
                    self.protocol_error(control, &mut protocol_errors).await?;
                }
            }
        }
    }

    /// Reply `Error` and count the violation
    async fn protocol_error(
        &self,
        control: &ControlSender,
        protocol_errors: &mut u32,
    ) -> Result<(), ControlError> {
        self.count_protocol_error(protocol_errors)?;
        control.send(&Message::error()).await?;
        Ok(())
    }

    fn count_protocol_error(&self, protocol_errors: &mut u32) -> Result<(), ControlError> {
        *protocol_errors += 1;
        if *protocol_errors > self.config.max_protocol_errors {
            return Err(ControlError::TooManyProtocolErrors(*protocol_errors));
        }
        Ok(())
    }
}

/// Best-effort `Error` reply on a connection that is about to close
async fn reply_error(control: &ControlSender) {
    if let Err(e) = control.send(&Message::error()).await {
        debug!("Could not send Error reply: {}", e);
    }
}

fn transition(agent_id: &str, state: &mut ControlState, next: ControlState) {
    debug!(agent_id = %agent_id, from = %state, to = %next, "Control state transition");
    *state = next;
}
