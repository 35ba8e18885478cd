//! Session registry for connected agents
//!
//! One entry per agent that has completed the handshake. Each entry owns the
//! agent's public listener and a capacity-one pending slot for the public
//! connection waiting to be handed to the agent. All access goes through a
//! single lock held only for map mutation; closing sockets happens after the
//! lock is released.

use crate::connection::ControlSender;
use crate::public_listener::ListenerHandle;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Agent {0} is already registered")]
    DuplicateAgent(String),
}

/// Why a pending connection could not be stored.
///
/// The connection is handed back so the caller can retry or close it.
#[derive(Debug, Error)]
pub enum FillError {
    #[error("Unknown agent")]
    UnknownAgent(PendingConnection),

    #[error("Pending slot already occupied")]
    SlotOccupied(PendingConnection),
}

impl FillError {
    pub fn into_connection(self) -> PendingConnection {
        match self {
            FillError::UnknownAgent(conn) | FillError::SlotOccupied(conn) => conn,
        }
    }
}

/// An accepted public connection waiting for its agent
#[derive(Debug)]
pub struct PendingConnection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub accepted_at: Instant,
}

impl PendingConnection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            peer_addr,
            accepted_at: Instant::now(),
        }
    }
}

struct AgentSession {
    control: ControlSender,
    listener: ListenerHandle,
    public_addr: String,
    pending: Option<PendingConnection>,
    connected_at: DateTime<Utc>,
}

impl AgentSession {
    /// Release everything the session owns. Called outside the registry lock.
    fn close(self) {
        let AgentSession {
            control,
            listener,
            pending,
            ..
        } = self;

        // Aborts the accept task, which drops the listener socket
        drop(listener);
        if let Some(pending) = pending {
            debug!(peer_addr = %pending.peer_addr, "Closing pending public connection");
            drop(pending);
        }
        control.close();
    }
}

/// Snapshot of a registered session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub agent_id: String,
    pub public_addr: String,
    pub has_pending: bool,
    pub connected_at: DateTime<Utc>,
}

/// Registry of agent sessions keyed by agent id
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, AgentSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, AgentSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session after a successful handshake
    pub fn create(
        &self,
        agent_id: &str,
        control: ControlSender,
        listener: ListenerHandle,
        public_addr: String,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions();
        if sessions.contains_key(agent_id) {
            warn!(agent_id = %agent_id, "Rejecting duplicate agent registration");
            return Err(RegistryError::DuplicateAgent(agent_id.to_string()));
        }

        sessions.insert(
            agent_id.to_string(),
            AgentSession {
                control,
                listener,
                public_addr: public_addr.clone(),
                pending: None,
                connected_at: Utc::now(),
            },
        );
        drop(sessions);

        info!(agent_id = %agent_id, public_addr = %public_addr, "Registered agent session");
        Ok(())
    }

    /// Store a public connection in the agent's pending slot.
    ///
    /// Never overwrites: an occupied slot hands the new connection back.
    pub fn fill_pending_slot(
        &self,
        agent_id: &str,
        conn: PendingConnection,
    ) -> Result<(), FillError> {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(agent_id) else {
            return Err(FillError::UnknownAgent(conn));
        };
        if session.pending.is_some() {
            return Err(FillError::SlotOccupied(conn));
        }
        session.pending = Some(conn);
        Ok(())
    }

    /// Take whatever sits in the agent's pending slot
    pub fn drain_pending_slot(&self, agent_id: &str) -> Option<PendingConnection> {
        self.sessions()
            .get_mut(agent_id)
            .and_then(|session| session.pending.take())
    }

    /// Remove a session, closing its listener, control connection and any
    /// pending connection. Returns false if the agent was not registered.
    pub fn remove(&self, agent_id: &str) -> bool {
        let removed = self.sessions().remove(agent_id);
        match removed {
            Some(session) => {
                session.close();
                info!(agent_id = %agent_id, "Removed agent session");
                true
            }
            None => {
                debug!(agent_id = %agent_id, "Session already removed");
                false
            }
        }
    }

    /// Remove every session. Returns how many were removed.
    pub fn remove_all(&self) -> usize {
        let drained: Vec<(String, AgentSession)> = self.sessions().drain().collect();
        let count = drained.len();
        for (agent_id, session) in drained {
            session.close();
            debug!(agent_id = %agent_id, "Removed agent session");
        }
        if count > 0 {
            info!("Removed {} agent session(s)", count);
        }
        count
    }

    pub fn get(&self, agent_id: &str) -> Option<SessionInfo> {
        self.sessions()
            .get(agent_id)
            .map(|session| Self::info(agent_id, session))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions()
            .iter()
            .map(|(id, session)| Self::info(id, session))
            .collect()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.sessions().contains_key(agent_id)
    }

    pub fn count(&self) -> usize {
        self.sessions().len()
    }

    fn info(agent_id: &str, session: &AgentSession) -> SessionInfo {
        SessionInfo {
            agent_id: agent_id.to_string(),
            public_addr: session.public_addr.clone(),
            has_pending: session.pending.is_some(),
            connected_at: session.connected_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_proto::MessageCodec;
    use tether_transport::BoxedStream;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::net::TcpListener;

    fn control_pair() -> (ControlSender, DuplexStream) {
        let (local, remote) = duplex(1024);
        let (_reader, writer) = tokio::io::split(Box::new(local) as BoxedStream);
        (ControlSender::new(writer, MessageCodec::default()), remote)
    }

    fn idle_listener() -> ListenerHandle {
        ListenerHandle::new(tokio::spawn(std::future::pending::<()>()))
    }

    /// Returns (relay side as pending connection, client side)
    async fn public_connection() -> (PendingConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        (PendingConnection::new(stream, peer), client)
    }

    fn register(registry: &SessionRegistry, id: &str) -> DuplexStream {
        let (control, remote) = control_pair();
        registry
            .create(id, control, idle_listener(), "localhost:60001".to_string())
            .unwrap();
        remote
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let registry = SessionRegistry::new();
        let _remote = register(&registry, "127.0.0.1:40000");

        assert_eq!(registry.count(), 1);
        assert!(registry.contains("127.0.0.1:40000"));

        let info = registry.get("127.0.0.1:40000").unwrap();
        assert_eq!(info.public_addr, "localhost:60001");
        assert!(!info.has_pending);
        assert_eq!(registry.list(), vec![info]);
    }

    #[tokio::test]
    async fn test_duplicate_agent_rejected() {
        let registry = SessionRegistry::new();
        let _remote = register(&registry, "agent");

        let (control, _remote2) = control_pair();
        let result = registry.create("agent", control, idle_listener(), "localhost:60002".into());
        assert!(matches!(result, Err(RegistryError::DuplicateAgent(_))));

        // Original entry untouched
        assert_eq!(registry.get("agent").unwrap().public_addr, "localhost:60001");
    }

    #[tokio::test]
    async fn test_fill_never_overwrites() {
        let registry = SessionRegistry::new();
        let _remote = register(&registry, "agent");

        let (first, _client1) = public_connection().await;
        let (second, _client2) = public_connection().await;
        let first_peer = first.peer_addr;
        let second_peer = second.peer_addr;

        registry.fill_pending_slot("agent", first).unwrap();
        assert!(registry.get("agent").unwrap().has_pending);

        match registry.fill_pending_slot("agent", second) {
            Err(FillError::SlotOccupied(conn)) => assert_eq!(conn.peer_addr, second_peer),
            other => panic!("expected SlotOccupied, got {:?}", other),
        }

        let drained = registry.drain_pending_slot("agent").unwrap();
        assert_eq!(drained.peer_addr, first_peer);
        assert!(registry.drain_pending_slot("agent").is_none());
    }

    #[tokio::test]
    async fn test_fill_unknown_agent_returns_connection() {
        let registry = SessionRegistry::new();
        let (conn, _client) = public_connection().await;
        let peer = conn.peer_addr;

        let err = registry.fill_pending_slot("missing", conn).unwrap_err();
        assert!(matches!(err, FillError::UnknownAgent(_)));
        assert_eq!(err.into_connection().peer_addr, peer);
    }

    #[tokio::test]
    async fn test_remove_closes_everything_and_is_idempotent() {
        let registry = SessionRegistry::new();
        let mut remote = register(&registry, "agent");

        let (conn, mut client) = public_connection().await;
        registry.fill_pending_slot("agent", conn).unwrap();

        assert!(registry.remove("agent"));
        assert!(!registry.remove("agent"));
        assert_eq!(registry.count(), 0);

        // Pending public connection was closed
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);

        // Control connection was shut down
        let err = MessageCodec::default()
            .read_message(&mut remote)
            .await
            .unwrap_err();
        assert!(err.is_clean_close());
    }

    #[tokio::test]
    async fn test_remove_all() {
        let registry = SessionRegistry::new();
        let _a = register(&registry, "a");
        let _b = register(&registry, "b");

        assert_eq!(registry.remove_all(), 2);
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.remove_all(), 0);
    }
}
