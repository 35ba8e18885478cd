//! Per-agent public listener
//!
//! Accepts external connections on the agent's public port and moves them
//! into the agent's pending slot, one at a time. While the slot is occupied
//! new connections wait in a small FIFO queue; when that is full they are
//! closed immediately.

use crate::connection::ControlSender;
use crate::registry::{FillError, PendingConnection, SessionRegistry};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tether_proto::Message;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PublicListenerConfig {
    /// Connections held while the pending slot is occupied
    pub max_waiting: usize,
    /// How often a waiting connection retries the slot
    pub retry_interval: Duration,
    /// How long a connection may wait before it is closed
    pub max_wait: Duration,
}

impl Default for PublicListenerConfig {
    fn default() -> Self {
        Self {
            max_waiting: 2,
            retry_interval: Duration::from_millis(50),
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Owns the accept task; dropping it stops accepting and releases the port
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

enum Offer {
    Delivered,
    Occupied(PendingConnection),
    SessionGone,
}

pub struct PublicListener {
    agent_id: String,
    listener: TcpListener,
    registry: SessionRegistry,
    control: ControlSender,
    config: PublicListenerConfig,
}

impl PublicListener {
    pub fn new(
        agent_id: String,
        listener: TcpListener,
        registry: SessionRegistry,
        control: ControlSender,
        config: PublicListenerConfig,
    ) -> Self {
        Self {
            agent_id,
            listener,
            registry,
            control,
            config,
        }
    }

    /// Spawn the accept loop. Nothing is accepted until `armed` fires.
    pub fn spawn(self, armed: oneshot::Receiver<()>) -> ListenerHandle {
        ListenerHandle::new(tokio::spawn(self.run(armed)))
    }

    async fn run(self, armed: oneshot::Receiver<()>) {
        if armed.await.is_err() {
            debug!(agent_id = %self.agent_id, "Public listener dropped before handshake completed");
            return;
        }

        match self.listener.local_addr() {
            Ok(addr) => info!(agent_id = %self.agent_id, "Public listener accepting on {}", addr),
            Err(e) => warn!(agent_id = %self.agent_id, "Public listener has no local address: {}", e),
        }

        let mut waiting: VecDeque<PendingConnection> = VecDeque::new();
        let mut notifications = JoinSet::new();
        let mut retry = interval_at(
            Instant::now() + self.config.retry_interval,
            self.config.retry_interval,
        );
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) if is_transient_accept_error(&e) => {
                            debug!(agent_id = %self.agent_id, "Transient accept error: {}", e);
                            continue;
                        }
                        Err(e) => {
                            error!(agent_id = %self.agent_id, "Public listener accept failed: {}", e);
                            break;
                        }
                    };

                    debug!(agent_id = %self.agent_id, peer_addr = %peer_addr, "Accepted public connection");
                    let conn = PendingConnection::new(stream, peer_addr);

                    // Queue order is preserved: a newcomer never jumps ahead of waiters
                    let conn = if waiting.is_empty() {
                        match self.offer(conn, &mut notifications) {
                            Offer::Delivered => continue,
                            Offer::SessionGone => break,
                            Offer::Occupied(conn) => conn,
                        }
                    } else {
                        conn
                    };

                    if waiting.len() < self.config.max_waiting {
                        waiting.push_back(conn);
                    } else {
                        warn!(
                            agent_id = %self.agent_id,
                            peer_addr = %conn.peer_addr,
                            "Agent busy and wait queue full, closing public connection"
                        );
                    }
                }

                _ = retry.tick(), if !waiting.is_empty() => {
                    while let Some(front) = waiting.front() {
                        if front.accepted_at.elapsed() < self.config.max_wait {
                            break;
                        }
                        if let Some(expired) = waiting.pop_front() {
                            warn!(
                                agent_id = %self.agent_id,
                                peer_addr = %expired.peer_addr,
                                "Public connection waited {:?} without being served, closing",
                                self.config.max_wait
                            );
                        }
                    }

                    if let Some(conn) = waiting.pop_front() {
                        match self.offer(conn, &mut notifications) {
                            Offer::Delivered => {}
                            Offer::Occupied(conn) => waiting.push_front(conn),
                            Offer::SessionGone => break,
                        }
                    }
                }

                Some(result) = notifications.join_next(), if !notifications.is_empty() => {
                    if let Err(e) = result {
                        debug!(agent_id = %self.agent_id, "Incoming notification task ended: {}", e);
                    }
                }
            }
        }

        debug!(agent_id = %self.agent_id, "Public listener stopped");
    }

    /// Try to place `conn` in the pending slot and wake the agent.
    ///
    /// The `Incoming` write runs on its own task: it waits on the control
    /// writer, which an in-progress relay holds until it finishes.
    fn offer(&self, conn: PendingConnection, notifications: &mut JoinSet<()>) -> Offer {
        let peer_addr = conn.peer_addr;

        match self.registry.fill_pending_slot(&self.agent_id, conn) {
            Ok(()) => {
                let control = self.control.clone();
                let registry = self.registry.clone();
                let agent_id = self.agent_id.clone();
                notifications.spawn(async move {
                    match control.send(&Message::incoming(&agent_id)).await {
                        Ok(_) => debug!(agent_id = %agent_id, peer_addr = %peer_addr, "Sent Incoming"),
                        Err(e) => {
                            // Framing is lost; the session cannot be used again
                            warn!(agent_id = %agent_id, "Failed to send Incoming, closing session: {}", e);
                            registry.remove(&agent_id);
                        }
                    }
                });
                Offer::Delivered
            }
            Err(FillError::SlotOccupied(conn)) => Offer::Occupied(conn),
            Err(FillError::UnknownAgent(_)) => {
                debug!(agent_id = %self.agent_id, "Session is gone, stopping public listener");
                Offer::SessionGone
            }
        }
    }
}
