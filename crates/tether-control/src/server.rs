//! Relay server: accepts agent control connections

use crate::handler::ControlHandler;
use crate::public_listener::is_transient_accept_error;
use crate::registry::SessionRegistry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_transport::TransportAcceptor;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct RelayServer {
    listener: TcpListener,
    acceptor: Arc<dyn TransportAcceptor>,
    handler: Arc<ControlHandler>,
}

impl RelayServer {
    /// Bind the control listener
    pub async fn bind(
        addr: SocketAddr,
        acceptor: Arc<dyn TransportAcceptor>,
        handler: Arc<ControlHandler>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Relay listening for agents on {} ({})",
            listener.local_addr()?,
            acceptor.protocol()
        );

        Ok(Self {
            listener,
            acceptor,
            handler,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> SessionRegistry {
        self.handler.registry().clone()
    }

    /// Serve until the process is killed
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` completes, then close every session
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down relay server");
                    break;
                }

                accepted = self.listener.accept() => {
                    let (tcp, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) if is_transient_accept_error(&e) => {
                            debug!("Transient accept error: {}", e);
                            continue;
                        }
                        Err(e) => {
                            error!("Failed to accept control connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    debug!(peer_addr = %peer_addr, "New control connection");
                    let acceptor = self.acceptor.clone();
                    let handler = self.handler.clone();

                    connections.spawn(async move {
                        let stream = match acceptor.accept_stream(tcp).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!(peer_addr = %peer_addr, "Transport handshake failed: {}", e);
                                return;
                            }
                        };

                        match handler.handle_connection(stream, peer_addr).await {
                            Ok(()) => debug!(peer_addr = %peer_addr, "Control connection closed"),
                            Err(e) => warn!(peer_addr = %peer_addr, "Control connection ended: {}", e),
                        }
                    });
                }

                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!("Control task panicked: {}", e);
                        }
                    }
                }
            }
        }

        connections.abort_all();
        while connections.join_next().await.is_some() {}

        let removed = self.handler.registry().remove_all();
        info!("Relay server stopped ({} session(s) closed)", removed);
    }
}
