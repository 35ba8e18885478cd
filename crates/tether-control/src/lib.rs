//! Relay control plane
//!
//! Accepts agent control connections, gives each agent a public port, and
//! hands public connections to agents one at a time over their single
//! control connection.

pub mod connection;
pub mod handler;
pub mod port_allocator;
pub mod public_listener;
pub mod registry;
pub mod server;

pub use connection::ControlSender;
pub use handler::{ControlConfig, ControlError, ControlHandler, ControlState};
pub use port_allocator::{
    bind_public_listener, PortAllocator, PortAllocatorError, PortRange, RandomPortAllocator,
    DEFAULT_BIND_ATTEMPTS,
};
pub use public_listener::{ListenerHandle, PublicListener, PublicListenerConfig};
pub use registry::{FillError, PendingConnection, RegistryError, SessionInfo, SessionRegistry};
pub use server::RelayServer;
