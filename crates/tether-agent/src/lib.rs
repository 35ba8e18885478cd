//! Tether agent
//!
//! Registers with a relay over a single control connection and forwards each
//! public connection the relay hands over to a local target service.

pub mod agent;
pub mod forwarder;

pub use agent::{Agent, AgentConfig, AgentError, AgentState};
pub use forwarder::{ForwarderError, TcpForwarder};
