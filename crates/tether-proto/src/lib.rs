//! Tether Protocol Definitions
//!
//! This crate defines the control messages exchanged between an agent and the
//! relay, and the fixed-header codec that frames them on the wire.
//!
//! Every frame is laid out as:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬──────────────────────┐
//! │ type (u64, BE)   │ length (u64, BE) │ payload (length B)   │
//! └──────────────────┴──────────────────┴──────────────────────┘
//! ```
//!
//! The same connection alternates between these frames and raw relayed bytes,
//! so the codec never reads ahead of the frame it is decoding.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, MessageCodec};
pub use messages::{Message, MessageType};

/// Size of the fixed frame header: type (8) + payload length (8)
pub const HEADER_SIZE: usize = 16;

/// Default ceiling for a single payload.
///
/// The wire format itself has no limit; payloads carry agent ids and
/// `host:port` strings, so a few kilobytes is plenty.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 4 * 1024;
