//! SignalR hub protocol implementation.
//!
//! This module provides the protocol-neutral [`HubMessage`] model, the
//! [`HubProtocol`] contract the connection core serializes through, and the
//! two stock protocols: JSON and MessagePack.

pub mod handshake;
mod hub_protocol;
mod json;
mod message;
mod msgpack;

pub use handshake::{HandshakeRequest, HandshakeResponse, RECORD_SEPARATOR};
pub use hub_protocol::{HubProtocol, ProtocolError, TransferFormat};
pub use json::JsonHubProtocol;
pub use message::{Completion, HubMessage, Invocation, MessageType};
pub use msgpack::MessagePackHubProtocol;
