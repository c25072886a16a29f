use std::fmt;

use crate::protocol::HubMessage;

/// Errors that can occur during protocol encoding or decoding.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to encode a message to MessagePack.
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode MessagePack data into a message.
    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("Message is missing the record separator")]
    MissingRecordSeparator,

    #[error("Message is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message length prefix is truncated or too large")]
    InvalidLengthPrefix,
}

/// How a protocol's payloads travel over a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Text,
    Binary,
}

impl TransferFormat {
    /// Name used in the negotiate response's `transferFormats` list.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Binary => "Binary",
        }
    }
}

/// Pluggable message serialization used by a hub connection.
///
/// A single payload handed to [`HubProtocol::parse_messages`] may hold several
/// concatenated messages (batching transports such as Long Polling do this).
pub trait HubProtocol: Send + Sync + fmt::Debug {
    /// Protocol name sent in the handshake, e.g. `"json"`.
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    fn transfer_format(&self) -> TransferFormat;

    fn parse_messages(&self, payload: &[u8]) -> Result<Vec<HubMessage>, ProtocolError>;

    fn write_message(&self, message: &HubMessage) -> Result<Vec<u8>, ProtocolError>;
}
