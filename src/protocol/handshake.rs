//! Handshake exchanged right after the transport starts.
//!
//! The handshake is always JSON, whatever hub protocol is negotiated:
//! the client sends `{"protocol":"json","version":1}` followed by the record
//! separator and the server answers with `{}` (or `{"error":"..."}`) followed
//! by the same separator.

use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// ASCII record separator terminating every text-framed message.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Handshake request sent by the client to initiate the connection.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Protocol name, e.g. `"json"`.
    pub protocol: String,
    pub version: u32,
}

impl HandshakeRequest {
    pub fn new(protocol: impl Into<String>, version: u32) -> Self {
        Self {
            protocol: protocol.into(),
            version,
        }
    }

    /// Serializes the request and appends the record separator.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(RECORD_SEPARATOR);
        Ok(buf)
    }
}

/// Handshake response sent by the server to acknowledge the connection.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Error message if the handshake was rejected.
    #[serde(default)]
    pub error: Option<String>,
}

/// Parses the first frame received after the handshake request.
///
/// Returns the response together with whatever bytes followed the record
/// separator; servers may batch the first hub messages into the same frame.
pub fn parse_handshake_response(frame: &[u8]) -> Result<(HandshakeResponse, &[u8]), ProtocolError> {
    let end = frame
        .iter()
        .position(|&b| b == RECORD_SEPARATOR)
        .ok_or(ProtocolError::MissingRecordSeparator)?;
    let response: HandshakeResponse = serde_json::from_slice(&frame[..end])?;
    Ok((response, &frame[end + 1..]))
}
