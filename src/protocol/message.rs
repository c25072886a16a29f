//! SignalR hub protocol messages.
//!
//! This module defines the [`HubMessage`] enum that represents every message
//! kind exchanged after the handshake, independent of the wire format.
//!
//! See the [hub protocol documentation](https://github.com/dotnet/aspnetcore/blob/main/src/SignalR/docs/specs/HubProtocol.md).

use serde_json::Value;

/// Numeric message type discriminator used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl MessageType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Invocation),
            2 => Some(Self::StreamItem),
            3 => Some(Self::Completion),
            4 => Some(Self::StreamInvocation),
            5 => Some(Self::CancelInvocation),
            6 => Some(Self::Ping),
            7 => Some(Self::Close),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// A request to call a method on the other side.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Fire-and-forget call; no completion is expected.
    NonBlocking { target: String, arguments: Vec<Value> },

    /// Call expecting exactly one completion carrying `invocation_id`.
    Blocking {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
    },

    /// Call that also opens upload streams identified by `stream_ids`.
    Streaming {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
    },
}

impl Invocation {
    pub fn target(&self) -> &str {
        match self {
            Self::NonBlocking { target, .. }
            | Self::Blocking { target, .. }
            | Self::Streaming { target, .. } => target,
        }
    }

    pub fn arguments(&self) -> &[Value] {
        match self {
            Self::NonBlocking { arguments, .. }
            | Self::Blocking { arguments, .. }
            | Self::Streaming { arguments, .. } => arguments,
        }
    }

    /// The id the caller expects a completion for, if any.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Self::NonBlocking { .. } => None,
            Self::Blocking { invocation_id, .. } => Some(invocation_id),
            Self::Streaming { invocation_id, .. } => invocation_id.as_deref(),
        }
    }

    /// Splits the invocation into target, arguments and optional id.
    pub fn into_parts(self) -> (String, Vec<Value>, Option<String>) {
        match self {
            Self::NonBlocking { target, arguments } => (target, arguments, None),
            Self::Blocking {
                invocation_id,
                target,
                arguments,
            } => (target, arguments, Some(invocation_id)),
            Self::Streaming {
                invocation_id,
                target,
                arguments,
                ..
            } => (target, arguments, invocation_id),
        }
    }
}

/// Terminal response to a blocking invocation.
///
/// Exactly one of these shapes is sent per invocation id.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Simple { invocation_id: String },
    Resulted { invocation_id: String, result: Value },
    Error { invocation_id: String, error: String },
}

impl Completion {
    pub fn invocation_id(&self) -> &str {
        match self {
            Self::Simple { invocation_id }
            | Self::Resulted { invocation_id, .. }
            | Self::Error { invocation_id, .. } => invocation_id,
        }
    }
}

/// A SignalR hub message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(Invocation),

    /// One item of a server-to-client stream.
    StreamItem { invocation_id: String, item: Value },

    Completion(Completion),

    /// Client → server request to open a server-to-client stream.
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
        stream_ids: Vec<String>,
    },

    /// Client → server request to stop a running stream.
    CancelInvocation { invocation_id: String },

    /// Keep-alive message. Carries no data.
    Ping,

    /// Server-initiated termination.
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

impl HubMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Invocation(_) => MessageType::Invocation,
            Self::StreamItem { .. } => MessageType::StreamItem,
            Self::Completion(_) => MessageType::Completion,
            Self::StreamInvocation { .. } => MessageType::StreamInvocation,
            Self::CancelInvocation { .. } => MessageType::CancelInvocation,
            Self::Ping => MessageType::Ping,
            Self::Close { .. } => MessageType::Close,
        }
    }
}

impl From<Invocation> for HubMessage {
    fn from(invocation: Invocation) -> Self {
        Self::Invocation(invocation)
    }
}

impl From<Completion> for HubMessage {
    fn from(completion: Completion) -> Self {
        Self::Completion(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_id_depends_on_variant() {
        let non_blocking = Invocation::NonBlocking {
            target: "inc".into(),
            arguments: vec![],
        };
        assert_eq!(non_blocking.invocation_id(), None);

        let streaming = Invocation::Streaming {
            invocation_id: Some("7".into()),
            target: "upload".into(),
            arguments: vec![json!(1)],
            stream_ids: vec!["s1".into()],
        };
        assert_eq!(streaming.invocation_id(), Some("7"));
        assert_eq!(streaming.target(), "upload");
        assert_eq!(streaming.arguments(), &[json!(1)]);
    }

    #[test]
    fn message_type_codes() {
        assert_eq!(HubMessage::Ping.message_type().code(), 6);
        assert_eq!(MessageType::from_code(3), Some(MessageType::Completion));
        assert_eq!(MessageType::from_code(9), None);
    }
}
