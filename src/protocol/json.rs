//! JSON hub protocol.
//!
//! Every message is a JSON object terminated by the ASCII record separator
//! (`0x1E`). The message kind is given by the numeric `type` field; the
//! invocation and completion variants are told apart by which optional
//! fields are present.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{
    Completion, HubMessage, HubProtocol, Invocation, MessageType, ProtocolError, TransferFormat,
    handshake::RECORD_SEPARATOR,
};

/// On-the-wire shape shared by all JSON messages.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl WireMessage {
    fn of(kind: MessageType) -> Self {
        Self {
            kind: u64::from(kind.code()),
            ..Self::default()
        }
    }

    fn into_message(self) -> Result<Option<HubMessage>, ProtocolError> {
        let Some(kind) = MessageType::from_code(self.kind) else {
            debug!(message_type = self.kind, "Ignoring unknown message type");
            return Ok(None);
        };

        let message = match kind {
            MessageType::Invocation => {
                let target = self.target.ok_or(ProtocolError::MissingField("target"))?;
                let arguments = self.arguments.unwrap_or_default();
                let invocation = if let Some(stream_ids) = self.stream_ids {
                    Invocation::Streaming {
                        invocation_id: self.invocation_id,
                        target,
                        arguments,
                        stream_ids,
                    }
                } else if let Some(invocation_id) = self.invocation_id {
                    Invocation::Blocking {
                        invocation_id,
                        target,
                        arguments,
                    }
                } else {
                    Invocation::NonBlocking { target, arguments }
                };
                HubMessage::Invocation(invocation)
            }
            MessageType::StreamItem => HubMessage::StreamItem {
                invocation_id: self
                    .invocation_id
                    .ok_or(ProtocolError::MissingField("invocationId"))?,
                item: self.item.unwrap_or(Value::Null),
            },
            MessageType::Completion => {
                let invocation_id = self
                    .invocation_id
                    .ok_or(ProtocolError::MissingField("invocationId"))?;
                let completion = if let Some(error) = self.error {
                    Completion::Error {
                        invocation_id,
                        error,
                    }
                } else if let Some(result) = self.result {
                    Completion::Resulted {
                        invocation_id,
                        result,
                    }
                } else {
                    Completion::Simple { invocation_id }
                };
                HubMessage::Completion(completion)
            }
            MessageType::StreamInvocation => HubMessage::StreamInvocation {
                invocation_id: self
                    .invocation_id
                    .ok_or(ProtocolError::MissingField("invocationId"))?,
                target: self.target.ok_or(ProtocolError::MissingField("target"))?,
                arguments: self.arguments.unwrap_or_default(),
                stream_ids: self.stream_ids.unwrap_or_default(),
            },
            MessageType::CancelInvocation => HubMessage::CancelInvocation {
                invocation_id: self
                    .invocation_id
                    .ok_or(ProtocolError::MissingField("invocationId"))?,
            },
            MessageType::Ping => HubMessage::Ping,
            MessageType::Close => HubMessage::Close {
                error: self.error,
                allow_reconnect: self.allow_reconnect.unwrap_or(false),
            },
        };
        Ok(Some(message))
    }

    fn from_message(message: &HubMessage) -> Self {
        let mut wire = Self::of(message.message_type());
        match message {
            HubMessage::Invocation(invocation) => {
                wire.invocation_id = invocation.invocation_id().map(str::to_owned);
                wire.target = Some(invocation.target().to_owned());
                wire.arguments = Some(invocation.arguments().to_vec());
                if let Invocation::Streaming { stream_ids, .. } = invocation {
                    wire.stream_ids = Some(stream_ids.clone());
                }
            }
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => {
                wire.invocation_id = Some(invocation_id.clone());
                wire.item = Some(item.clone());
            }
            HubMessage::Completion(completion) => {
                wire.invocation_id = Some(completion.invocation_id().to_owned());
                match completion {
                    Completion::Simple { .. } => {}
                    Completion::Resulted { result, .. } => wire.result = Some(result.clone()),
                    Completion::Error { error, .. } => wire.error = Some(error.clone()),
                }
            }
            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                wire.invocation_id = Some(invocation_id.clone());
                wire.target = Some(target.clone());
                wire.arguments = Some(arguments.clone());
                if !stream_ids.is_empty() {
                    wire.stream_ids = Some(stream_ids.clone());
                }
            }
            HubMessage::CancelInvocation { invocation_id } => {
                wire.invocation_id = Some(invocation_id.clone());
            }
            HubMessage::Ping => {}
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                wire.error = error.clone();
                wire.allow_reconnect = allow_reconnect.then_some(true);
            }
        }
        wire
    }
}

/// The `json` hub protocol, version 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHubProtocol;

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        "json"
    }

    fn version(&self) -> u32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn parse_messages(&self, payload: &[u8]) -> Result<Vec<HubMessage>, ProtocolError> {
        if !payload.is_empty() && payload.last() != Some(&RECORD_SEPARATOR) {
            return Err(ProtocolError::MissingRecordSeparator);
        }

        let mut messages = Vec::new();
        for chunk in payload.split(|&b| b == RECORD_SEPARATOR) {
            if chunk.is_empty() {
                continue;
            }
            let wire: WireMessage = serde_json::from_slice(chunk)?;
            if let Some(message) = wire.into_message()? {
                messages.push(message);
            }
        }
        Ok(messages)
    }

    fn write_message(&self, message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = serde_json::to_vec(&WireMessage::from_message(message))?;
        buf.push(RECORD_SEPARATOR);
        Ok(buf)
    }
}
