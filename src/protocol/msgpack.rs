//! MessagePack hub protocol.
//!
//! Each message is a MessagePack array prefixed with its length encoded as a
//! 7-bit varint, compatible with ASP.NET Core SignalR.

use serde_json::{Map, Value};
use std::io::Cursor;
use tracing::debug;

use super::{
    Completion, HubMessage, HubProtocol, Invocation, MessageType, ProtocolError, TransferFormat,
};

const RESULT_KIND_ERROR: u64 = 1;
const RESULT_KIND_VOID: u64 = 2;
const RESULT_KIND_NON_VOID: u64 = 3;

/// Largest length prefix is five 7-bit groups (2 GiB).
const MAX_LENGTH_PREFIX_BYTES: usize = 5;

/// The `messagepack` hub protocol, version 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackHubProtocol;

impl HubProtocol for MessagePackHubProtocol {
    fn name(&self) -> &str {
        "messagepack"
    }

    fn version(&self) -> u32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Binary
    }

    fn parse_messages(&self, payload: &[u8]) -> Result<Vec<HubMessage>, ProtocolError> {
        let mut messages = Vec::new();
        let mut rest = payload;
        while !rest.is_empty() {
            let (length, prefix) = read_length_prefix(rest)?;
            let body = rest
                .get(prefix..prefix + length)
                .ok_or(ProtocolError::InvalidLengthPrefix)?;
            if let Some(message) = decode_message(body)? {
                messages.push(message);
            }
            rest = &rest[prefix + length..];
        }
        Ok(messages)
    }

    fn write_message(&self, message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::new();
        rmp_serde::encode::write(&mut body, &encode_message(message))?;

        let mut buf = Vec::with_capacity(body.len() + MAX_LENGTH_PREFIX_BYTES);
        write_length_prefix(&mut buf, body.len());
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

fn read_length_prefix(data: &[u8]) -> Result<(usize, usize), ProtocolError> {
    let mut length = 0usize;
    for (i, byte) in data.iter().take(MAX_LENGTH_PREFIX_BYTES).enumerate() {
        length |= usize::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((length, i + 1));
        }
    }
    Err(ProtocolError::InvalidLengthPrefix)
}

fn write_length_prefix(buf: &mut Vec<u8>, mut length: usize) {
    loop {
        let mut byte = (length & 0x7f) as u8;
        length >>= 7;
        if length > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if length == 0 {
            break;
        }
    }
}

fn encode_message(message: &HubMessage) -> Vec<Value> {
    let headers = || Value::Object(Map::new());
    let code = Value::from(message.message_type().code());

    match message {
        HubMessage::Invocation(invocation) => {
            // [1, headers, invocationId, target, arguments, streamIds?]
            let mut array = vec![
                code,
                headers(),
                invocation.invocation_id().map_or(Value::Null, Value::from),
                Value::from(invocation.target()),
                Value::Array(invocation.arguments().to_vec()),
            ];
            if let Invocation::Streaming { stream_ids, .. } = invocation {
                array.push(Value::from(stream_ids.clone()));
            }
            array
        }
        HubMessage::StreamItem {
            invocation_id,
            item,
        } => vec![code, headers(), Value::from(invocation_id.as_str()), item.clone()],
        HubMessage::Completion(completion) => {
            // [3, headers, invocationId, resultKind, result?]
            let mut array = vec![code, headers(), Value::from(completion.invocation_id())];
            match completion {
                Completion::Error { error, .. } => {
                    array.push(Value::from(RESULT_KIND_ERROR));
                    array.push(Value::from(error.as_str()));
                }
                Completion::Simple { .. } => array.push(Value::from(RESULT_KIND_VOID)),
                Completion::Resulted { result, .. } => {
                    array.push(Value::from(RESULT_KIND_NON_VOID));
                    array.push(result.clone());
                }
            }
            array
        }
        HubMessage::StreamInvocation {
            invocation_id,
            target,
            arguments,
            stream_ids,
        } => vec![
            code,
            headers(),
            Value::from(invocation_id.as_str()),
            Value::from(target.as_str()),
            Value::Array(arguments.clone()),
            Value::from(stream_ids.clone()),
        ],
        HubMessage::CancelInvocation { invocation_id } => {
            vec![code, headers(), Value::from(invocation_id.as_str())]
        }
        HubMessage::Ping => vec![code],
        HubMessage::Close {
            error,
            allow_reconnect,
        } => vec![
            code,
            error.as_deref().map_or(Value::Null, Value::from),
            Value::Bool(*allow_reconnect),
        ],
    }
}

fn decode_message(body: &[u8]) -> Result<Option<HubMessage>, ProtocolError> {
    let array = match rmpv::decode::read_value(&mut Cursor::new(body))? {
        rmpv::Value::Array(items) => items
            .into_iter()
            .map(to_json)
            .collect::<Result<Vec<_>, _>>()?,
        other => {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected a MessagePack array, got {other}"
            )));
        }
    };

    let code = array
        .first()
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField("type"))?;
    let Some(kind) = MessageType::from_code(code) else {
        debug!(message_type = code, "Ignoring unknown message type");
        return Ok(None);
    };

    let message = match kind {
        MessageType::Invocation => {
            let invocation_id = optional_string(&array, 2)?;
            let target = required_string(&array, 3, "target")?;
            let arguments = arguments_at(&array, 4)?;
            let invocation = match array.get(5) {
                Some(Value::Array(ids)) => Invocation::Streaming {
                    invocation_id,
                    target,
                    arguments,
                    stream_ids: string_list(ids)?,
                },
                _ => match invocation_id {
                    Some(invocation_id) => Invocation::Blocking {
                        invocation_id,
                        target,
                        arguments,
                    },
                    None => Invocation::NonBlocking { target, arguments },
                },
            };
            HubMessage::Invocation(invocation)
        }
        MessageType::StreamItem => HubMessage::StreamItem {
            invocation_id: required_string(&array, 2, "invocationId")?,
            item: array.get(3).cloned().unwrap_or(Value::Null),
        },
        MessageType::Completion => {
            let invocation_id = required_string(&array, 2, "invocationId")?;
            let result_kind = array
                .get(3)
                .and_then(Value::as_u64)
                .ok_or(ProtocolError::MissingField("resultKind"))?;
            let completion = match result_kind {
                RESULT_KIND_ERROR => Completion::Error {
                    invocation_id,
                    error: required_string(&array, 4, "error")?,
                },
                RESULT_KIND_VOID => Completion::Simple { invocation_id },
                RESULT_KIND_NON_VOID => match array.get(4) {
                    Some(result) if !result.is_null() => Completion::Resulted {
                        invocation_id,
                        result: result.clone(),
                    },
                    _ => Completion::Simple { invocation_id },
                },
                other => {
                    return Err(ProtocolError::InvalidMessage(format!(
                        "unknown completion result kind {other}"
                    )));
                }
            };
            HubMessage::Completion(completion)
        }
        MessageType::StreamInvocation => HubMessage::StreamInvocation {
            invocation_id: required_string(&array, 2, "invocationId")?,
            target: required_string(&array, 3, "target")?,
            arguments: arguments_at(&array, 4)?,
            stream_ids: match array.get(5) {
                Some(Value::Array(ids)) => string_list(ids)?,
                _ => Vec::new(),
            },
        },
        MessageType::CancelInvocation => HubMessage::CancelInvocation {
            invocation_id: required_string(&array, 2, "invocationId")?,
        },
        MessageType::Ping => HubMessage::Ping,
        MessageType::Close => HubMessage::Close {
            error: optional_string(&array, 1)?,
            allow_reconnect: array.get(2).and_then(Value::as_bool).unwrap_or(false),
        },
    };
    Ok(Some(message))
}

/// Converts a MessagePack value into its JSON counterpart. Binary and
/// extension payloads become arrays of byte values, which is also how
/// `Vec<u8>` deserializes.
fn to_json(value: rmpv::Value) -> Result<Value, ProtocolError> {
    Ok(match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(n) => match (n.as_u64(), n.as_i64()) {
            (Some(n), _) => Value::from(n),
            (None, Some(n)) => Value::from(n),
            (None, None) => Value::Null,
        },
        rmpv::Value::F32(n) => Value::from(f64::from(n)),
        rmpv::Value::F64(n) => Value::from(n),
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => Value::String(s),
            None => {
                return Err(ProtocolError::InvalidMessage(
                    "string is not valid UTF-8".into(),
                ));
            }
        },
        rmpv::Value::Binary(bytes) => bytes_to_json(bytes),
        rmpv::Value::Ext(kind, bytes) => {
            debug!(kind, len = bytes.len(), "Passing MessagePack extension through as bytes");
            bytes_to_json(bytes)
        }
        rmpv::Value::Array(items) => {
            Value::Array(items.into_iter().map(to_json).collect::<Result<_, _>>()?)
        }
        rmpv::Value::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let key = match key {
                    rmpv::Value::String(s) if s.is_str() => s.into_str().unwrap_or_default(),
                    other => other.to_string(),
                };
                map.insert(key, to_json(value)?);
            }
            Value::Object(map)
        }
    })
}

fn bytes_to_json(bytes: Vec<u8>) -> Value {
    Value::Array(bytes.into_iter().map(Value::from).collect())
}

fn optional_string(array: &[Value], index: usize) -> Result<Option<String>, ProtocolError> {
    match array.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ProtocolError::InvalidMessage(format!(
            "expected string at position {index}, found {other}"
        ))),
    }
}

fn required_string(
    array: &[Value],
    index: usize,
    field: &'static str,
) -> Result<String, ProtocolError> {
    optional_string(array, index)?.ok_or(ProtocolError::MissingField(field))
}

fn arguments_at(array: &[Value], index: usize) -> Result<Vec<Value>, ProtocolError> {
    match array.get(index) {
        Some(Value::Array(arguments)) => Ok(arguments.clone()),
        _ => Err(ProtocolError::MissingField("arguments")),
    }
}

fn string_list(values: &[Value]) -> Result<Vec<String>, ProtocolError> {
    values
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| ProtocolError::InvalidMessage(format!("expected stream id, found {v}")))
        })
        .collect()
}
