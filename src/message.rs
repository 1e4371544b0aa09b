// src/message.rs

//! Wire framing and method-call payload encoding.
//!
//! Every frame is exactly 12 + N bytes: three little-endian u32 words (type,
//! session id, body length) followed by N bytes of body. The framing is
//! deliberately minimal so that Qt local-socket peers can speak it without a
//! Rust toolchain on their side.
//!
//! Method-call bodies are MessagePack maps with string keys `path`, `method`
//! and `params`. `path` and `method` are omitted when empty (return frames
//! carry only `params`). Some encoders emit strings as raw byte sequences;
//! decoding folds those back to native strings so cross-language peers
//! interoperate.

use bytes::{BufMut, Bytes, BytesMut};
use rmpv::Value;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Size of the fixed frame header in bytes.
pub(crate) const HEADER_LEN: usize = 12;

/// Ceiling on the declared body length of a single frame (16 MiB).
///
/// A peer announcing more than this is treated as a protocol error and the
/// connection is dropped before any allocation happens.
pub(crate) const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Message type tags carried in the first header word.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Generic success.
    ResultOk = 0x01,
    /// Generic failure.
    ResultNg = 0x02,
    /// No object is published at the requested path.
    ResultObjectNotFound = 0x03,
    /// The path resolved but the method does not exist.
    ResultMethodNotFound = 0x04,
    /// The method raised while it was being called.
    ResultMethodError = 0x05,
    /// A plugin identifies itself to the host.
    ConnectClient = 0x10,
    /// Orderly disconnect, either direction.
    CloseClient = 0x11,
    /// Query whether a path resolves at the peer.
    ConfirmPath = 0x20,
    /// Claim a path in the shared namespace.
    Publish = 0x21,
    /// Release a path (collision resolution or voluntary).
    Unpublish = 0x22,
    /// Remote method invocation.
    CallMethod = 0x30,
    /// Successful return of a remote invocation.
    ReturnMethod = 0x31,
}

impl MessageType {
    /// Convert from a u32 wire value. Returns `None` for anything outside
    /// the closed set.
    pub fn from_u32(val: u32) -> Option<Self> {
        Some(match val {
            0x01 => MessageType::ResultOk,
            0x02 => MessageType::ResultNg,
            0x03 => MessageType::ResultObjectNotFound,
            0x04 => MessageType::ResultMethodNotFound,
            0x05 => MessageType::ResultMethodError,
            0x10 => MessageType::ConnectClient,
            0x11 => MessageType::CloseClient,
            0x20 => MessageType::ConfirmPath,
            0x21 => MessageType::Publish,
            0x22 => MessageType::Unpublish,
            0x30 => MessageType::CallMethod,
            0x31 => MessageType::ReturnMethod,
            _ => return None,
        })
    }

    /// Convert to u32 for wire transmission.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Result-family frames are delivered into the session manager and never
    /// spawn work of their own.
    pub fn is_result(self) -> bool {
        matches!(
            self,
            MessageType::ResultOk
                | MessageType::ResultNg
                | MessageType::ResultObjectNotFound
                | MessageType::ResultMethodNotFound
                | MessageType::ResultMethodError
                | MessageType::ReturnMethod
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::ResultOk => "ResultOK",
            MessageType::ResultNg => "ResultNG",
            MessageType::ResultObjectNotFound => "ResultObjectNotFound",
            MessageType::ResultMethodNotFound => "ResultMethodNotFound",
            MessageType::ResultMethodError => "ResultMethodError",
            MessageType::ConnectClient => "ConnectClient",
            MessageType::CloseClient => "CloseClient",
            MessageType::ConfirmPath => "ConfirmPath",
            MessageType::Publish => "Publish",
            MessageType::Unpublish => "Unpublish",
            MessageType::CallMethod => "CallMethod",
            MessageType::ReturnMethod => "ReturnMethod",
        };
        write!(f, "{} (0x{:02x})", name, self.as_u32())
    }
}

/// One unit of wire traffic.
#[derive(Debug, Clone)]
pub(crate) struct Message {
    pub(crate) kind: MessageType,
    pub(crate) session: u32,
    pub(crate) body: Bytes,
}

/// Outcome of reading one frame from a stream.
pub(crate) enum Inbound {
    /// A complete frame.
    Frame(Message),
    /// The stream ended cleanly on a frame boundary.
    Eof,
}

/// Encode a frame header plus body. Pure.
pub(crate) fn archive(kind: MessageType, session: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u32_le(kind.as_u32());
    buf.put_u32_le(session);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Read exactly one frame, blocking.
///
/// EOF on a frame boundary is a clean close; EOF anywhere inside a frame is
/// a transport error. An unknown type tag or an oversized body declaration
/// is a protocol error and the caller is expected to drop the connection.
pub(crate) async fn parse<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Inbound> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(Inbound::Eof);
            }
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            )));
        }
        filled += n;
    }

    let raw_kind = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let session = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let body_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;

    let kind = MessageType::from_u32(raw_kind)
        .ok_or_else(|| Error::encoding(format!("unknown message type 0x{:x}", raw_kind)))?;
    if body_len > MAX_BODY_LEN {
        return Err(Error::encoding(format!(
            "declared body length {} exceeds the {} byte ceiling",
            body_len, MAX_BODY_LEN
        )));
    }

    let body = if body_len > 0 {
        let mut buf = vec![0u8; body_len];
        reader.read_exact(&mut buf).await.map_err(|e| {
            Error::Transport(std::io::Error::new(e.kind(), "stream ended inside a frame body"))
        })?;
        Bytes::from(buf)
    } else {
        Bytes::new()
    };

    Ok(Inbound::Frame(Message { kind, session, body }))
}

/// Decoded method-call payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MethodCall {
    pub(crate) path: String,
    pub(crate) method: String,
    pub(crate) params: Vec<Value>,
}

const KEY_PATH: &str = "path";
const KEY_METHOD: &str = "method";
const KEY_PARAMS: &str = "params";

/// Serialize a method-call payload and wrap it in a frame.
///
/// `path` and `method` are omitted from the map when empty, which is how
/// return frames are encoded.
pub(crate) fn archive_method_call(
    kind: MessageType,
    session: u32,
    path: &str,
    method: &str,
    params: &[Value],
) -> Result<Bytes> {
    let mut fields: Vec<(Value, Value)> = Vec::with_capacity(3);
    if !path.is_empty() {
        fields.push((Value::from(KEY_PATH), Value::from(path)));
    }
    if !method.is_empty() {
        fields.push((Value::from(KEY_METHOD), Value::from(method)));
    }
    fields.push((Value::from(KEY_PARAMS), Value::Array(params.to_vec())));

    let mut body = Vec::new();
    rmpv::encode::write_value(&mut body, &Value::Map(fields)).map_err(Error::encoding)?;
    Ok(archive(kind, session, &body))
}

/// Decode a method-call payload.
///
/// Absent `path`/`method` decode as empty strings; unknown keys are ignored.
pub(crate) fn parse_method_call(body: &[u8]) -> Result<MethodCall> {
    let mut reader = body;
    let value = rmpv::decode::read_value(&mut reader).map_err(Error::encoding)?;
    let Value::Map(entries) = value else {
        return Err(Error::encoding("method call payload is not a map"));
    };

    let mut call = MethodCall {
        path: String::new(),
        method: String::new(),
        params: Vec::new(),
    };
    for (key, val) in entries {
        match text_of(&key) {
            Some(KEY_PATH) => {
                call.path = text_of(&val)
                    .ok_or_else(|| Error::encoding("'path' is not a string"))?
                    .to_owned();
            }
            Some(KEY_METHOD) => {
                call.method = text_of(&val)
                    .ok_or_else(|| Error::encoding("'method' is not a string"))?
                    .to_owned();
            }
            Some(KEY_PARAMS) => {
                let Value::Array(params) = val else {
                    return Err(Error::encoding("'params' is not a sequence"));
                };
                call.params = params;
            }
            _ => {}
        }
    }
    Ok(call)
}

/// Text view of a value, accepting both str-typed and raw-encoded strings.
/// Old-format MessagePack encoders have no str/bin distinction.
fn text_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => s.as_str(),
        Value::Binary(b) => std::str::from_utf8(b).ok(),
        _ => None,
    }
}
