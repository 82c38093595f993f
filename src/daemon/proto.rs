//! Wire protocol codec.
//!
//! Frames are MessagePack arrays, one per logical call. Requests are
//! `[0, msgid, method, params]` (a 5th metadata element may appear on the
//! TLS transport when enabled); responses are `[1, msgid, error, result]`
//! with exactly one of error/result non-nil and the msgid echoed.
//!
//! The decoder is streaming: bytes accumulate in a per-connection buffer,
//! complete frames drain in a loop, partial frames wait for more input.
//! The buffer has a hard cap; exceeding it is fatal for the connection.

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use rmpv::Value;
use thiserror::Error;

use crate::store::record;

const REQUEST_TAG: i64 = 0;
const RESPONSE_TAG: i64 = 1;

/// Hard floor and ceiling for the configurable buffer cap.
pub const MIN_BUFFER_CAP: usize = 1 << 20;
pub const MAX_BUFFER_CAP: usize = 16 << 20;
pub const DEFAULT_BUFFER_CAP: usize = 4 << 20;

/// One decoded request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub msgid: i64,
    pub method: String,
    pub params: Vec<Value>,
    /// Present only on 5-element frames. Transport policy is enforced by the
    /// connection handler, not here.
    pub metadata: Option<Value>,
}

#[derive(Error, Debug)]
pub enum ProtoError {
    /// The connection buffered more than the cap without completing a frame.
    #[error("frame buffer exceeded {cap} bytes")]
    BufferOverflow { cap: usize },

    /// Bytes that are not a MessagePack value, or a value that is not
    /// recognisably a request. Fatal for the connection.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A well-formed MessagePack value with the wrong frame shape, but with
    /// a recoverable msgid: answered with an error, connection continues.
    #[error("invalid request frame (msgid {msgid})")]
    InvalidRequest { msgid: i64 },
}

impl ProtoError {
    /// The wire error name, where one can still be sent.
    pub fn code(&self) -> &'static str {
        match self {
            ProtoError::BufferOverflow { .. } => "buffer_overflow",
            ProtoError::Malformed(_) => "protocol_error",
            ProtoError::InvalidRequest { .. } => "invalid_request",
        }
    }

    /// Fatal errors terminate the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtoError::InvalidRequest { .. })
    }
}

/// Streaming request decoder with a hard buffer cap.
pub struct FrameDecoder {
    buf: BytesMut,
    cap: usize,
}

impl FrameDecoder {
    pub fn new(cap: usize) -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::new(),
            cap: cap.clamp(MIN_BUFFER_CAP, MAX_BUFFER_CAP),
        }
    }

    /// Append received bytes. Fails (fatally) when the buffer would exceed
    /// the cap; nothing is buffered in that case.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<(), ProtoError> {
        if self.buf.len() + chunk.len() > self.cap {
            return Err(ProtoError::BufferOverflow { cap: self.cap });
        }
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    /// Try to decode one frame. `Ok(None)` means the buffer holds no
    /// complete frame yet.
    pub fn next_frame(&mut self) -> Result<Option<RequestFrame>, ProtoError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buf[..]);
        let value = match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => value,
            Err(e) if is_incomplete(&e) => return Ok(None),
            Err(e) => return Err(ProtoError::Malformed(e.to_string())),
        };
        let consumed = cursor.position() as usize;
        self.buf.advance(consumed);
        parse_frame(value).map(Some)
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io)
        | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

fn parse_frame(value: Value) -> Result<RequestFrame, ProtoError> {
    let Value::Array(mut parts) = value else {
        return Err(ProtoError::Malformed("frame is not an array".into()));
    };
    // A recoverable msgid lets us answer instead of dropping the connection.
    let msgid = parts.get(1).and_then(Value::as_i64);

    if !(4..=5).contains(&parts.len()) {
        return match msgid {
            Some(msgid) => Err(ProtoError::InvalidRequest { msgid }),
            None => Err(ProtoError::Malformed(format!(
                "frame has {} elements",
                parts.len()
            ))),
        };
    }
    let Some(msgid) = msgid else {
        return Err(ProtoError::Malformed("msgid is not an integer".into()));
    };
    if parts[0].as_i64() != Some(REQUEST_TAG) {
        return Err(ProtoError::InvalidRequest { msgid });
    }

    let metadata = if parts.len() == 5 {
        let meta = parts.remove(4);
        if !matches!(meta, Value::Map(_)) {
            return Err(ProtoError::InvalidRequest { msgid });
        }
        Some(meta)
    } else {
        None
    };

    let params = match parts.remove(3) {
        Value::Array(params) => params,
        _ => return Err(ProtoError::InvalidRequest { msgid }),
    };
    let method = match parts.remove(2) {
        Value::String(s) => match s.into_str() {
            Some(method) => method,
            None => return Err(ProtoError::InvalidRequest { msgid }),
        },
        _ => return Err(ProtoError::InvalidRequest { msgid }),
    };

    Ok(RequestFrame {
        msgid,
        method,
        params,
        metadata,
    })
}

/// Encode a success response. The value is normalized first so nothing
/// binary-unsafe escapes.
pub fn encode_result(msgid: i64, result: Value) -> Result<Vec<u8>, ProtoError> {
    encode_response(msgid, Value::Nil, record::normalize(result))
}

/// Encode an error response carrying a taxonomy name.
pub fn encode_error(msgid: i64, code: &str) -> Result<Vec<u8>, ProtoError> {
    encode_response(msgid, Value::String(code.into()), Value::Nil)
}

fn encode_response(msgid: i64, error: Value, result: Value) -> Result<Vec<u8>, ProtoError> {
    let frame = Value::Array(vec![
        Value::Integer(RESPONSE_TAG.into()),
        Value::Integer(msgid.into()),
        error,
        result,
    ]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &frame)
        .map_err(|e| ProtoError::Malformed(format!("response encode: {e}")))?;
    Ok(buf)
}

/// Encode a request frame (client side: tests, node-to-node calls).
pub fn encode_request(frame: &RequestFrame) -> Result<Vec<u8>, ProtoError> {
    let mut parts = vec![
        Value::Integer(REQUEST_TAG.into()),
        Value::Integer(frame.msgid.into()),
        Value::String(frame.method.clone().into()),
        Value::Array(frame.params.clone()),
    ];
    if let Some(metadata) = &frame.metadata {
        parts.push(metadata.clone());
    }
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &Value::Array(parts))
        .map_err(|e| ProtoError::Malformed(format!("request encode: {e}")))?;
    Ok(buf)
}
