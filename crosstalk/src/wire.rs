//! Wire protocol: envelope schema and frame codec.
//!
//! Frame format: `[length:4][body:N]`
//!
//! - **length**: Size of the JSON body in bytes (little-endian u32)
//! - **body**: One JSON-encoded [`Envelope`]
//!
//! # Envelope schema (protocol v1)
//!
//! ```json
//! { "to": "<connection identity>", "from": "<connection identity>",
//!   "payload": { "type": "REQ" | "ACK" | "loopback" | "whoami",
//!                "data": { "token": "...",
//!                          "name": "...", "args": [...],
//!                          "ret": ..., "error": "...",
//!                          "connection_id": "..." } } }
//! ```
//!
//! The schema is strict: unknown fields are rejected, `to`/`from`/`payload`
//! and `payload.type` are required. Inbound bodies that do not conform are
//! protocol violations and are dropped by the caller without tearing down
//! the stream. Framing-level problems (oversized or zero-length frames)
//! cannot be resynchronized and poison the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame header size: 4 bytes of little-endian body length.
pub const HEADER_SIZE: usize = 4;

/// Maximum frame body size (1MB).
///
/// Frames larger than this are rejected to bound memory per connection.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Request payload type.
pub const TYPE_REQ: &str = "REQ";
/// Reply payload type.
pub const TYPE_ACK: &str = "ACK";
/// Handshake probe/echo payload type.
pub const TYPE_LOOPBACK: &str = "loopback";
/// Relay-pushed identity payload type.
pub const TYPE_WHOAMI: &str = "whoami";

/// Wire codec error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Frame body exceeds [`MAX_FRAME_SIZE`]. Poisons the stream.
    #[error("frame too large: {size} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge {
        /// Body size announced by the header.
        size: usize,
    },

    /// Frame header announces a zero-length body. Poisons the stream.
    #[error("invalid frame length: 0")]
    InvalidLength,

    /// Frame body is not a conforming envelope. Isolated to the frame.
    #[error("malformed envelope: {message}")]
    MalformedEnvelope {
        /// Details from the JSON decoder.
        message: String,
    },
}

/// The routed message unit exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    /// Connection identity of the destination.
    pub to: String,
    /// Connection identity of the sender.
    pub from: String,
    /// Typed payload.
    pub payload: Payload,
}

/// Envelope payload: a type tag plus optional data fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Payload {
    /// Payload type tag (`REQ`, `ACK`, or a handshake type).
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload data; absent fields are omitted on the wire.
    #[serde(default, skip_serializing_if = "PayloadData::is_empty")]
    pub data: PayloadData,
}

/// Data carried by a payload. All fields optional; which ones are required
/// depends on the payload type and is validated at dispatch time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayloadData {
    /// Correlation token pairing a REQ with its ACK.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Name of the remote handler to invoke (REQ only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Positional arguments for the remote handler (REQ only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,

    /// Return value (ACK only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<Value>,

    /// Error indicator: set instead of `ret` when the remote handler was
    /// missing or failed (ACK only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Relay-assigned identity (whoami only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl PayloadData {
    /// True when every field is absent.
    pub fn is_empty(&self) -> bool {
        self.token.is_none()
            && self.name.is_none()
            && self.args.is_none()
            && self.ret.is_none()
            && self.error.is_none()
            && self.connection_id.is_none()
    }
}

impl Envelope {
    /// Build a REQ envelope invoking `name` on the peer at `to`.
    pub fn request(to: &str, from: &str, token: &str, name: &str, args: Vec<Value>) -> Self {
        Self {
            to: to.to_string(),
            from: from.to_string(),
            payload: Payload {
                kind: TYPE_REQ.to_string(),
                data: PayloadData {
                    token: Some(token.to_string()),
                    name: Some(name.to_string()),
                    args: Some(args),
                    ..PayloadData::default()
                },
            },
        }
    }

    /// Build a successful ACK envelope carrying the handler's return value.
    pub fn ack(to: &str, from: &str, token: &str, ret: Value) -> Self {
        Self {
            to: to.to_string(),
            from: from.to_string(),
            payload: Payload {
                kind: TYPE_ACK.to_string(),
                data: PayloadData {
                    token: Some(token.to_string()),
                    ret: Some(ret),
                    ..PayloadData::default()
                },
            },
        }
    }

    /// Build an ACK envelope carrying an error indicator.
    pub fn ack_error(to: &str, from: &str, token: &str, error: &str) -> Self {
        Self {
            to: to.to_string(),
            from: from.to_string(),
            payload: Payload {
                kind: TYPE_ACK.to_string(),
                data: PayloadData {
                    token: Some(token.to_string()),
                    error: Some(error.to_string()),
                    ..PayloadData::default()
                },
            },
        }
    }

    /// Build the handshake probe sent immediately after transport open.
    ///
    /// `to`/`from` are empty: the sender does not know its identity yet.
    pub fn probe(token: &str) -> Self {
        Self {
            to: String::new(),
            from: String::new(),
            payload: Payload {
                kind: TYPE_LOOPBACK.to_string(),
                data: PayloadData {
                    token: Some(token.to_string()),
                    ..PayloadData::default()
                },
            },
        }
    }
}

/// Encode an envelope into a length-prefixed frame.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the encoded body exceeds [`MAX_FRAME_SIZE`].
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let body = serde_json::to_vec(envelope).map_err(|e| WireError::MalformedEnvelope {
        message: e.to_string(),
    })?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: body.len() });
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Try to split one frame body off the front of `buf`.
///
/// Returns `Ok(None)` when more data is needed, or `Ok(Some((body, consumed)))`
/// where `consumed` is the total number of buffer bytes the frame occupies.
///
/// # Errors
///
/// Returns `FrameTooLarge` or `InvalidLength` when the header announces a
/// body that can never be read; the stream cannot be resynchronized after
/// either.
pub fn try_split_frame(buf: &[u8]) -> Result<Option<(&[u8], usize)>, WireError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length == 0 {
        return Err(WireError::InvalidLength);
    }
    if length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge { size: length });
    }

    let total = HEADER_SIZE + length;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((&buf[HEADER_SIZE..total], total)))
}

/// Decode a frame body into an envelope.
///
/// # Errors
///
/// Returns `MalformedEnvelope` for non-JSON bodies, missing required fields,
/// or unknown fields. The caller drops the frame and keeps the stream.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, WireError> {
    serde_json::from_slice(body).map_err(|e| WireError::MalformedEnvelope {
        message: e.to_string(),
    })
}
