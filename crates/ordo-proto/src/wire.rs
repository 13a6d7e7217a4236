// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Packet framing and CBOR envelope helpers.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR `OpEnvelope`
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use blake3::Hasher;
use ciborium::value::Value;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{ControlOp, ControlPayload, Message, OpEnvelope, Tick};

/// Protocol magic constant "ORDO".
pub const MAGIC: [u8; 4] = *b"ORDO";
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (set to zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Header length in bytes.
pub const HEADER_BYTES: usize = 12;
/// Trailing checksum length in bytes.
pub const CHECKSUM_BYTES: usize = 32;
/// Largest payload a peer may announce.
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Framing or envelope failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the header/length announce.
    #[error("incomplete packet")]
    Incomplete,
    /// Header does not start with [`MAGIC`].
    #[error("bad magic")]
    BadMagic,
    /// Header carries an unknown [`VERSION`].
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    /// Announced payload exceeds [`MAX_PAYLOAD`].
    #[error("payload of {0} bytes exceeds limit")]
    TooLarge(usize),
    /// blake3 checksum did not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Envelope names an op this build does not know.
    #[error("unknown op {0}")]
    UnknownOp(String),
    /// CBOR encode failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR decode failure.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Encode to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

fn checksum(header: &[u8], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

/// Total packet length announced by a header, once at least
/// [`HEADER_BYTES`] are available.
pub fn frame_len(bytes: &[u8]) -> Result<Option<usize>, WireError> {
    if bytes.len() < HEADER_BYTES {
        return Ok(None);
    }
    if bytes[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(WireError::TooLarge(len));
    }
    Ok(Some(HEADER_BYTES + len + CHECKSUM_BYTES))
}

/// Wrap an `OpEnvelope` into a full packet byte vector.
pub fn encode_envelope<P: Serialize>(env: &OpEnvelope<P>) -> Result<Vec<u8>, WireError> {
    let payload = to_cbor(env)?;
    let len = u32::try_from(payload.len()).map_err(|_| WireError::TooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(HEADER_BYTES + payload.len() + CHECKSUM_BYTES);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.extend_from_slice(&FLAGS.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    let sum = checksum(&out, &payload);
    out.extend_from_slice(&payload);
    out.extend_from_slice(&sum);
    Ok(out)
}

/// Unwrap a packet, returning the envelope and bytes consumed.
pub fn decode_envelope<P: DeserializeOwned>(
    bytes: &[u8],
) -> Result<(OpEnvelope<P>, usize), WireError> {
    let total = frame_len(bytes)?.ok_or(WireError::Incomplete)?;
    if bytes.len() < total {
        return Err(WireError::Incomplete);
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let header = &bytes[..HEADER_BYTES];
    let payload = &bytes[HEADER_BYTES..total - CHECKSUM_BYTES];
    if checksum(header, payload) != bytes[total - CHECKSUM_BYTES..total] {
        return Err(WireError::ChecksumMismatch);
    }
    let env: OpEnvelope<P> = from_cbor(payload)?;
    Ok((env, total))
}

fn to_value<T: Serialize>(v: &T) -> Result<Value, WireError> {
    Value::serialized(v).map_err(|e| WireError::Encode(e.to_string()))
}

fn from_value<T: DeserializeOwned>(v: &Value) -> Result<T, WireError> {
    v.deserialized().map_err(|e| WireError::Decode(e.to_string()))
}

/// Encode a `Message` into a packet with the provided logical timestamp.
pub fn encode_message(msg: &Message, ts: Tick) -> Result<Vec<u8>, WireError> {
    let payload = match msg {
        Message::Greeting(g) => to_value(g)?,
        Message::Control(op) => to_value(&op.to_payload())?,
        Message::Data(d) => to_value(d)?,
        Message::Reflect(r) => to_value(r)?,
    };
    encode_envelope(&OpEnvelope {
        op: msg.op_name().to_string(),
        ts,
        payload,
    })
}

/// Decode bytes into (Message, ts, bytes_consumed).
pub fn decode_message(bytes: &[u8]) -> Result<(Message, Tick, usize), WireError> {
    let (env, used) = decode_envelope::<Value>(bytes)?;
    let msg = match env.op.as_str() {
        "greeting" => Message::Greeting(from_value(&env.payload)?),
        "control" => {
            let p: ControlPayload = from_value(&env.payload)?;
            Message::Control(ControlOp::from_payload(p))
        }
        "data" => Message::Data(from_value(&env.payload)?),
        "reflect" => Message::Reflect(from_value(&env.payload)?),
        other => return Err(WireError::UnknownOp(other.to_string())),
    };
    Ok((msg, env.ts, used))
}

/// Accumulates stream bytes and yields whole packets.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    acc: Vec<u8>,
}

impl FrameBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.acc.extend_from_slice(bytes);
    }

    /// Next complete packet, if one is buffered.
    pub fn next_packet(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        match frame_len(&self.acc)? {
            Some(total) if self.acc.len() >= total => Ok(Some(self.acc.drain(..total).collect())),
            _ => Ok(None),
        }
    }

    /// Bytes buffered but not yet returned.
    pub fn pending(&self) -> usize {
        self.acc.len()
    }
}

// --- Unit tests -----------------------------------------------------------
