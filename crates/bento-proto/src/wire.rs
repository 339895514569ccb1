// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Packet framing and CBOR helpers.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR [`OpEnvelope`]
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use blake3::Hasher;
use ciborium::value::Value as Cbor;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{ActionPayload, EmitPayload, InitPayload, Message, OpEnvelope};

/// Protocol magic constant "BNT!".
pub const MAGIC: [u8; 4] = [0x42, 0x4e, 0x54, 0x21];
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Header bytes preceding the payload.
pub const HEADER_LEN: usize = 12;
/// Trailing checksum bytes.
pub const CHECKSUM_LEN: usize = 32;
/// Largest payload a peer may send.
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Framing or codec failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the header announces.
    #[error("incomplete packet: need {needed} bytes, have {have}")]
    Incomplete {
        /// Total bytes the packet requires.
        needed: usize,
        /// Bytes available.
        have: usize,
    },
    /// Header does not start with [`MAGIC`].
    #[error("bad magic")]
    BadMagic,
    /// Header carries a version this build does not speak.
    #[error("unsupported version {0:#06x}")]
    UnsupportedVersion(u16),
    /// Announced payload exceeds [`MAX_PAYLOAD`].
    #[error("payload of {0} bytes exceeds limit")]
    TooLarge(usize),
    /// Checksum does not match header and payload.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Envelope names an operation this build does not know.
    #[error("unknown op {0}")]
    UnknownOp(String),
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR decoding failed.
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

/// Validates a packet header and returns the full packet length it announces.
///
/// Stream readers call this once [`HEADER_LEN`] bytes are buffered to learn
/// how many bytes make up the frame.
pub fn packet_len(header: &[u8]) -> Result<usize, WireError> {
    if header.len() < HEADER_LEN {
        return Err(WireError::Incomplete {
            needed: HEADER_LEN,
            have: header.len(),
        });
    }
    if header[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let announced = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let len = usize::try_from(announced).map_err(|_| WireError::TooLarge(usize::MAX))?;
    if len > MAX_PAYLOAD {
        return Err(WireError::TooLarge(len));
    }
    Ok(HEADER_LEN + len + CHECKSUM_LEN)
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw header.
    pub header: [u8; HEADER_LEN],
    /// CBOR payload bytes.
    pub payload: Vec<u8>,
    /// blake3 checksum over header||payload.
    pub checksum: [u8; CHECKSUM_LEN],
}

impl Packet {
    /// Build a packet from a CBOR payload.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self, WireError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::TooLarge(payload.len()));
        }
        let len = u32::try_from(payload.len()).map_err(|_| WireError::TooLarge(payload.len()))?;
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
        header[8..12].copy_from_slice(&len.to_be_bytes());
        let checksum = digest(&header, &payload);
        Ok(Packet {
            header,
            payload,
            checksum,
        })
    }

    /// Concatenated wire bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum);
        out
    }

    /// Encode an envelope into packet bytes.
    pub fn encode_envelope<P: Serialize>(env: &OpEnvelope<P>) -> Result<Vec<u8>, WireError> {
        Ok(Packet::from_payload(to_cbor(env)?)?.into_bytes())
    }

    /// Decode a packet from the front of `bytes`, returning the envelope and
    /// bytes consumed.
    pub fn decode_envelope<P: DeserializeOwned>(
        bytes: &[u8],
    ) -> Result<(OpEnvelope<P>, usize), WireError> {
        let total = packet_len(bytes)?;
        if bytes.len() < total {
            return Err(WireError::Incomplete {
                needed: total,
                have: bytes.len(),
            });
        }
        let body_end = total - CHECKSUM_LEN;
        let header = &bytes[..HEADER_LEN];
        let payload = &bytes[HEADER_LEN..body_end];
        if digest(header, payload)[..] != bytes[body_end..total] {
            return Err(WireError::ChecksumMismatch);
        }
        Ok((from_cbor(payload)?, total))
    }
}

fn digest(header: &[u8], payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

fn to_value<T: Serialize>(value: &T) -> Result<Cbor, WireError> {
    Cbor::serialized(value).map_err(|e| WireError::Encode(e.to_string()))
}

fn from_value<T: DeserializeOwned>(value: &Cbor) -> Result<T, WireError> {
    value
        .deserialized()
        .map_err(|e| WireError::Decode(e.to_string()))
}

/// Encode a [`Message`] into a packet with the provided logical timestamp.
pub fn encode_message(msg: &Message, ts: u64) -> Result<Vec<u8>, WireError> {
    let payload = match msg {
        Message::Init { scopes } => to_value(&InitPayload {
            scopes: scopes.clone(),
        })?,
        Message::Action { name, payload } => to_value(&ActionPayload {
            name: name.clone(),
            payload: payload.clone(),
        })?,
        Message::Emit { patches } => to_value(&EmitPayload {
            patches: patches.clone(),
        })?,
        Message::Error(err) => to_value(err)?,
    };
    Packet::encode_envelope(&OpEnvelope {
        op: msg.op().to_owned(),
        ts,
        payload,
    })
}

/// Decode bytes into `(Message, ts, bytes_consumed)`.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, u64, usize), WireError> {
    let (env, used) = Packet::decode_envelope::<Cbor>(bytes)?;
    let msg = match env.op.as_str() {
        "init" => {
            let p: InitPayload = from_value(&env.payload)?;
            Message::Init { scopes: p.scopes }
        }
        "action" => {
            let p: ActionPayload = from_value(&env.payload)?;
            Message::Action {
                name: p.name,
                payload: p.payload,
            }
        }
        "emit" => {
            let p: EmitPayload = from_value(&env.payload)?;
            Message::Emit { patches: p.patches }
        }
        "error" => Message::Error(from_value(&env.payload)?),
        other => return Err(WireError::UnknownOp(other.to_owned())),
    };
    Ok((msg, env.ts, used))
}
