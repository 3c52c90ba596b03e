//! Protobuf wire-format codec for the agent messages.
//!
//! Hand-written tag-length-value encoding for the three message shapes,
//! avoiding codegen while staying byte-compatible with protoc stubs.
//! Field numbers:
//!
//! - `TaskRequest`: task_id=1, skill=2, input=3, metadata=4 (repeated
//!   nested entries with key=1, value=2)
//! - `TaskEvent`: task_id=1, type=2, payload=3
//! - `HealthResponse`: status=1, agent_name=2
//!
//! Empty string fields are omitted on encode and re-materialize as empty
//! on decode. Unknown field numbers are skipped. Decoding is total: any
//! byte sequence yields either a message or a [`WireError`], never a panic.

use bytes::BufMut;

use super::types::{Empty, HealthResponse, TaskEvent, TaskRequest};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Decode failure. Carries enough context to debug a misbehaving agent.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated varint")]
    TruncatedVarint,

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("invalid field tag")]
    InvalidTag,

    #[error("truncated field {field}")]
    TruncatedField { field: u32 },

    #[error("unsupported wire type {wire_type} for field {field}")]
    UnsupportedWireType { field: u32, wire_type: u8 },

    #[error("invalid utf-8 in field {field}")]
    InvalidUtf8 { field: u32 },
}

/// A message that knows its own wire layout.
pub trait WireMessage: Default + Send + Sync + 'static {
    fn encode_into(&self, buf: &mut impl BufMut);
    fn decode(data: &[u8]) -> Result<Self, WireError>;

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }
}

impl WireMessage for TaskRequest {
    fn encode_into(&self, buf: &mut impl BufMut) {
        put_string(buf, 1, &self.task_id);
        put_string(buf, 2, &self.skill);
        put_string(buf, 3, &self.input);
        for (key, value) in &self.metadata {
            let mut entry = Vec::new();
            put_string(&mut entry, 1, key);
            put_string(&mut entry, 2, value);
            put_len_field(buf, 4, &entry);
        }
    }

    fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut msg = TaskRequest::default();
        let mut cursor = data;
        let data = &mut cursor;
        while !data.is_empty() {
            let (field, wire_type) = read_tag(data)?;
            match (field, wire_type) {
                (1, WIRE_LEN) => msg.task_id = read_string(data, field)?,
                (2, WIRE_LEN) => msg.skill = read_string(data, field)?,
                (3, WIRE_LEN) => msg.input = read_string(data, field)?,
                (4, WIRE_LEN) => {
                    let entry = read_len_delimited(data, field)?;
                    let (key, value) = decode_map_entry(entry)?;
                    msg.metadata.insert(key, value);
                }
                _ => skip_field(data, field, wire_type)?,
            }
        }
        Ok(msg)
    }
}

impl WireMessage for TaskEvent {
    fn encode_into(&self, buf: &mut impl BufMut) {
        put_string(buf, 1, &self.task_id);
        put_string(buf, 2, &self.event_type);
        put_string(buf, 3, &self.payload);
    }

    fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut msg = TaskEvent::default();
        let mut cursor = data;
        let data = &mut cursor;
        while !data.is_empty() {
            let (field, wire_type) = read_tag(data)?;
            match (field, wire_type) {
                (1, WIRE_LEN) => msg.task_id = read_string(data, field)?,
                (2, WIRE_LEN) => msg.event_type = read_string(data, field)?,
                (3, WIRE_LEN) => msg.payload = read_string(data, field)?,
                _ => skip_field(data, field, wire_type)?,
            }
        }
        Ok(msg)
    }
}

impl WireMessage for HealthResponse {
    fn encode_into(&self, buf: &mut impl BufMut) {
        put_string(buf, 1, &self.status);
        put_string(buf, 2, &self.agent_name);
    }

    fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut msg = HealthResponse::default();
        let mut cursor = data;
        let data = &mut cursor;
        while !data.is_empty() {
            let (field, wire_type) = read_tag(data)?;
            match (field, wire_type) {
                (1, WIRE_LEN) => msg.status = read_string(data, field)?,
                (2, WIRE_LEN) => msg.agent_name = read_string(data, field)?,
                _ => skip_field(data, field, wire_type)?,
            }
        }
        Ok(msg)
    }
}

impl WireMessage for Empty {
    fn encode_into(&self, _buf: &mut impl BufMut) {}

    // Tolerates (and discards) any payload, like google.protobuf.Empty.
    fn decode(_data: &[u8]) -> Result<Self, WireError> {
        Ok(Empty)
    }
}

// --- encode helpers ---

fn put_uvarint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn put_len_field(buf: &mut impl BufMut, field: u32, data: &[u8]) {
    put_uvarint(buf, (u64::from(field) << 3) | u64::from(WIRE_LEN));
    put_uvarint(buf, data.len() as u64);
    buf.put_slice(data);
}

// Empty strings are omitted entirely; the peer's decoder restores "".
fn put_string(buf: &mut impl BufMut, field: u32, value: &str) {
    if value.is_empty() {
        return;
    }
    put_len_field(buf, field, value.as_bytes());
}

// --- decode helpers ---
//
// Each helper takes a `&mut &[u8]` cursor and advances it past what it
// consumed.

fn read_uvarint(data: &mut &[u8]) -> Result<u64, WireError> {
    let bytes = *data;
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(WireError::VarintOverflow);
        }
        // The tenth byte may only carry the top bit of a u64.
        if shift == 63 && byte & 0x7e != 0 {
            return Err(WireError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            *data = &bytes[i + 1..];
            return Ok(value);
        }
        shift += 7;
    }
    Err(WireError::TruncatedVarint)
}

fn read_tag(data: &mut &[u8]) -> Result<(u32, u8), WireError> {
    let tag = read_uvarint(data)?;
    let field = tag >> 3;
    if field == 0 || field > u64::from(u32::MAX) {
        return Err(WireError::InvalidTag);
    }
    Ok((field as u32, (tag & 0x7) as u8))
}

fn read_len_delimited<'a>(data: &mut &'a [u8], field: u32) -> Result<&'a [u8], WireError> {
    let len = read_uvarint(data)?;
    let bytes = *data;
    if len > bytes.len() as u64 {
        return Err(WireError::TruncatedField { field });
    }
    let (value, rest) = bytes.split_at(len as usize);
    *data = rest;
    Ok(value)
}

fn read_string(data: &mut &[u8], field: u32) -> Result<String, WireError> {
    let raw = read_len_delimited(data, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8 { field })
}

/// Skip a field of any known wire type. Group wire types (3 and 4) are
/// deprecated and never produced by modern toolchains; they decode-error.
fn skip_field(data: &mut &[u8], field: u32, wire_type: u8) -> Result<(), WireError> {
    match wire_type {
        WIRE_VARINT => {
            read_uvarint(data)?;
        }
        WIRE_FIXED64 => {
            let bytes = *data;
            if bytes.len() < 8 {
                return Err(WireError::TruncatedField { field });
            }
            *data = &bytes[8..];
        }
        WIRE_LEN => {
            read_len_delimited(data, field)?;
        }
        WIRE_FIXED32 => {
            let bytes = *data;
            if bytes.len() < 4 {
                return Err(WireError::TruncatedField { field });
            }
            *data = &bytes[4..];
        }
        other => return Err(WireError::UnsupportedWireType { field, wire_type: other }),
    }
    Ok(())
}

fn decode_map_entry(entry: &[u8]) -> Result<(String, String), WireError> {
    let mut key = String::new();
    let mut value = String::new();
    let mut cursor = entry;
    let data = &mut cursor;
    while !data.is_empty() {
        let (field, wire_type) = read_tag(data)?;
        match (field, wire_type) {
            (1, WIRE_LEN) => key = read_string(data, field)?,
            (2, WIRE_LEN) => value = read_string(data, field)?,
            _ => skip_field(data, field, wire_type)?,
        }
    }
    Ok((key, value))
}
