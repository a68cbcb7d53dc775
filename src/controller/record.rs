//! Joystick record decoding
//!
//! The joystick class driver emits fixed 8-byte records:
//!
//! ```text
//! byte  0..4   timestamp in ms, big-endian u32
//! byte  4..6   value, little-endian i16
//! byte  6      type (1 = button, 2 = axis)
//! byte  7      code (control index on the device)
//! ```
//!
//! Decoding only fails on framing, never on content.

use std::fmt;

/// Size of a single record on the wire
pub const RECORD_LEN: usize = 8;

/// Type tag of a digital button record
pub const TYPE_BUTTON: u8 = 1;

/// Type tag of an analog axis record
pub const TYPE_AXIS: u8 = 2;

// Decoder errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected buffer size is {expected}, got {len}", expected = RECORD_LEN)]
    BufferLength { len: usize },
}

/// One decoded device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawEvent {
    pub timestamp_ms: u32,
    pub value: i16,
    pub type_tag: u8,
    pub code: u8,
}

impl RawEvent {
    pub fn new(timestamp_ms: u32, value: i16, type_tag: u8, code: u8) -> Self {
        Self {
            timestamp_ms,
            value,
            type_tag,
            code,
        }
    }

    /// Decode a record from exactly [`RECORD_LEN`] bytes
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let record: &[u8; RECORD_LEN] = buf
            .try_into()
            .map_err(|_| DecodeError::BufferLength { len: buf.len() })?;

        Ok(Self {
            timestamp_ms: u32::from_be_bytes([record[0], record[1], record[2], record[3]]),
            value: i16::from_le_bytes([record[4], record[5]]),
            type_tag: record[6],
            code: record[7],
        })
    }

    /// Encode the record in the wire layout accepted by [`RawEvent::decode`]
    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let ts = self.timestamp_ms.to_be_bytes();
        let value = self.value.to_le_bytes();
        [
            ts[0],
            ts[1],
            ts[2],
            ts[3],
            value[0],
            value[1],
            self.type_tag,
            self.code,
        ]
    }

    pub fn is_button(&self) -> bool {
        self.type_tag == TYPE_BUTTON
    }

    pub fn is_axis(&self) -> bool {
        self.type_tag == TYPE_AXIS
    }
}

impl fmt::Display for RawEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} code={} value={} at {}ms",
            self.type_tag, self.code, self.value, self.timestamp_ms
        )
    }
}

/// Free-function form of [`RawEvent::decode`]
pub fn decode_record(buf: &[u8]) -> Result<RawEvent, DecodeError> {
    RawEvent::decode(buf)
}
