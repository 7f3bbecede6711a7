//! Property frame encoding and decoding.
//!
//! Frame format:
//! - DATA (0-254 bytes): property value, dynamic values prefixed with their length
//! - CHECKSUM (1 byte): makes the byte sum of DATA ++ CHECKSUM equal 0xFF
//! - the whole block is COBS stuffed and terminated by a single 0x00
//!
//! Two special frames exist. An empty frame (nothing before the terminator)
//! is sent by a node that could not produce its value. A placeholder frame
//! carries only zero bytes, including the checksum: it keeps a slot in a
//! per-node write without touching the node, and can never be mistaken for
//! data because its sum is not the sentinel.

use heapless::Vec;

use crate::cobs::{self, CobsError};
use crate::{PAYLOAD_SIZE_MAX, PROPERTY_SIZE_MAX};

/// Byte sum of a valid frame body including its checksum
pub const CHECKSUM_SENTINEL: u8 = 0xFF;

/// Decoded property bytes
pub type PropertyBuf = Vec<u8, PROPERTY_SIZE_MAX>;

/// Encoded frame bytes, terminator included
pub type PayloadBuf = Vec<u8, PAYLOAD_SIZE_MAX>;

/// Errors that can occur during frame encoding or decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Property value exceeds maximum allowed size
    PayloadTooLarge,
    /// Checksum does not add up to the sentinel
    InvalidChecksum,
    /// Byte stuffing is malformed
    Cobs(CobsError),
    /// Frame exceeds the maximum payload size before its terminator
    Overflow,
}

impl From<CobsError> for FrameError {
    fn from(e: CobsError) -> Self {
        FrameError::Cobs(e)
    }
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::PayloadTooLarge => write!(f, "property value too large"),
            FrameError::InvalidChecksum => write!(f, "frame checksum invalid"),
            FrameError::Cobs(e) => write!(f, "{}", e),
            FrameError::Overflow => write!(f, "frame exceeds maximum size"),
        }
    }
}

/// Checksum byte to append to `data`
pub fn checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    CHECKSUM_SENTINEL.wrapping_sub(sum)
}

/// Verify a body that already ends with its checksum byte
pub fn checksum_valid(data_with_checksum: &[u8]) -> bool {
    let sum = data_with_checksum
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    sum == CHECKSUM_SENTINEL
}

/// Append the checksum to `data` and byte-stuff the result
pub fn encode_frame(data: &[u8]) -> Result<PayloadBuf, FrameError> {
    if data.len() > PROPERTY_SIZE_MAX {
        return Err(FrameError::PayloadTooLarge);
    }

    let mut body = [0u8; PROPERTY_SIZE_MAX + 1];
    body[..data.len()].copy_from_slice(data);
    body[data.len()] = checksum(data);

    stuff(&body[..data.len() + 1])
}

/// Build the do-nothing frame for a value of `len` bytes
pub fn encode_placeholder(len: usize) -> Result<PayloadBuf, FrameError> {
    if len > PROPERTY_SIZE_MAX {
        return Err(FrameError::PayloadTooLarge);
    }
    let body = [0u8; PROPERTY_SIZE_MAX + 1];
    stuff(&body[..len + 1])
}

fn stuff(body: &[u8]) -> Result<PayloadBuf, FrameError> {
    let mut out = [0u8; PAYLOAD_SIZE_MAX];
    let len = cobs::encode(&mut out, body)?;
    let mut frame = PayloadBuf::new();
    frame
        .extend_from_slice(&out[..len])
        .map_err(|_| FrameError::Overflow)?;
    Ok(frame)
}

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// A node had nothing to send
    Empty,
    /// Do-nothing slot of a per-node write
    Placeholder,
    /// Verified property bytes with the checksum stripped
    Data(PropertyBuf),
}

/// Unstuff a terminated frame and verify it
pub fn decode_frame(encoded: &[u8]) -> Result<DecodedFrame, FrameError> {
    let mut body = [0u8; PAYLOAD_SIZE_MAX];
    let len = cobs::decode(&mut body, encoded)?;
    let body = &body[..len];

    if body.is_empty() {
        return Ok(DecodedFrame::Empty);
    }
    if body.iter().all(|&b| b == 0) {
        return Ok(DecodedFrame::Placeholder);
    }
    if !checksum_valid(body) {
        return Err(FrameError::InvalidChecksum);
    }

    let mut data = PropertyBuf::new();
    data.extend_from_slice(&body[..len - 1])
        .map_err(|_| FrameError::PayloadTooLarge)?;
    Ok(DecodedFrame::Data(data))
}

/// Collects bus bytes until a frame terminator arrives
#[derive(Debug, Clone, Default)]
pub struct FrameAccumulator {
    buffer: PayloadBuf,
    complete: bool,
}

impl FrameAccumulator {
    /// Create a new empty accumulator
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            complete: false,
        }
    }

    /// Reset to initial state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.complete = false;
    }

    /// Feed a single byte
    ///
    /// Returns `Ok(true)` once the terminator has been stored. Feeding after
    /// completion starts a new frame.
    pub fn feed(&mut self, byte: u8) -> Result<bool, FrameError> {
        if self.complete {
            self.reset();
        }
        if self.buffer.push(byte).is_err() {
            self.reset();
            return Err(FrameError::Overflow);
        }
        self.complete = byte == 0;
        Ok(self.complete)
    }

    /// Number of bytes collected for the current frame
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Bytes of the current frame, terminator included once complete
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Decode the completed frame
    pub fn decode(&self) -> Result<DecodedFrame, FrameError> {
        decode_frame(&self.buffer)
    }
}
