//! Consistent Overhead Byte Stuffing
//!
//! Removes every zero byte from a block so a single `0x00` can delimit
//! frames on the bus. Encoded frames always end with that terminator and
//! [`decode`] expects it to be present.

/// Errors from stuffing or unstuffing a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CobsError {
    /// Destination cannot hold the result
    BufferTooSmall,
    /// Input does not end with the frame terminator
    MissingTerminator,
    /// A code byte is zero or points past the end of the frame
    Malformed,
}

impl core::fmt::Display for CobsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CobsError::BufferTooSmall => write!(f, "COBS buffer too small"),
            CobsError::MissingTerminator => write!(f, "COBS frame not terminated"),
            CobsError::Malformed => write!(f, "malformed COBS frame"),
        }
    }
}

/// Worst case encoded size of `len` bytes, terminator included
pub const fn max_encoded_len(len: usize) -> usize {
    len + len / 254 + 2
}

/// Encode `src` into `dst`, appending the zero terminator
///
/// Returns the number of bytes written. `dst` must be able to hold the worst
/// case of [`max_encoded_len`] regardless of the actual content.
pub fn encode(dst: &mut [u8], src: &[u8]) -> Result<usize, CobsError> {
    if dst.len() < max_encoded_len(src.len()) {
        return Err(CobsError::BufferTooSmall);
    }

    let mut code_index = 0;
    let mut write_index = 1;
    let mut code: u8 = 1;

    for &byte in src {
        if byte == 0 {
            dst[code_index] = code;
            code_index = write_index;
            write_index += 1;
            code = 1;
        } else {
            dst[write_index] = byte;
            write_index += 1;
            code += 1;
            if code == 0xFF {
                dst[code_index] = code;
                code_index = write_index;
                write_index += 1;
                code = 1;
            }
        }
    }

    dst[code_index] = code;
    dst[write_index] = 0;
    Ok(write_index + 1)
}

/// Decode a terminated frame from `src` into `dst`
///
/// Returns the number of decoded bytes.
pub fn decode(dst: &mut [u8], src: &[u8]) -> Result<usize, CobsError> {
    let end = match src.split_last() {
        Some((&0, _)) => src.len() - 1,
        _ => return Err(CobsError::MissingTerminator),
    };

    let mut read_index = 0;
    let mut write_index = 0;

    while read_index < end {
        let code = src[read_index] as usize;
        read_index += 1;
        if code == 0 || read_index + code - 1 > end {
            return Err(CobsError::Malformed);
        }

        let block = &src[read_index..read_index + code - 1];
        dst.get_mut(write_index..write_index + block.len())
            .ok_or(CobsError::BufferTooSmall)?
            .copy_from_slice(block);
        write_index += block.len();
        read_index += block.len();

        if code != 0xFF && read_index < end {
            *dst.get_mut(write_index).ok_or(CobsError::BufferTooSmall)? = 0;
            write_index += 1;
        }
    }

    Ok(write_index)
}
