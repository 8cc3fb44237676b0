//! Frame codec: 4-byte big-endian length prefix + payload.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ProtocolError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum accepted payload length per frame (1 MiB).
///
/// A received length above this is a protocol violation: the peer is either
/// corrupt or hostile, and the channel must be closed.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Prepend the 4-byte big-endian length prefix to a payload.
///
/// Fails if the payload cannot be represented as a non-negative int32.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > i32::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: i32::MAX as usize,
        });
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    BigEndian::write_u32(&mut prefix, payload.len() as u32);
    buf.extend_from_slice(&prefix);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a 4-byte length prefix into a payload length.
///
/// Fails if the input is not exactly 4 bytes or the sign bit is set
/// (lengths are non-negative int32 on the wire).
pub fn parse_length(prefix: &[u8]) -> Result<usize> {
    if prefix.len() != LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::LengthPrefixSize {
            expected: LENGTH_PREFIX_SIZE,
            got: prefix.len(),
        });
    }

    let raw = BigEndian::read_i32(prefix);
    if raw < 0 {
        return Err(ProtocolError::NegativeLength(raw));
    }
    Ok(raw as usize)
}

/// Extract the payload from a complete frame.
///
/// Fails if the buffer is shorter than the prefix, the declared length is
/// negative, or prefix + payload does not exactly fill the buffer.
pub fn unframe(buffer: &[u8]) -> Result<&[u8]> {
    if buffer.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::FrameTooShort { got: buffer.len() });
    }

    let declared = parse_length(&buffer[..LENGTH_PREFIX_SIZE])?;
    let actual = buffer.len() - LENGTH_PREFIX_SIZE;
    if declared != actual {
        return Err(ProtocolError::LengthMismatch { declared, actual });
    }

    Ok(&buffer[LENGTH_PREFIX_SIZE..])
}

/// True iff `unframe` would succeed on this buffer. Never errors.
pub fn is_valid_frame(buffer: &[u8]) -> bool {
    unframe(buffer).is_ok()
}
