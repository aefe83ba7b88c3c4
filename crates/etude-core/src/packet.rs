//! Fixed-layout binary packet header.
//!
//! Format (network byte order, packed): `u16 total_length` `u16 message_code`
//! `i32 checksum`, followed by `total_length - PKG_HEADER_LEN` body bytes.
//! The checksum is 0 for header-only packets and the CRC32 of the body
//! otherwise.

use std::sync::Arc;

use thiserror::Error;

use crate::checksum::Checksum;
use crate::memory::{Memory, MessageBuf};

/// Size of the encoded header.
pub const PKG_HEADER_LEN: usize = 8;

/// Largest `total_length` accepted by default.
pub const MAX_PACKET_LEN: usize = 29_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("declared length {0} is shorter than the header")]
    TooShort(u16),
    #[error("declared length {0} exceeds the maximum of {1}")]
    TooLarge(u16, usize),
    #[error("body of {0} bytes does not fit a u16 length field")]
    BodyTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub total_length: u16,
    pub message_code: u16,
    pub checksum: i32,
}

impl PacketHeader {
    /// Build the header for `body`, computing its checksum.
    pub fn for_body(
        message_code: u16,
        body: &[u8],
        checksum: &dyn Checksum,
    ) -> Result<Self, FrameError> {
        let total = PKG_HEADER_LEN + body.len();
        let total_length = u16::try_from(total).map_err(|_| FrameError::BodyTooLarge(body.len()))?;
        let checksum = if body.is_empty() {
            0
        } else {
            checksum.compute(body) as i32
        };
        Ok(Self {
            total_length,
            message_code,
            checksum,
        })
    }

    /// Decode from the first `PKG_HEADER_LEN` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PKG_HEADER_LEN {
            return None;
        }
        Some(Self {
            total_length: get_u16(buf, 0),
            message_code: get_u16(buf, 2),
            checksum: get_i32(buf, 4),
        })
    }

    /// Encode into `buf`. Returns bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        put_u16(buf, 0, self.total_length);
        put_u16(buf, 2, self.message_code);
        put_i32(buf, 4, self.checksum);
        PKG_HEADER_LEN
    }

    pub fn to_bytes(&self) -> [u8; PKG_HEADER_LEN] {
        let mut out = [0u8; PKG_HEADER_LEN];
        self.encode(&mut out);
        out
    }

    /// Declared body length. Only meaningful after [`validate`](Self::validate).
    pub fn body_len(&self) -> usize {
        (self.total_length as usize).saturating_sub(PKG_HEADER_LEN)
    }

    /// Reject lengths below the header size or above `max_len`.
    pub fn validate(&self, max_len: usize) -> Result<(), FrameError> {
        let total = self.total_length as usize;
        if total < PKG_HEADER_LEN {
            return Err(FrameError::TooShort(self.total_length));
        }
        if total > max_len {
            return Err(FrameError::TooLarge(self.total_length, max_len));
        }
        Ok(())
    }

    /// Whether `body` carries the checksum this header declares.
    pub fn verify(&self, body: &[u8], checksum: &dyn Checksum) -> bool {
        if body.is_empty() {
            self.checksum == 0
        } else {
            checksum.compute(body) as i32 == self.checksum
        }
    }
}

/// Encode header + body into one accounted buffer ready for the send queue.
pub fn encode_packet(
    memory: &Arc<Memory>,
    message_code: u16,
    body: &[u8],
    checksum: &dyn Checksum,
) -> Result<MessageBuf, FrameError> {
    let header = PacketHeader::for_body(message_code, body, checksum)?;
    let mut buf = memory.alloc(header.total_length as usize);
    let pos = header.encode(&mut buf);
    buf[pos..].copy_from_slice(body);
    Ok(buf)
}

#[inline]
fn put_u16(buf: &mut [u8], pos: usize, v: u16) {
    buf[pos..pos + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn put_i32(buf: &mut [u8], pos: usize, v: i32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn get_u16(buf: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes([buf[pos], buf[pos + 1]])
}

#[inline]
fn get_i32(buf: &[u8], pos: usize) -> i32 {
    i32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}
