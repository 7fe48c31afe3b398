//! Wire format encoding and decoding.
//!
//! Implements the 7-byte header:
//! ```text
//! ┌──────┬─────────┬──────────┬─────────┬──────────┐
//! │ Flag │ Address │ Length   │ Control │ HCS      │
//! │ 0x14 │ 1 byte  │ u16 LE   │ 1 byte  │ u16 LE   │
//! └──────┴─────────┴──────────┴─────────┴──────────┘
//! ```
//!
//! The header checksum (HCS) is a CRC-16 over the first five bytes. The length
//! field counts everything after the header: payload, optional security tag
//! and the 2-byte frame checksum (FCS). A frame without payload has length 0
//! and no FCS.

use thiserror::Error;

use super::crc::crc16;

/// Header size in bytes (fixed, exactly 7).
pub const HEADER_SIZE: usize = 7;

/// Frame delimiter, first byte of every header.
pub const FLAG: u8 = 0x14;

/// Size of the header checksum and of the payload checksum.
pub const CHECKSUM_SIZE: usize = 2;

/// Number of header bytes covered by the header checksum.
pub const HCS_COVERED: usize = 5;

/// Largest payload a single frame can carry (4096 - header - FCS).
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: usize = 4087;

/// Default maximum receive payload advertised to the peer.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 256;

/// Largest security tag the core reserves room for.
pub const MAX_SECURITY_TAG_SIZE: usize = 16;

/// Reasons a header or frame is rejected by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// All header bytes are zero: nothing was transmitted.
    #[error("no frame (idle bus)")]
    NoFrame,

    /// Buffer shorter than the structure being decoded.
    #[error("buffer too short: need {needed} bytes, have {actual}")]
    TooShort { needed: usize, actual: usize },

    /// First byte is not the flag sentinel.
    #[error("invalid flag byte {0:#04x}")]
    InvalidFlag(u8),

    /// Header checksum does not match the header bytes.
    #[error("header checksum mismatch (expected {expected:#06x}, got {actual:#06x})")]
    HeaderChecksum { expected: u16, actual: u16 },

    /// Payload checksum does not match the payload bytes.
    #[error("payload checksum mismatch (expected {expected:#06x}, got {actual:#06x})")]
    PayloadChecksum { expected: u16, actual: u16 },

    /// Length field cannot describe a valid frame.
    #[error("invalid length field {0}")]
    InvalidLength(u16),

    /// Control byte does not decode to a known frame type.
    #[error("invalid control byte {0:#04x}")]
    InvalidControl(u8),

    /// System endpoint command id is not recognised.
    #[error("unknown system command {0:#04x}")]
    UnknownCommand(u8),
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Endpoint address.
    pub address: u8,
    /// Bytes following the header (payload + tag + FCS, or 0).
    pub length: u16,
    /// HDLC control byte.
    pub control: u8,
}

impl Header {
    /// Create a new header.
    pub fn new(address: u8, length: u16, control: u8) -> Self {
        Self {
            address,
            length,
            control,
        }
    }

    /// Header for a frame carrying `payload_len` payload bytes and a tag of
    /// `tag_len` bytes. Empty payloads produce length 0 (no FCS).
    pub fn for_payload(address: u8, control: u8, payload_len: usize, tag_len: usize) -> Self {
        let length = if payload_len == 0 {
            0
        } else {
            (payload_len + tag_len + CHECKSUM_SIZE) as u16
        };
        Self::new(address, length, control)
    }

    /// Payload length (without tag and FCS) given the tag length in use.
    pub fn payload_len(&self, tag_len: usize) -> usize {
        (self.length as usize).saturating_sub(tag_len + CHECKSUM_SIZE)
    }

    /// Encode header to bytes, checksum included.
    ///
    /// # Example
    ///
    /// ```
    /// use cpc_core::protocol::{Header, FLAG, HEADER_SIZE};
    ///
    /// let bytes = Header::new(5, 12, 0x00).encode();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// assert_eq!(bytes[0], FLAG);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header with the checksum bytes left zero.
    ///
    /// For drivers whose peripheral computes the header checksum itself.
    pub fn encode_without_checksum(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.write_fields(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (7 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        self.write_fields(buf);
        let hcs = crc16(&buf[..HCS_COVERED]);
        buf[5..7].copy_from_slice(&hcs.to_le_bytes());
    }

    fn write_fields(&self, buf: &mut [u8]) {
        buf[0] = FLAG;
        buf[1] = self.address;
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4] = self.control;
        buf[5] = 0;
        buf[6] = 0;
    }

    /// Decode and validate a header.
    ///
    /// An all-zero header yields [`FrameError::NoFrame`] rather than a
    /// checksum failure so drivers can tell bus silence from corruption.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let header = Self::decode_unchecked(buf)?;
        let expected = crc16(&buf[..HCS_COVERED]);
        let actual = u16::from_le_bytes([buf[5], buf[6]]);
        if expected != actual {
            return Err(FrameError::HeaderChecksum { expected, actual });
        }
        Ok(header)
    }

    /// Decode a header checking only the flag byte.
    ///
    /// Used when the driver already validated the checksum in hardware.
    pub fn decode_unchecked(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::TooShort {
                needed: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        if buf[..HEADER_SIZE].iter().all(|&b| b == 0) {
            return Err(FrameError::NoFrame);
        }
        if buf[0] != FLAG {
            return Err(FrameError::InvalidFlag(buf[0]));
        }
        let length = u16::from_le_bytes([buf[2], buf[3]]);
        if length != 0 && (length as usize) <= CHECKSUM_SIZE {
            return Err(FrameError::InvalidLength(length));
        }
        Ok(Self {
            address: buf[1],
            length,
            control: buf[4],
        })
    }

    /// Total frame size on the wire (header + everything after it).
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }
}

/// Encode a header to bytes (standalone function).
#[inline]
pub fn encode_header(address: u8, length: u16, control: u8) -> [u8; HEADER_SIZE] {
    Header::new(address, length, control).encode()
}

/// Decode a header from bytes (standalone function).
#[inline]
pub fn decode_header(buf: &[u8]) -> Result<Header, FrameError> {
    Header::decode(buf)
}
