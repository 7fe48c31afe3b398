//! Complete wire frames.
//!
//! A frame is a header optionally followed by `payload ‖ tag ‖ fcs`, where
//! the FCS is the CRC-16 of payload and tag, little-endian.
//!
//! # Example
//!
//! ```
//! use cpc_core::protocol::{encode_frame, parse_frame, Control};
//!
//! let wire = encode_frame(5, Control::information(0, 0).encode(), b"hello", &[]);
//! let frame = parse_frame(&wire, 0).unwrap();
//!
//! assert_eq!(frame.address(), 5);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::control::Control;
use super::crc::{crc16, crc16_update};
use super::wire_format::{FrameError, Header, CHECKSUM_SIZE, HEADER_SIZE};

/// Frame checksum over payload and tag.
#[inline]
pub fn frame_checksum(payload: &[u8], tag: &[u8]) -> u16 {
    crc16_update(crc16(payload), tag)
}

/// A parsed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
    /// Security tag (empty when security is not in use).
    pub tag: Bytes,
    /// Transmitted FCS (0 for frames without payload).
    pub fcs: u16,
}

impl Frame {
    #[inline]
    pub fn address(&self) -> u8 {
        self.header.address
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decoded control byte.
    pub fn control(&self) -> Result<Control, FrameError> {
        Control::decode(self.header.control)
    }

    /// Whether the transmitted FCS matches payload and tag.
    pub fn checksum_ok(&self) -> bool {
        self.payload.is_empty() || frame_checksum(&self.payload, &self.tag) == self.fcs
    }
}

/// Build a full wire frame.
pub fn encode_frame(address: u8, control: u8, payload: &[u8], tag: &[u8]) -> Bytes {
    let header = Header::for_payload(address, control, payload.len(), tag.len());
    let mut buf = BytesMut::with_capacity(header.frame_len());
    buf.put_slice(&header.encode());
    if !payload.is_empty() {
        buf.put_slice(payload);
        buf.put_slice(tag);
        buf.put_u16_le(frame_checksum(payload, tag));
    }
    buf.freeze()
}

/// Parse and fully validate a wire frame.
///
/// Trailing bytes beyond the length announced by the header are ignored.
pub fn parse_frame(bytes: &[u8], tag_len: usize) -> Result<Frame, FrameError> {
    let frame = split_frame(bytes, tag_len)?;
    if !frame.checksum_ok() {
        return Err(FrameError::PayloadChecksum {
            expected: frame_checksum(&frame.payload, &frame.tag),
            actual: frame.fcs,
        });
    }
    Ok(frame)
}

/// Split a wire frame into its parts, validating the header but not the FCS.
pub fn split_frame(bytes: &[u8], tag_len: usize) -> Result<Frame, FrameError> {
    let header = Header::decode(bytes)?;
    split_with_header(header, bytes, tag_len)
}

pub(crate) fn split_with_header(
    header: Header,
    bytes: &[u8],
    tag_len: usize,
) -> Result<Frame, FrameError> {
    let total = header.frame_len();
    if bytes.len() < total {
        return Err(FrameError::TooShort {
            needed: total,
            actual: bytes.len(),
        });
    }
    if header.length == 0 {
        return Ok(Frame {
            header,
            payload: Bytes::new(),
            tag: Bytes::new(),
            fcs: 0,
        });
    }
    if (header.length as usize) < tag_len + CHECKSUM_SIZE + 1 {
        return Err(FrameError::InvalidLength(header.length));
    }
    let body = &bytes[HEADER_SIZE..total];
    let payload_len = header.payload_len(tag_len);
    let (payload, rest) = body.split_at(payload_len);
    let (tag, fcs) = rest.split_at(tag_len);
    Ok(Frame {
        header,
        payload: Bytes::copy_from_slice(payload),
        tag: Bytes::copy_from_slice(tag),
        fcs: u16::from_le_bytes([fcs[0], fcs[1]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::control::UnnumberedKind;
    use proptest::prelude::*;

    #[test]
    fn test_encode_parse_with_payload() {
        let wire = encode_frame(7, Control::information(2, 1).encode(), b"data", &[]);
        assert_eq!(wire.len(), HEADER_SIZE + 4 + CHECKSUM_SIZE);

        let frame = parse_frame(&wire, 0).unwrap();
        assert_eq!(frame.address(), 7);
        assert_eq!(frame.header.length, 6);
        assert_eq!(frame.control().unwrap(), Control::information(2, 1));
        assert_eq!(frame.payload(), b"data");
    }

    #[test]
    fn test_empty_frame_has_no_fcs() {
        let ctrl = Control::Unnumbered(UnnumberedKind::ResetSequence).encode();
        let wire = encode_frame(0, ctrl, &[], &[]);
        assert_eq!(wire.len(), HEADER_SIZE);

        let frame = parse_frame(&wire, 0).unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.fcs, 0);
    }

    #[test]
    fn test_tag_is_covered_by_fcs() {
        let wire = encode_frame(3, 0, b"abc", &[9, 9, 9, 9]);
        let frame = parse_frame(&wire, 4).unwrap();
        assert_eq!(frame.payload(), b"abc");
        assert_eq!(&frame.tag[..], &[9, 9, 9, 9]);

        let mut bad = wire.to_vec();
        bad[HEADER_SIZE + 4] ^= 0xFF;
        assert!(matches!(
            parse_frame(&bad, 4),
            Err(FrameError::PayloadChecksum { .. })
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let wire = encode_frame(1, 0, b"0123456789", &[]);
        assert!(matches!(
            parse_frame(&wire[..wire.len() - 1], 0),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn test_split_frame_skips_fcs_check() {
        let mut wire = encode_frame(1, 0, b"xyz", &[]).to_vec();
        wire[HEADER_SIZE] ^= 0x01;
        let frame = split_frame(&wire, 0).unwrap();
        assert!(!frame.checksum_ok());
    }

    #[test]
    fn prop_header_roundtrip() {
        proptest!(|(address: u8, length: u16, control: u8)| {
            let header = Header::new(address, length, control);
            let decoded = Header::decode_unchecked(&header.encode());
            if length != 0 && length <= 2 {
                prop_assert_eq!(decoded, Err(FrameError::InvalidLength(length)));
            } else {
                prop_assert_eq!(Header::decode(&header.encode()), Ok(header));
            }
        });
    }

    #[test]
    fn prop_single_bit_flip_detected() {
        proptest!(|(
            payload in proptest::collection::vec(any::<u8>(), 1..64),
            bit in 0usize..512,
        )| {
            let wire = encode_frame(5, 0, &payload, &[]);
            let mut corrupted = wire.to_vec();
            let bit = bit % (payload.len() * 8);
            corrupted[HEADER_SIZE + bit / 8] ^= 1 << (bit % 8);
            let is_checksum_error = matches!(
                parse_frame(&corrupted, 0),
                Err(FrameError::PayloadChecksum { .. })
            );
            prop_assert!(is_checksum_error);
        });
    }
}
