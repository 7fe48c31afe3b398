//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the link-layer wire protocol:
//! - 7-byte header encoding/decoding with CRC-16 checksum
//! - HDLC control byte codec and sequence arithmetic
//! - Full-frame encode/parse with payload checksum
//! - Frame buffer for reassembling frames from a byte stream
//! - System endpoint command codec

mod control;
mod crc;
mod frame;
mod frame_buffer;
pub mod system;
mod wire_format;

pub use control::{
    seq_add, seq_distance, Control, RejectReason, SupervisoryFunction, UnnumberedKind,
    MAX_WINDOW, SEQ_MODULUS,
};
pub use crc::{crc16, crc16_update};
pub use frame::{encode_frame, frame_checksum, parse_frame, split_frame, Frame};
pub(crate) use frame::split_with_header;
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    decode_header, encode_header, FrameError, Header, ABSOLUTE_MAX_PAYLOAD_SIZE, CHECKSUM_SIZE,
    DEFAULT_MAX_PAYLOAD_SIZE, FLAG, HCS_COVERED, HEADER_SIZE, MAX_SECURITY_TAG_SIZE,
};
