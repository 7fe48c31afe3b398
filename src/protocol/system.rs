//! System endpoint command codec.
//!
//! Every payload on endpoint 0 is one command:
//! ```text
//! ┌─────────┬─────┬──────────┬─────────────────┐
//! │ Command │ Seq │ Length   │ Payload         │
//! │ u8      │ u8  │ u16 LE   │ length bytes    │
//! └─────────┴─────┴──────────┴─────────────────┘
//! ```
//!
//! Property commands carry `[property u32 LE][value]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::wire_format::FrameError;

/// Command header size.
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = 5;

/// Capability bits exchanged during the handshake.
pub mod capabilities {
    pub const SECURITY: u32 = 1 << 0;
    pub const PACKED_ENDPOINT: u32 = 1 << 1;
    pub const GPIO: u32 = 1 << 2;
    pub const UART_FLOW_CONTROL: u32 = 1 << 3;
}

/// `LAST_STATUS` values.
pub mod status {
    pub const OK: u32 = 0x0000;
    pub const NOT_FOUND: u32 = 0x000C;
}

/// System command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    Noop = 0x00,
    Reset = 0x01,
    PropValueGet = 0x02,
    PropValueSet = 0x03,
    PropValueIs = 0x06,
}

impl CommandId {
    pub fn from_u8(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0x00 => Ok(CommandId::Noop),
            0x01 => Ok(CommandId::Reset),
            0x02 => Ok(CommandId::PropValueGet),
            0x03 => Ok(CommandId::PropValueSet),
            0x06 => Ok(CommandId::PropValueIs),
            other => Err(FrameError::UnknownCommand(other)),
        }
    }
}

/// Property identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyId {
    LastStatus,
    ProtocolVersion,
    Capabilities,
    RxCapability,
    EndpointState(u8),
    Other(u32),
}

const ENDPOINT_STATE_BASE: u32 = 0x1000;

impl PropertyId {
    pub fn to_u32(self) -> u32 {
        match self {
            PropertyId::LastStatus => 0x00,
            PropertyId::ProtocolVersion => 0x01,
            PropertyId::Capabilities => 0x02,
            PropertyId::RxCapability => 0x20,
            PropertyId::EndpointState(id) => ENDPOINT_STATE_BASE | id as u32,
            PropertyId::Other(raw) => raw,
        }
    }

    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0x00 => PropertyId::LastStatus,
            0x01 => PropertyId::ProtocolVersion,
            0x02 => PropertyId::Capabilities,
            0x20 => PropertyId::RxCapability,
            r if r & !0xFF == ENDPOINT_STATE_BASE => PropertyId::EndpointState((r & 0xFF) as u8),
            r => PropertyId::Other(r),
        }
    }
}

/// Endpoint state as carried in `ENDPOINT_STATE` property values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RemoteEndpointState {
    Closed = 0,
    Open = 1,
    Connected = 2,
}

impl RemoteEndpointState {
    /// Unknown values read as closed.
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            1 => RemoteEndpointState::Open,
            2 => RemoteEndpointState::Connected,
            _ => RemoteEndpointState::Closed,
        }
    }
}

/// One system endpoint command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCommand {
    pub command: CommandId,
    pub seq: u8,
    pub payload: Bytes,
}

impl SystemCommand {
    pub fn new(command: CommandId, seq: u8, payload: Bytes) -> Self {
        Self {
            command,
            seq,
            payload,
        }
    }

    /// Property command (`GET`, `SET` or `IS`).
    pub fn property(command: CommandId, seq: u8, property: PropertyId, value: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(4 + value.len());
        buf.put_u32_le(property.to_u32());
        buf.put_slice(value);
        Self::new(command, seq, buf.freeze())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMMAND_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.command as u8);
        buf.put_u8(self.seq);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < COMMAND_HEADER_SIZE {
            return Err(FrameError::TooShort {
                needed: COMMAND_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut cursor = bytes;
        let command = CommandId::from_u8(cursor.get_u8())?;
        let seq = cursor.get_u8();
        let len = cursor.get_u16_le() as usize;
        if cursor.len() < len {
            return Err(FrameError::TooShort {
                needed: COMMAND_HEADER_SIZE + len,
                actual: bytes.len(),
            });
        }
        Ok(Self::new(command, seq, Bytes::copy_from_slice(&cursor[..len])))
    }

    /// Split a property payload into id and value.
    pub fn property_value(&self) -> Result<(PropertyId, &[u8]), FrameError> {
        if self.payload.len() < 4 {
            return Err(FrameError::TooShort {
                needed: 4,
                actual: self.payload.len(),
            });
        }
        let raw = u32::from_le_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        Ok((PropertyId::from_u32(raw), &self.payload[4..]))
    }
}
