//! HDLC control byte codec.
//!
//! ```text
//! I-frame:  0 | N(S) (3) | P/F | N(R) (3)
//! S-frame:  1 0 | func (2) | 0 | N(R) (3)
//! U-frame:  1 1 | type (6)
//! ```
//!
//! Sequence numbers live in a modulo-8 space.

use super::wire_format::FrameError;

/// Size of the sequence number space.
pub const SEQ_MODULUS: u8 = 8;

/// Largest transmit window the sequence space allows.
pub const MAX_WINDOW: u8 = SEQ_MODULUS - 1;

const SEQ_MASK: u8 = 0x07;
const TYPE_MASK: u8 = 0xC0;
const TYPE_SUPERVISORY: u8 = 0x80;
const TYPE_UNNUMBERED: u8 = 0xC0;
const POLL_FINAL: u8 = 0x08;

/// `a + n` in the sequence space.
#[inline]
pub fn seq_add(a: u8, n: u8) -> u8 {
    a.wrapping_add(n) & SEQ_MASK
}

/// Forward distance from `from` to `to` in the sequence space.
#[inline]
pub fn seq_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from) & SEQ_MASK
}

/// Supervisory frame function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisoryFunction {
    /// Receive ready: plain acknowledgement.
    Ack,
    /// Reject: the payload byte carries a [`RejectReason`].
    Reject,
}

impl SupervisoryFunction {
    fn bits(self) -> u8 {
        match self {
            SupervisoryFunction::Ack => 0,
            SupervisoryFunction::Reject => 1,
        }
    }
}

/// Unnumbered frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnnumberedKind {
    /// Unsequenced information.
    Information,
    /// Poll / final.
    PollFinal,
    /// Acknowledge (reply to a sequence reset).
    Acknowledge,
    /// Reset the sequence state of the link.
    ResetSequence,
}

impl UnnumberedKind {
    fn bits(self) -> u8 {
        match self {
            UnnumberedKind::Information => 0x00,
            UnnumberedKind::PollFinal => 0x04,
            UnnumberedKind::Acknowledge => 0x0E,
            UnnumberedKind::ResetSequence => 0x31,
        }
    }

    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x00 => Some(UnnumberedKind::Information),
            0x04 => Some(UnnumberedKind::PollFinal),
            0x0E => Some(UnnumberedKind::Acknowledge),
            0x31 => Some(UnnumberedKind::ResetSequence),
            _ => None,
        }
    }
}

/// Decoded control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Information { seq: u8, ack: u8, poll_final: bool },
    Supervisory { function: SupervisoryFunction, ack: u8 },
    Unnumbered(UnnumberedKind),
}

impl Control {
    /// I-frame control with the given N(S) and N(R).
    pub fn information(seq: u8, ack: u8) -> Self {
        Control::Information {
            seq: seq & SEQ_MASK,
            ack: ack & SEQ_MASK,
            poll_final: false,
        }
    }

    /// S-frame acknowledgement.
    pub fn ack(ack: u8) -> Self {
        Control::Supervisory {
            function: SupervisoryFunction::Ack,
            ack: ack & SEQ_MASK,
        }
    }

    /// S-frame reject.
    pub fn reject(ack: u8) -> Self {
        Control::Supervisory {
            function: SupervisoryFunction::Reject,
            ack: ack & SEQ_MASK,
        }
    }

    pub fn encode(&self) -> u8 {
        match *self {
            Control::Information {
                seq,
                ack,
                poll_final,
            } => {
                let pf = if poll_final { POLL_FINAL } else { 0 };
                ((seq & SEQ_MASK) << 4) | pf | (ack & SEQ_MASK)
            }
            Control::Supervisory { function, ack } => {
                TYPE_SUPERVISORY | (function.bits() << 4) | (ack & SEQ_MASK)
            }
            Control::Unnumbered(kind) => TYPE_UNNUMBERED | kind.bits(),
        }
    }

    pub fn decode(byte: u8) -> Result<Self, FrameError> {
        if byte & 0x80 == 0 {
            return Ok(Control::Information {
                seq: (byte >> 4) & SEQ_MASK,
                ack: byte & SEQ_MASK,
                poll_final: byte & POLL_FINAL != 0,
            });
        }
        match byte & TYPE_MASK {
            TYPE_SUPERVISORY => {
                let function = match (byte >> 4) & 0x03 {
                    0 => SupervisoryFunction::Ack,
                    1 => SupervisoryFunction::Reject,
                    _ => return Err(FrameError::InvalidControl(byte)),
                };
                Ok(Control::Supervisory {
                    function,
                    ack: byte & SEQ_MASK,
                })
            }
            _ => UnnumberedKind::from_bits(byte & !TYPE_MASK)
                .map(Control::Unnumbered)
                .ok_or(FrameError::InvalidControl(byte)),
        }
    }

    /// N(R) carried by I- and S-frames.
    pub fn ack_number(&self) -> Option<u8> {
        match *self {
            Control::Information { ack, .. } | Control::Supervisory { ack, .. } => Some(ack),
            Control::Unnumbered(_) => None,
        }
    }

    /// Same frame with N(R) replaced. U-frames are returned unchanged.
    pub fn with_ack(self, new_ack: u8) -> Self {
        match self {
            Control::Information {
                seq, poll_final, ..
            } => Control::Information {
                seq,
                ack: new_ack & SEQ_MASK,
                poll_final,
            },
            Control::Supervisory { function, .. } => Control::Supervisory {
                function,
                ack: new_ack & SEQ_MASK,
            },
            u => u,
        }
    }

    pub fn is_information(&self) -> bool {
        matches!(self, Control::Information { .. })
    }
}

/// Reason byte carried by a reject frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    NoError = 0,
    ChecksumMismatch = 1,
    SequenceMismatch = 2,
    OutOfMemory = 3,
    SecurityIssue = 4,
    UnreachableEndpoint = 5,
    Error = 6,
}

impl RejectReason {
    /// Unknown codes map to [`RejectReason::Error`].
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0 => RejectReason::NoError,
            1 => RejectReason::ChecksumMismatch,
            2 => RejectReason::SequenceMismatch,
            3 => RejectReason::OutOfMemory,
            4 => RejectReason::SecurityIssue,
            5 => RejectReason::UnreachableEndpoint,
            _ => RejectReason::Error,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
