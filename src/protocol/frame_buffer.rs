//! Frame reassembly for byte-stream drivers.
//!
//! Uses `bytes::BytesMut` for buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `Hunting`: discard bytes until a flag byte and a valid header are found
//! - `WaitingForBody`: header parsed, need N more bytes
//!
//! A bad header (wrong checksum, impossible length) drops one byte and the
//! hunt resumes from the next flag. Idle fill (zero bytes) never matches the
//! flag and is skipped.
//!
//! # Example
//!
//! ```
//! use cpc_core::protocol::{encode_frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let wire = encode_frame(1, 0xC0, b"ping", &[]);
//!
//! let mut stream = vec![0u8; 3];
//! stream.extend_from_slice(&wire);
//!
//! let frames = buffer.push(&stream);
//! assert_eq!(frames.len(), 1);
//! assert_eq!(&frames[0][..], &wire[..]);
//! ```

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::wire_format::{
    FrameError, Header, ABSOLUTE_MAX_PAYLOAD_SIZE, CHECKSUM_SIZE, FLAG, HEADER_SIZE,
    MAX_SECURITY_TAG_SIZE,
};

#[derive(Debug, Clone, Copy)]
enum State {
    Hunting,
    WaitingForBody { total: usize },
}

/// Accumulates stream bytes and yields complete raw frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    /// Largest value accepted in the header length field.
    max_length: usize,
    resyncs: u64,
    discarded: u64,
}

impl FrameBuffer {
    /// Frame buffer accepting any frame the wire format allows.
    pub fn new() -> Self {
        Self::with_max_length(ABSOLUTE_MAX_PAYLOAD_SIZE + MAX_SECURITY_TAG_SIZE + CHECKSUM_SIZE)
    }

    /// Frame buffer rejecting headers whose length field exceeds `max_length`.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(HEADER_SIZE + max_length),
            state: State::Hunting,
            max_length,
            resyncs: 0,
            discarded: 0,
        }
    }

    /// Push stream bytes and extract every complete frame.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }
        frames
    }

    fn try_extract_one(&mut self) -> Option<Bytes> {
        loop {
            match self.state {
                State::Hunting => {
                    match self.buffer.iter().position(|&b| b == FLAG) {
                        Some(0) => {}
                        Some(pos) => {
                            self.discard(pos);
                        }
                        None => {
                            let len = self.buffer.len();
                            self.discard(len);
                            return None;
                        }
                    }

                    if self.buffer.len() < HEADER_SIZE {
                        return None;
                    }

                    match Header::decode(&self.buffer[..HEADER_SIZE]) {
                        Ok(header) if (header.length as usize) <= self.max_length => {
                            self.state = State::WaitingForBody {
                                total: header.frame_len(),
                            };
                        }
                        Ok(header) => {
                            self.resync(FrameError::InvalidLength(header.length));
                        }
                        Err(err) => {
                            self.resync(err);
                        }
                    }
                }
                State::WaitingForBody { total } => {
                    if self.buffer.len() < total {
                        return None;
                    }
                    self.state = State::Hunting;
                    return Some(self.buffer.split_to(total).freeze());
                }
            }
        }
    }

    fn discard(&mut self, n: usize) {
        let _ = self.buffer.split_to(n);
        self.discarded += n as u64;
    }

    fn resync(&mut self, err: FrameError) {
        debug!(error = %err, "frame buffer resync");
        self.resyncs += 1;
        self.discard(1);
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bad headers skipped so far.
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// Bytes thrown away while hunting for a header.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::Hunting;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::Hunting => "Hunting",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
