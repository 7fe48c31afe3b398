//! Seam for an external frame security module.
//!
//! The core never encrypts anything itself. It reserves room for a tag after
//! the payload, asks the module to produce it on transmit, and asks it to
//! verify it on receive. The system endpoint and endpoints opened with
//! `DISABLE_ENCRYPTION` bypass the module.

use thiserror::Error;

/// Verification or sealing failure reported by a security module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("security check failed: {0}")]
pub struct SecurityError(pub String);

/// External payload authentication.
pub trait FrameSecurity: Send {
    /// Tag length appended to every protected payload.
    fn tag_len(&self) -> usize;

    /// Produce the tag for an outbound payload.
    fn seal(&mut self, endpoint: u8, payload: &[u8]) -> Result<Vec<u8>, SecurityError>;

    /// Verify the tag of an inbound payload.
    fn open(&mut self, endpoint: u8, payload: &[u8], tag: &[u8]) -> Result<(), SecurityError>;
}
