//! Error types for cpc-core.

use thiserror::Error;

use crate::endpoint::EndpointState;
use crate::instance::Lifecycle;
use crate::pool::PoolKind;
use crate::protocol::FrameError;
use crate::security::SecurityError;

/// Main error type for all CPC operations.
#[derive(Debug, Error)]
pub enum CpcError {
    /// A fixed-capacity pool or budget has no free slot.
    #[error("{0} exhausted")]
    ResourceExhausted(PoolKind),

    /// The endpoint already has `window` unacknowledged frames outstanding.
    #[error("transmit window full on endpoint {endpoint} (window {window})")]
    WindowFull { endpoint: u8, window: u8 },

    /// The object is in use (queued work item, referenced buffer handle).
    #[error("busy")]
    Busy,

    /// The driver cannot accept a frame right now.
    #[error("driver not ready")]
    DriverNotReady,

    /// Waiting for a resource timed out.
    #[error("timed out")]
    Timeout,

    /// Frame failed validation.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    /// Pool key is stale or does not belong to the pool.
    #[error("invalid or stale buffer handle")]
    InvalidHandle,

    /// Endpoint id outside the range allowed for the operation.
    #[error("invalid endpoint id {0}")]
    InvalidEndpoint(u8),

    /// Operation on an endpoint that is not open.
    #[error("endpoint {0} is not open")]
    EndpointNotOpen(u8),

    /// Open on an endpoint that is already open.
    #[error("endpoint {0} is already open")]
    EndpointAlreadyOpen(u8),

    /// Operation not valid in the endpoint's current state.
    #[error("endpoint {endpoint} is {state:?}")]
    InvalidState { endpoint: u8, state: EndpointState },

    /// Endpoint is in a terminal error state; writes fail fast.
    #[error("endpoint {endpoint} faulted: {state:?}")]
    EndpointFault { endpoint: u8, state: EndpointState },

    /// Payload longer than the negotiated maximum.
    #[error("payload size {len} exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Zero-length writes are not allowed.
    #[error("empty payload")]
    EmptyPayload,

    /// The system endpoint handshake has not completed yet.
    #[error("system endpoint handshake pending")]
    HandshakePending,

    /// Operation called in the wrong lifecycle stage.
    #[error("invalid lifecycle: expected {expected:?}, instance is {actual:?}")]
    InvalidLifecycle { expected: Lifecycle, actual: Lifecycle },

    /// Driver failed to initialize.
    #[error("driver init failed: {0}")]
    DriverInit(String),

    /// Configuration rejected at early init.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Fatal instance-level fault.
    #[error("instance fault: {0}")]
    Fault(FaultCause),

    /// The security module refused to seal a payload.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// JSON configuration parse error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CpcError {
    /// Whether the caller should simply retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CpcError::ResourceExhausted(_)
                | CpcError::WindowFull { .. }
                | CpcError::Busy
                | CpcError::DriverNotReady
                | CpcError::Timeout
                | CpcError::HandshakePending
        )
    }
}

/// Fatal conditions that stop the whole instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FaultCause {
    /// Peer speaks a different protocol version.
    #[error("protocol version mismatch (local {local}, remote {remote})")]
    HandshakeMismatch { local: u8, remote: u8 },

    /// Peer lacks capabilities this side requires.
    #[error("remote lacks required capabilities {missing:#010x}")]
    CapabilityMismatch { missing: u32 },

    /// Sequence reset was never acknowledged.
    #[error("sequence reset not acknowledged")]
    HandshakeTimeout,

    /// System endpoint exhausted its retransmissions.
    #[error("system endpoint unreachable")]
    SystemEndpointUnreachable,
}

/// Result type alias using CpcError.
pub type Result<T> = std::result::Result<T, CpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(CpcError::ResourceExhausted(PoolKind::BufferHandle).is_recoverable());
        assert!(CpcError::WindowFull { endpoint: 5, window: 1 }.is_recoverable());
        assert!(CpcError::Busy.is_recoverable());
        assert!(!CpcError::Fault(FaultCause::HandshakeTimeout).is_recoverable());
        assert!(!CpcError::EndpointFault {
            endpoint: 5,
            state: EndpointState::ErrorDestinationUnreachable
        }
        .is_recoverable());
    }

    #[test]
    fn test_display_messages() {
        let err = CpcError::PayloadTooLarge { len: 5000, max: 4087 };
        assert!(err.to_string().contains("exceeds maximum"));

        let err = CpcError::Fault(FaultCause::HandshakeMismatch { local: 5, remote: 4 });
        assert!(err.to_string().contains("version mismatch"));
    }
}
