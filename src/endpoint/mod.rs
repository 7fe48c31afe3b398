//! Endpoint types and per-endpoint protocol state.
//!
//! An endpoint is one logical channel on the link. Its lifecycle:
//!
//! ```text
//! Closed ─open─► Open ─connect─► Connecting ─peer ok─► Connected
//!                  │                                      │
//!                  │                          ┌───────────┼──────────────┐
//!                  │                          ▼           ▼              ▼
//!                  │                     Closing   ErrorDestination  ErrorSecurity
//!                  │                          │     Unreachable      Incident
//!                  └──────close──────────►  Freed ◄───close───┘
//! ```
//!
//! A `Freed` endpoint keeps its slot until every buffer handle that
//! references it has been released; after that it reads as `Closed`.

pub mod arq;
pub mod system;

use std::collections::VecDeque;
use std::fmt;
use std::ops::{BitOr, BitOrAssign, RangeInclusive};
use std::time::{Duration, Instant};

use crate::config::RetransmitConfig;
use crate::dispatcher::DispatchHandle;
use crate::pool::PoolKey;
use crate::protocol::MAX_WINDOW;

use arq::RtoEstimator;

/// Endpoint identifier.
pub type EndpointId = u8;

/// The system endpoint.
pub const SYSTEM_ENDPOINT: EndpointId = 0;

/// Ids handed out by `open_temporary_endpoint`.
pub const TEMPORARY_ENDPOINT_RANGE: RangeInclusive<EndpointId> = 100..=255;

/// Connection state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Closed,
    Open,
    Connecting,
    Connected,
    ErrorDestinationUnreachable,
    ErrorSecurityIncident,
    ErrorFault,
    Closing,
    Freed,
}

impl EndpointState {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            EndpointState::ErrorDestinationUnreachable
                | EndpointState::ErrorSecurityIncident
                | EndpointState::ErrorFault
        )
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Endpoint option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointFlags(u8);

impl EndpointFlags {
    pub const NONE: Self = Self(0);
    /// Refuse numbered (I-frame) writes.
    pub const IFRAME_DISABLE: Self = Self(1 << 0);
    /// Accept unnumbered information frames.
    pub const UFRAME_ENABLE: Self = Self(1 << 1);
    /// Bypass the security module.
    pub const DISABLE_ENCRYPTION: Self = Self(1 << 2);
    /// Kept for API compatibility; no behavioural effect.
    pub const LEGACY_API: Self = Self(1 << 3);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for EndpointFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EndpointFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Per-write option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFlags(u8);

impl WriteFlags {
    pub const NONE: Self = Self(0);
    /// Send as an unnumbered information frame (no ack, no retransmit).
    pub const UNNUMBERED: Self = Self(1 << 0);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Options for opening an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    /// Transmit window, 1..=7.
    pub window: u8,
    pub flags: EndpointFlags,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            window: 1,
            flags: EndpointFlags::NONE,
        }
    }
}

impl OpenOptions {
    pub fn window(mut self, window: u8) -> Self {
        self.window = window;
        self
    }

    pub fn flags(mut self, flags: EndpointFlags) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn window_is_valid(&self) -> bool {
        (1..=MAX_WINDOW).contains(&self.window)
    }
}

/// Identifies one write in completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteToken(pub(crate) u32);

impl WriteToken {
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }
}

/// Outcome reported to the write-complete callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Unnumbered frame handed to the wire.
    Sent,
    /// Numbered frame acknowledged by the peer.
    Acked,
    /// Dropped before acknowledgement (close, fault, deinit).
    Aborted,
}

/// Which side started a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOrigin {
    Local,
    Remote,
}

type ErrorCallback = Box<dyn FnMut(EndpointId, EndpointState) + Send>;
type WriteCallback = Box<dyn FnMut(EndpointId, WriteToken, WriteStatus) + Send>;
type RxCallback = Box<dyn FnMut(EndpointId) + Send>;

/// User notifications. All run inside `Instance::process`.
#[derive(Default)]
pub struct EndpointCallbacks {
    pub on_error: Option<ErrorCallback>,
    pub on_write_complete: Option<WriteCallback>,
    pub on_rx: Option<RxCallback>,
}

impl EndpointCallbacks {
    pub fn on_error(mut self, f: impl FnMut(EndpointId, EndpointState) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_write_complete(
        mut self,
        f: impl FnMut(EndpointId, WriteToken, WriteStatus) + Send + 'static,
    ) -> Self {
        self.on_write_complete = Some(Box::new(f));
        self
    }

    pub fn on_rx(mut self, f: impl FnMut(EndpointId) + Send + 'static) -> Self {
        self.on_rx = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for EndpointCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointCallbacks")
            .field("on_error", &self.on_error.is_some())
            .field("on_write_complete", &self.on_write_complete.is_some())
            .field("on_rx", &self.on_rx.is_some())
            .finish()
    }
}

/// Debug counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub iframes_sent: u64,
    pub iframes_received: u64,
    pub uframes_sent: u64,
    pub uframes_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmits: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub rejects_sent: u64,
    pub rejects_received: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

/// Snapshot of an endpoint for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub id: EndpointId,
    pub state: EndpointState,
    pub flags: EndpointFlags,
    pub window: u8,
    pub in_flight: u8,
    pub next_seq: u8,
    pub expected_seq: u8,
    pub retry_count: u8,
    pub retransmit_timeout: Duration,
    pub retransmit_pending: bool,
    pub rx_queued: usize,
    pub close_origin: Option<CloseOrigin>,
    pub stats: EndpointStats,
}

/// Protocol state of one open endpoint.
pub struct Endpoint {
    pub(crate) id: EndpointId,
    pub(crate) state: EndpointState,
    pub(crate) flags: EndpointFlags,
    pub(crate) window: u8,
    /// N(S) for the next written I-frame.
    pub(crate) next_seq: u8,
    /// N(R): sequence expected next from the peer.
    pub(crate) expected_seq: u8,
    /// Written, unacknowledged I-frames in sequence order.
    pub(crate) unacked: VecDeque<PoolKey>,
    pub(crate) rx_queue: VecDeque<PoolKey>,
    pub(crate) retry_count: u8,
    pub(crate) rto: RtoEstimator,
    pub(crate) retransmit_deadline: Option<Instant>,
    pub(crate) timer_work: DispatchHandle,
    pub(crate) pending_ack: bool,
    pub(crate) reject_sent: bool,
    pub(crate) close_origin: Option<CloseOrigin>,
    /// Live buffer handles that name this endpoint.
    pub(crate) handle_refs: usize,
    pub(crate) callbacks: EndpointCallbacks,
    pub(crate) stats: EndpointStats,
}

impl Endpoint {
    pub(crate) fn new(
        id: EndpointId,
        options: OpenOptions,
        retransmit: &RetransmitConfig,
        timer_work: DispatchHandle,
    ) -> Self {
        Self {
            id,
            state: EndpointState::Open,
            flags: options.flags,
            window: options.window,
            next_seq: 0,
            expected_seq: 0,
            unacked: VecDeque::new(),
            rx_queue: VecDeque::new(),
            retry_count: 0,
            rto: RtoEstimator::new(retransmit),
            retransmit_deadline: None,
            timer_work,
            pending_ack: false,
            reject_sent: false,
            close_origin: None,
            handle_refs: 0,
            callbacks: EndpointCallbacks::default(),
            stats: EndpointStats::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> EndpointId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> EndpointState {
        self.state
    }

    /// Written I-frames not yet acknowledged.
    #[inline]
    pub fn in_flight(&self) -> u8 {
        self.unacked.len() as u8
    }

    /// Sequence of the oldest unacknowledged frame.
    #[inline]
    pub(crate) fn send_base(&self) -> u8 {
        crate::protocol::seq_add(self.next_seq, crate::protocol::SEQ_MODULUS - self.in_flight())
    }

    /// Clear sequence state for a fresh connection. Callers drop unacked
    /// frames first.
    pub(crate) fn reset_sequence(&mut self) {
        self.next_seq = 0;
        self.expected_seq = 0;
        self.retry_count = 0;
        self.pending_ack = false;
        self.reject_sent = false;
        self.retransmit_deadline = None;
    }

    pub(crate) fn fire_error(&mut self) {
        let (id, state) = (self.id, self.state);
        if let Some(cb) = self.callbacks.on_error.as_mut() {
            cb(id, state);
        }
    }

    pub(crate) fn fire_write_complete(&mut self, token: Option<u32>, status: WriteStatus) {
        let id = self.id;
        if let (Some(token), Some(cb)) = (token, self.callbacks.on_write_complete.as_mut()) {
            cb(id, WriteToken(token), status);
        }
    }

    pub(crate) fn fire_rx(&mut self) {
        let id = self.id;
        if let Some(cb) = self.callbacks.on_rx.as_mut() {
            cb(id);
        }
    }

    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            id: self.id,
            state: self.state,
            flags: self.flags,
            window: self.window,
            in_flight: self.in_flight(),
            next_seq: self.next_seq,
            expected_seq: self.expected_seq,
            retry_count: self.retry_count,
            retransmit_timeout: self.rto.current(),
            retransmit_pending: self.retransmit_deadline.is_some(),
            rx_queued: self.rx_queue.len(),
            close_origin: self.close_origin,
            stats: self.stats,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
