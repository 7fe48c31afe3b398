//! In-memory driver for tests and demos.
//!
//! [`LoopbackDriver::pair`] links two drivers back to back: bytes written by
//! one side are reassembled with a [`FrameBuffer`] and received by the other.
//! [`LoopbackDriver::standalone`] gives a single driver whose peer is the
//! [`LinkTap`] itself.
//!
//! The tap sees every written frame and can inject raw bytes, drop or
//! corrupt frames per direction, and toggle transmit readiness.
//!
//! # Example
//!
//! ```
//! use cpc_core::driver::{FilterAction, LoopbackDriver, Side};
//!
//! let (_a, _b, tap) = LoopbackDriver::pair();
//!
//! // Lose every frame A sends.
//! tap.set_filter(Side::A, |_frame: &[u8]| FilterAction::Drop);
//! assert!(tap.written(Side::A).is_empty());
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace};

use super::{Driver, DriverCapabilities, DriverContext, TxFrame};
use crate::error::{CpcError, Result};
use crate::pool::{lock, PoolKey};
use crate::protocol::FrameBuffer;

const LOOPBACK_BITRATE: u32 = 1_000_000;

/// One end of the loopback link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

/// What to do with a frame on its way across the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Pass,
    Drop,
    /// Invert every bit of the byte at this offset (modulo frame length).
    Corrupt(usize),
}

type Filter = Box<dyn FnMut(&[u8]) -> FilterAction + Send>;

struct Port {
    ctx: Option<DriverContext>,
    rx_enabled: bool,
    rx_ready: VecDeque<PoolKey>,
    reassembly: FrameBuffer,
    tx_ready: bool,
    written: Vec<Bytes>,
    filter: Option<Filter>,
    rx_free_events: usize,
    rx_dropped: usize,
}

impl Port {
    fn new() -> Self {
        Self {
            ctx: None,
            rx_enabled: false,
            rx_ready: VecDeque::new(),
            reassembly: FrameBuffer::new(),
            tx_ready: true,
            written: Vec::new(),
            filter: None,
            rx_free_events: 0,
            rx_dropped: 0,
        }
    }

    /// Feed stream bytes into this port's receiver.
    fn deliver(&mut self, bytes: &[u8]) {
        let Some(ctx) = self.ctx.as_ref().filter(|_| self.rx_enabled) else {
            trace!(len = bytes.len(), "loopback receiver not started, dropping bytes");
            self.rx_dropped += 1;
            return;
        };

        let mut received = false;
        for raw in self.reassembly.push(bytes) {
            match ctx.receive(&raw) {
                Ok(key) => {
                    self.rx_ready.push_back(key);
                    received = true;
                }
                Err(err) => {
                    debug!(error = %err, "loopback receive failed, frame lost");
                    self.rx_dropped += 1;
                }
            }
        }
        if received {
            ctx.notify_rx_ready();
        }
    }
}

struct Link {
    ports: [Port; 2],
}

impl Link {
    fn ports_mut(&mut self, side: Side) -> (&mut Port, &mut Port) {
        let (a, b) = self.ports.split_at_mut(1);
        match side {
            Side::A => (&mut a[0], &mut b[0]),
            Side::B => (&mut b[0], &mut a[0]),
        }
    }

    fn port(&mut self, side: Side) -> &mut Port {
        &mut self.ports[side.index()]
    }
}

/// Driver backed by an in-memory link.
pub struct LoopbackDriver {
    side: Side,
    link: Arc<Mutex<Link>>,
}

impl LoopbackDriver {
    /// Two connected drivers and a tap on the link between them.
    pub fn pair() -> (LoopbackDriver, LoopbackDriver, LinkTap) {
        let link = Arc::new(Mutex::new(Link {
            ports: [Port::new(), Port::new()],
        }));
        (
            LoopbackDriver {
                side: Side::A,
                link: link.clone(),
            },
            LoopbackDriver {
                side: Side::B,
                link: link.clone(),
            },
            LinkTap { link },
        )
    }

    /// One driver on side A; the tap plays the peer.
    pub fn standalone() -> (LoopbackDriver, LinkTap) {
        let (a, _b, tap) = Self::pair();
        (a, tap)
    }

    pub fn side(&self) -> Side {
        self.side
    }
}

impl Driver for LoopbackDriver {
    fn hw_init(&mut self) -> Result<()> {
        Ok(())
    }

    fn init(&mut self, ctx: DriverContext) -> Result<()> {
        let mut link = lock(&self.link);
        let port = link.port(self.side);
        port.ctx = Some(ctx);
        port.reassembly.clear();
        Ok(())
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    fn start_rx(&mut self) -> Result<()> {
        lock(&self.link).port(self.side).rx_enabled = true;
        Ok(())
    }

    fn read(&mut self) -> Option<PoolKey> {
        lock(&self.link).port(self.side).rx_ready.pop_front()
    }

    fn write(&mut self, frame: TxFrame) -> Result<()> {
        let mut link = lock(&self.link);
        let (port, peer) = link.ports_mut(self.side);
        if !port.tx_ready {
            return Err(CpcError::DriverNotReady);
        }

        let bytes = frame.to_bytes();
        port.written.push(bytes.clone());
        let action = port
            .filter
            .as_mut()
            .map_or(FilterAction::Pass, |filter| filter(&bytes));

        match action {
            FilterAction::Pass => peer.deliver(&bytes),
            FilterAction::Drop => {
                debug!(side = ?self.side, len = bytes.len(), "loopback filter dropped frame");
            }
            FilterAction::Corrupt(offset) => {
                let mut corrupted = bytes.to_vec();
                let at = offset % corrupted.len();
                corrupted[at] ^= 0xFF;
                debug!(side = ?self.side, offset = at, "loopback filter corrupted frame");
                peer.deliver(&corrupted);
            }
        }

        if let Some(ctx) = port.ctx.as_ref() {
            ctx.notify_tx_complete(frame.handle);
        }
        Ok(())
    }

    fn is_transmit_ready(&self) -> bool {
        lock(&self.link).port(self.side).tx_ready
    }

    fn bus_bitrate(&self) -> u32 {
        LOOPBACK_BITRATE
    }

    fn bus_max_bitrate(&self) -> u32 {
        LOOPBACK_BITRATE
    }

    fn on_rx_buffer_handle_free(&mut self) {
        lock(&self.link).port(self.side).rx_free_events += 1;
    }

    fn on_rx_buffer_free(&mut self) {
        lock(&self.link).port(self.side).rx_free_events += 1;
    }

    fn deinit(&mut self) {
        let mut link = lock(&self.link);
        let port = link.port(self.side);
        port.ctx = None;
        port.rx_enabled = false;
        port.rx_ready.clear();
        port.reassembly.clear();
    }
}

/// Observation and fault-injection handle on a loopback link.
#[derive(Clone)]
pub struct LinkTap {
    link: Arc<Mutex<Link>>,
}

impl LinkTap {
    /// Feed raw bytes into `side`'s receiver as if they came off the wire.
    pub fn inject(&self, side: Side, bytes: &[u8]) {
        lock(&self.link).port(side).deliver(bytes);
    }

    /// Every frame written by `side`, including dropped ones.
    pub fn written(&self, side: Side) -> Vec<Bytes> {
        lock(&self.link).port(side).written.clone()
    }

    /// Drain the write log of `side`.
    pub fn take_written(&self, side: Side) -> Vec<Bytes> {
        std::mem::take(&mut lock(&self.link).port(side).written)
    }

    /// Decide the fate of every frame written by `side`.
    pub fn set_filter(&self, side: Side, filter: impl FnMut(&[u8]) -> FilterAction + Send + 'static) {
        lock(&self.link).port(side).filter = Some(Box::new(filter));
    }

    pub fn clear_filter(&self, side: Side) {
        lock(&self.link).port(side).filter = None;
    }

    /// Make `side` refuse or accept writes. Re-enabling notifies the core.
    pub fn set_transmit_ready(&self, side: Side, ready: bool) {
        let mut link = lock(&self.link);
        let port = link.port(side);
        port.tx_ready = ready;
        if ready {
            if let Some(ctx) = port.ctx.as_ref() {
                ctx.notify_tx_ready();
            }
        }
    }

    /// Free notifications the core sent to `side`'s driver.
    pub fn rx_free_notifications(&self, side: Side) -> usize {
        lock(&self.link).port(side).rx_free_events
    }

    /// Frames or byte chunks `side` could not receive.
    pub fn rx_dropped(&self, side: Side) -> usize {
        lock(&self.link).port(side).rx_dropped
    }

    /// Frames waiting on `side`'s rx-ready list.
    pub fn rx_pending(&self, side: Side) -> usize {
        lock(&self.link).port(side).rx_ready.len()
    }
}
