//! Contract between the core and a physical transport driver.
//!
//! The driver owns the bus. On receive it hands raw frames to
//! [`DriverContext::receive`], keeps the returned keys on its own rx-ready
//! list and calls [`DriverContext::notify_rx_ready`]; the core later drains
//! that list through [`Driver::read`]. On transmit the core calls
//! [`Driver::write`] and the driver reports completion with
//! [`DriverContext::notify_tx_complete`].
//!
//! Context methods may be called from any thread. They only touch pool
//! slots, atomics and the dispatcher queue, never protocol state.

mod loopback;

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CpcError, Result};
use crate::pool::{BufferPools, DriverList, PoolKey};
use crate::protocol::{Header, CHECKSUM_SIZE, HEADER_SIZE};

pub use loopback::{FilterAction, LinkTap, LoopbackDriver, Side};

/// Features implemented by the driver or its hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Header checksum is validated by the driver; the core skips it.
    pub preprocess_hdlc_header: bool,
    pub uart_flowcontrol: bool,
}

/// Notifications from driver context to the core.
pub trait DriverEvents: Send + Sync {
    fn rx_ready(&self);
    fn tx_complete(&self, handle: PoolKey);
    /// The driver can accept frames again after refusing one.
    fn tx_ready(&self);
}

/// Frame handed to [`Driver::write`].
#[derive(Debug, Clone)]
pub struct TxFrame {
    /// Report this key back through `notify_tx_complete`.
    pub handle: PoolKey,
    pub header: [u8; HEADER_SIZE],
    pub payload: Bytes,
    pub tag: Bytes,
    pub fcs: u16,
}

impl TxFrame {
    /// Serialize the complete wire frame.
    pub fn to_bytes(&self) -> Bytes {
        let body = if self.payload.is_empty() {
            0
        } else {
            self.payload.len() + self.tag.len() + CHECKSUM_SIZE
        };
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body);
        buf.put_slice(&self.header);
        if !self.payload.is_empty() {
            buf.put_slice(&self.payload);
            buf.put_slice(&self.tag);
            buf.put_u16_le(self.fcs);
        }
        buf.freeze()
    }
}

/// Handle given to the driver at init.
#[derive(Clone)]
pub struct DriverContext {
    pools: Arc<BufferPools>,
    events: Arc<dyn DriverEvents>,
    preprocess_hdlc_header: bool,
}

impl DriverContext {
    pub(crate) fn new(
        pools: Arc<BufferPools>,
        events: Arc<dyn DriverEvents>,
        capabilities: DriverCapabilities,
    ) -> Self {
        Self {
            pools,
            events,
            preprocess_hdlc_header: capabilities.preprocess_hdlc_header,
        }
    }

    /// Validate a raw frame and copy it into a receive buffer handle.
    ///
    /// The returned handle carries one reference, owned by the driver until
    /// the core reads it. The handle is marked as on the driver's rx-ready
    /// list.
    pub fn receive(&self, raw: &[u8]) -> Result<PoolKey> {
        let header = if self.preprocess_hdlc_header {
            Header::decode_unchecked(raw)?
        } else {
            Header::decode(raw)?
        };
        let total = header.frame_len();
        if raw.len() < total {
            return Err(CpcError::InvalidFrame(crate::protocol::FrameError::TooShort {
                needed: total,
                actual: raw.len(),
            }));
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&raw[..HEADER_SIZE]);
        let (data, fcs) = if header.length == 0 {
            (&raw[HEADER_SIZE..HEADER_SIZE], 0)
        } else {
            let fcs_at = total - CHECKSUM_SIZE;
            (
                &raw[HEADER_SIZE..fcs_at],
                u16::from_le_bytes([raw[fcs_at], raw[fcs_at + 1]]),
            )
        };

        let key = self.pools.acquire_rx_handle(&header_bytes, data)?;
        self.pools.with_handle(key, |h| {
            h.fcs = fcs;
            h.enter_driver_list(DriverList::RxReady)
        })??;
        Ok(key)
    }

    pub fn notify_rx_ready(&self) {
        self.events.rx_ready();
    }

    pub fn notify_tx_complete(&self, handle: PoolKey) {
        self.events.tx_complete(handle);
    }

    pub fn notify_tx_ready(&self) {
        self.events.tx_ready();
    }

    pub fn pools(&self) -> &Arc<BufferPools> {
        &self.pools
    }
}

/// A physical transport.
pub trait Driver: Send + 'static {
    /// Bring up the peripheral.
    fn hw_init(&mut self) -> Result<()>;

    /// Bind to the core.
    fn init(&mut self, ctx: DriverContext) -> Result<()>;

    fn capabilities(&self) -> DriverCapabilities;

    /// Start accepting frames from the bus.
    fn start_rx(&mut self) -> Result<()>;

    /// Next handle from the rx-ready list.
    fn read(&mut self) -> Option<PoolKey>;

    /// Queue a frame. `DriverNotReady` when it cannot be accepted now.
    fn write(&mut self, frame: TxFrame) -> Result<()>;

    fn is_transmit_ready(&self) -> bool;

    /// Current bus bitrate in bits per second.
    fn bus_bitrate(&self) -> u32;

    fn bus_max_bitrate(&self) -> u32;

    /// A receive handle was freed; a stalled receiver may resume.
    fn on_rx_buffer_handle_free(&mut self) {}

    /// A receive data buffer was freed.
    fn on_rx_buffer_free(&mut self) {}

    /// Stop all activity and drop the context.
    fn deinit(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::protocol::{encode_frame, FrameError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEvents {
        rx: AtomicUsize,
    }

    impl DriverEvents for CountingEvents {
        fn rx_ready(&self) {
            self.rx.fetch_add(1, Ordering::SeqCst);
        }
        fn tx_complete(&self, _handle: PoolKey) {}
        fn tx_ready(&self) {}
    }

    fn context(preprocess: bool) -> (DriverContext, Arc<CountingEvents>) {
        let pools = Arc::new(BufferPools::new(&PoolConfig::default(), 64, 0, 0));
        let events = Arc::new(CountingEvents::default());
        let caps = DriverCapabilities {
            preprocess_hdlc_header: preprocess,
            uart_flowcontrol: false,
        };
        (DriverContext::new(pools, events.clone(), caps), events)
    }

    #[test]
    fn test_receive_splits_fcs() {
        let (ctx, events) = context(false);
        let wire = encode_frame(5, 0x00, b"abc", &[]);
        let key = ctx.receive(&wire).unwrap();

        ctx.pools()
            .with_handle(key, |h| {
                assert_eq!(h.payload_len, 3);
                assert_eq!(h.fcs, crate::protocol::crc16(b"abc"));
                assert_eq!(h.driver_list(), Some(DriverList::RxReady));
                assert_eq!(h.ref_count(), 1);
            })
            .unwrap();

        ctx.notify_rx_ready();
        assert_eq!(events.rx.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_receive_rejects_bad_header() {
        let (ctx, _) = context(false);
        let mut wire = encode_frame(5, 0x00, b"abc", &[]).to_vec();
        wire[5] ^= 0xFF;
        assert!(matches!(
            ctx.receive(&wire),
            Err(CpcError::InvalidFrame(FrameError::HeaderChecksum { .. }))
        ));
        assert!(matches!(
            ctx.receive(&[0u8; HEADER_SIZE]),
            Err(CpcError::InvalidFrame(FrameError::NoFrame))
        ));
    }

    #[test]
    fn test_preprocessed_header_skips_hcs() {
        let (ctx, _) = context(true);
        let mut wire = encode_frame(5, 0xC0, &[], &[]).to_vec();
        wire[5] = 0;
        wire[6] = 0;
        assert!(ctx.receive(&wire).is_ok());
    }

    #[test]
    fn test_tx_frame_serialization() {
        let header = Header::for_payload(2, 0x00, 2, 0).encode();
        let frame = TxFrame {
            handle: context(false).0.receive(&encode_frame(1, 0xC0, &[], &[])).unwrap(),
            header,
            payload: Bytes::from_static(b"hi"),
            tag: Bytes::new(),
            fcs: crate::protocol::crc16(b"hi"),
        };
        assert_eq!(frame.to_bytes(), encode_frame(2, 0x00, b"hi", &[]));
    }
}
