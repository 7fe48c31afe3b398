//! Buffer handles and the aggregate pools an instance allocates frames from.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use super::{Pool, PoolKey, PoolKind, PoolRef, PoolUsage, Poolable};
use crate::backpressure::{BudgetController, BudgetGuard};
use crate::config::PoolConfig;
use crate::error::{CpcError, Result};
use crate::protocol::{Control, HEADER_SIZE, MAX_SECURITY_TAG_SIZE};

/// Role of a buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Received frame not yet classified.
    RxInternal,
    /// Received frame whose payload goes to a user endpoint.
    RxUser,
    /// Outbound reject frame.
    Reject,
    /// Outbound information frame.
    Data,
    /// Outbound acknowledgement or unnumbered control frame.
    Supervisory,
}

/// Payload storage of a buffer handle.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    None,
    Rx(PoolKey),
    Tx(Bytes),
    Reject(PoolKey),
}

/// Core-side queue a handle sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreList {
    TxQueue,
    SupervisoryQueue,
    Retransmit,
}

/// Driver-side queue a handle sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverList {
    RxReady,
    TxPending,
}

/// Transmit budget a handle holds a slot of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    TxData,
    Supervisory,
}

/// One frame in flight or being assembled.
#[derive(Debug)]
pub struct BufferHandle {
    pub header: Option<PoolKey>,
    pub payload: Payload,
    /// For received frames: payload plus tag. For transmit: payload only.
    pub payload_len: usize,
    pub fcs: u16,
    pub control: u8,
    pub address: u8,
    pub kind: HandleKind,
    pub instance: u32,
    pub security_tag: Option<PoolKey>,
    pub token: Option<u32>,
    /// First transmission time, for round-trip sampling.
    pub sent_at: Option<Instant>,
    pub retransmitted: bool,
    ref_count: u8,
    core_list: Option<CoreList>,
    driver_list: Option<DriverList>,
    budget: Option<Budget>,
}

impl Default for BufferHandle {
    fn default() -> Self {
        Self {
            header: None,
            payload: Payload::None,
            payload_len: 0,
            fcs: 0,
            control: 0,
            address: 0,
            kind: HandleKind::RxInternal,
            instance: 0,
            security_tag: None,
            token: None,
            sent_at: None,
            retransmitted: false,
            ref_count: 0,
            core_list: None,
            driver_list: None,
            budget: None,
        }
    }
}

impl Poolable for BufferHandle {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn is_releasable(&self) -> bool {
        self.ref_count == 0
    }
}

impl BufferHandle {
    #[inline]
    pub fn ref_count(&self) -> u8 {
        self.ref_count
    }

    #[inline]
    pub fn core_list(&self) -> Option<CoreList> {
        self.core_list
    }

    #[inline]
    pub fn driver_list(&self) -> Option<DriverList> {
        self.driver_list
    }

    /// N(S) of an I-frame handle.
    pub fn seq(&self) -> Option<u8> {
        match Control::decode(self.control) {
            Ok(Control::Information { seq, .. }) => Some(seq),
            _ => None,
        }
    }

    /// Mark membership of a core list. Fails with `Busy` if already on one.
    pub fn enter_core_list(&mut self, list: CoreList) -> Result<()> {
        if self.core_list.is_some() {
            return Err(CpcError::Busy);
        }
        self.core_list = Some(list);
        Ok(())
    }

    pub fn leave_core_list(&mut self) -> Option<CoreList> {
        self.core_list.take()
    }

    /// Mark membership of a driver list. Fails with `Busy` if already on one.
    pub fn enter_driver_list(&mut self, list: DriverList) -> Result<()> {
        if self.driver_list.is_some() {
            return Err(CpcError::Busy);
        }
        self.driver_list = Some(list);
        Ok(())
    }

    pub fn leave_driver_list(&mut self) -> Option<DriverList> {
        self.driver_list.take()
    }
}

/// Wire header storage.
#[derive(Debug, Default)]
pub struct HeaderBuffer(pub [u8; HEADER_SIZE]);

impl Poolable for HeaderBuffer {
    fn reset(&mut self) {
        self.0 = [0; HEADER_SIZE];
    }
}

/// Reject reason storage.
#[derive(Debug, Default)]
pub struct RejectBuffer(pub u8);

impl Poolable for RejectBuffer {
    fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Pre-allocated receive buffer.
#[derive(Debug)]
pub struct RxDataBuffer {
    bytes: BytesMut,
    capacity: usize,
}

impl RxDataBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Replace the contents. Fails if `data` exceeds the buffer size.
    pub fn fill(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity {
            return Err(CpcError::PayloadTooLarge {
                len: data.len(),
                max: self.capacity,
            });
        }
        self.bytes.clear();
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Drop trailing bytes (the security tag once it has been verified).
    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }
}

impl Poolable for RxDataBuffer {
    fn reset(&mut self) {
        self.bytes.clear();
    }
}

/// Security tag storage.
#[derive(Debug, Default)]
pub struct SecurityTagBuffer {
    bytes: [u8; MAX_SECURITY_TAG_SIZE],
    len: usize,
}

impl SecurityTagBuffer {
    pub fn set(&mut self, tag: &[u8]) {
        let len = tag.len().min(MAX_SECURITY_TAG_SIZE);
        self.bytes[..len].copy_from_slice(&tag[..len]);
        self.len = len;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Poolable for SecurityTagBuffer {
    fn reset(&mut self) {
        self.len = 0;
    }
}

/// Received payload waiting on an endpoint receive queue.
#[derive(Debug, Clone, Copy)]
pub struct RxQueueItem {
    pub data: Option<PoolKey>,
    pub len: usize,
    pub kind: HandleKind,
    pub endpoint: u8,
}

impl Default for RxQueueItem {
    fn default() -> Self {
        Self {
            data: None,
            len: 0,
            kind: HandleKind::RxUser,
            endpoint: 0,
        }
    }
}

impl Poolable for RxQueueItem {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What was attached to a handle when it was freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreedHandle {
    pub kind: HandleKind,
    pub address: u8,
    pub control: u8,
    pub token: Option<u32>,
    pub retransmitted: bool,
}

/// Every pool and budget one instance allocates from.
pub struct BufferPools {
    instance: u32,
    handles: Pool<BufferHandle>,
    headers: Pool<HeaderBuffer>,
    rejects: Pool<RejectBuffer>,
    rx_data: Pool<RxDataBuffer>,
    rx_items: Pool<RxQueueItem>,
    security_tags: Pool<SecurityTagBuffer>,
    tx_data: BudgetController,
    supervisory: BudgetController,
    rx_buffer_size: usize,
    rx_buffer_freed: AtomicBool,
    rx_handle_freed: AtomicBool,
}

impl BufferPools {
    /// Build all pools. Receive data buffers are pre-allocated to
    /// `rx_buffer_size` bytes each.
    pub fn new(config: &PoolConfig, rx_buffer_size: usize, security_tags: usize, instance: u32) -> Self {
        Self {
            instance,
            handles: Pool::new(PoolKind::BufferHandle, config.buffer_handles, BufferHandle::default),
            headers: Pool::new(PoolKind::HeaderBuffer, config.header_buffers, HeaderBuffer::default),
            rejects: Pool::new(PoolKind::RejectBuffer, config.reject_buffers, RejectBuffer::default),
            rx_data: Pool::new(PoolKind::RxDataBuffer, config.rx_data_buffers, || {
                RxDataBuffer::with_capacity(rx_buffer_size)
            }),
            rx_items: Pool::new(PoolKind::RxQueueItem, config.rx_queue_items, RxQueueItem::default),
            security_tags: Pool::new(
                PoolKind::SecurityTag,
                security_tags,
                SecurityTagBuffer::default,
            ),
            tx_data: BudgetController::new(PoolKind::TxDataBudget, config.tx_data_buffers),
            supervisory: BudgetController::new(
                PoolKind::SupervisoryBudget,
                config.supervisory_frames,
            ),
            rx_buffer_size,
            rx_buffer_freed: AtomicBool::new(false),
            rx_handle_freed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn instance(&self) -> u32 {
        self.instance
    }

    #[inline]
    pub fn rx_buffer_size(&self) -> usize {
        self.rx_buffer_size
    }

    #[inline]
    pub fn tx_data(&self) -> &BudgetController {
        &self.tx_data
    }

    #[inline]
    pub fn supervisory(&self) -> &BudgetController {
        &self.supervisory
    }

    #[inline]
    pub fn handles(&self) -> &Pool<BufferHandle> {
        &self.handles
    }

    /// Allocate a receive handle with header storage and, when `data` is not
    /// empty, a data buffer holding it. The handle starts with one reference.
    /// Partial allocations are undone on failure.
    pub fn acquire_rx_handle(&self, header: &[u8; HEADER_SIZE], data: &[u8]) -> Result<PoolKey> {
        if data.len() > self.rx_buffer_size {
            return Err(CpcError::PayloadTooLarge {
                len: data.len(),
                max: self.rx_buffer_size,
            });
        }

        let handle = self.handles.acquire()?;
        let header_key = match self.headers.acquire() {
            Ok(key) => key,
            Err(err) => {
                let _ = self.handles.release(handle);
                return Err(err);
            }
        };
        let payload = if data.is_empty() {
            Payload::None
        } else {
            let filled = self.rx_data.acquire().and_then(|key| {
                let result = self.rx_data.with(key, |buf| buf.fill(data)).and_then(|r| r);
                if result.is_err() {
                    let _ = self.rx_data.release(key);
                }
                result.map(|_| key)
            });
            match filled {
                Ok(key) => Payload::Rx(key),
                Err(err) => {
                    let _ = self.headers.release(header_key);
                    let _ = self.handles.release(handle);
                    return Err(err);
                }
            }
        };

        self.headers.with(header_key, |buf| buf.0 = *header)?;
        self.handles.with(handle, |h| {
            h.header = Some(header_key);
            h.payload = payload;
            h.payload_len = data.len();
            h.address = header[1];
            h.control = header[4];
            h.kind = HandleKind::RxInternal;
            h.instance = self.instance;
            h.ref_count = 1;
        })?;
        Ok(handle)
    }

    /// Allocate a transmit handle.
    ///
    /// `Supervisory` and `Reject` handles take a slot of the supervisory
    /// budget here. A `Data` handle takes over a transmit-data slot the
    /// caller already reserved. The handle starts with one reference.
    pub fn acquire_tx_handle(&self, kind: HandleKind) -> Result<PoolKey> {
        let (budget, guard) = match kind {
            HandleKind::Data => (Some(Budget::TxData), None),
            HandleKind::Supervisory | HandleKind::Reject => {
                self.supervisory.try_reserve()?;
                (
                    Some(Budget::Supervisory),
                    Some(BudgetGuard::new(&self.supervisory)),
                )
            }
            HandleKind::RxInternal | HandleKind::RxUser => (None, None),
        };

        let handle = self.handles.acquire()?;
        let header_key = match self.headers.acquire() {
            Ok(key) => key,
            Err(err) => {
                let _ = self.handles.release(handle);
                return Err(err);
            }
        };
        let payload = if kind == HandleKind::Reject {
            match self.rejects.acquire() {
                Ok(key) => Payload::Reject(key),
                Err(err) => {
                    let _ = self.headers.release(header_key);
                    let _ = self.handles.release(handle);
                    return Err(err);
                }
            }
        } else {
            Payload::None
        };

        self.handles.with(handle, |h| {
            h.header = Some(header_key);
            h.payload = payload;
            h.kind = kind;
            h.instance = self.instance;
            h.ref_count = 1;
            h.budget = budget;
        })?;
        if let Some(guard) = guard {
            guard.disarm();
        }
        Ok(handle)
    }

    /// Add a reference. Returns the new count.
    pub fn retain(&self, key: PoolKey) -> Result<u8> {
        self.handles.with(key, |h| {
            h.ref_count = h.ref_count.saturating_add(1);
            h.ref_count
        })
    }

    /// Drop a reference. Returns the remaining count; fails without
    /// decrementing when the count is already zero.
    pub fn release_ref(&self, key: PoolKey) -> Result<u8> {
        self.handles.with(key, |h| match h.ref_count.checked_sub(1) {
            Some(count) => {
                h.ref_count = count;
                Ok(count)
            }
            None => Err(CpcError::InvalidHandle),
        })?
    }

    /// Free a handle and everything attached to it. `Busy` while referenced
    /// or still queued.
    pub fn free_handle(&self, key: PoolKey) -> Result<FreedHandle> {
        let (freed, header, payload, tag, budget) = self.handles.with(key, |h| {
            if h.ref_count > 0 || h.core_list.is_some() || h.driver_list.is_some() {
                return Err(CpcError::Busy);
            }
            let freed = FreedHandle {
                kind: h.kind,
                address: h.address,
                control: h.control,
                token: h.token,
                retransmitted: h.retransmitted,
            };
            Ok((
                freed,
                h.header.take(),
                std::mem::take(&mut h.payload),
                h.security_tag.take(),
                h.budget.take(),
            ))
        })??;
        self.handles.release(key)?;

        if let Some(header) = header {
            let _ = self.headers.release(header);
        }
        match payload {
            Payload::Rx(data) => self.release_rx_data(data),
            Payload::Reject(reject) => {
                let _ = self.rejects.release(reject);
            }
            Payload::Tx(_) | Payload::None => {}
        }
        if let Some(tag) = tag {
            let _ = self.security_tags.release(tag);
        }
        match budget {
            Some(Budget::TxData) => self.tx_data.release(),
            Some(Budget::Supervisory) => self.supervisory.release(),
            None => {}
        }
        if matches!(freed.kind, HandleKind::RxInternal | HandleKind::RxUser) {
            self.rx_handle_freed.store(true, Ordering::Release);
        }
        Ok(freed)
    }

    /// Drop a reference and free the handle once none remain.
    pub fn release_and_free(&self, key: PoolKey) -> Result<Option<FreedHandle>> {
        let remaining = self.release_ref(key)?;
        if remaining == 0 {
            self.free_handle(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Run `f` on a buffer handle.
    pub fn with_handle<R>(&self, key: PoolKey, f: impl FnOnce(&mut BufferHandle) -> R) -> Result<R> {
        self.handles.with(key, f)
    }

    /// Copy of a handle's header bytes.
    pub fn header_bytes(&self, key: PoolKey) -> Result<[u8; HEADER_SIZE]> {
        let header = self
            .handles
            .with(key, |h| h.header)?
            .ok_or(CpcError::InvalidHandle)?;
        self.headers.with(header, |buf| buf.0)
    }

    /// Store encoded header bytes on a handle.
    pub fn set_header(&self, key: PoolKey, bytes: [u8; HEADER_SIZE]) -> Result<()> {
        let header = self
            .handles
            .with(key, |h| h.header)?
            .ok_or(CpcError::InvalidHandle)?;
        self.headers.with(header, |buf| buf.0 = bytes)
    }

    /// Record the reason byte on a reject handle.
    pub fn set_reject_reason(&self, key: PoolKey, reason: u8) -> Result<()> {
        match self.handles.with(key, |h| h.payload.clone())? {
            Payload::Reject(reject) => self.rejects.with(reject, |buf| buf.0 = reason),
            _ => Err(CpcError::InvalidHandle),
        }
    }

    /// Reason byte of a reject handle.
    pub fn reject_reason(&self, key: PoolKey) -> Result<u8> {
        match self.handles.with(key, |h| h.payload.clone())? {
            Payload::Reject(reject) => self.rejects.with(reject, |buf| buf.0),
            _ => Err(CpcError::InvalidHandle),
        }
    }

    /// Run `f` on a receive data buffer.
    pub fn with_rx_data<R>(&self, key: PoolKey, f: impl FnOnce(&mut RxDataBuffer) -> R) -> Result<R> {
        self.rx_data.with(key, f)
    }

    /// Return a receive data buffer and record the event for the driver.
    pub fn release_rx_data(&self, key: PoolKey) {
        if self.rx_data.release(key).is_ok() {
            self.rx_buffer_freed.store(true, Ordering::Release);
        }
    }

    /// Move the data buffer out of a receive handle.
    pub fn take_rx_data(&self, key: PoolKey) -> Result<Option<(PoolKey, usize)>> {
        self.handles.with(key, |h| match std::mem::take(&mut h.payload) {
            Payload::Rx(data) => Some((data, h.payload_len)),
            other => {
                h.payload = other;
                None
            }
        })
    }

    /// Store a security tag and attach it to a handle.
    pub fn attach_tag(&self, key: PoolKey, tag: &[u8]) -> Result<()> {
        let tag_key = self.security_tags.acquire()?;
        self.security_tags.with(tag_key, |buf| buf.set(tag))?;
        let attached = self.handles.with(key, |h| h.security_tag.replace(tag_key));
        match attached {
            Ok(Some(previous)) => {
                let _ = self.security_tags.release(previous);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                let _ = self.security_tags.release(tag_key);
                Err(err)
            }
        }
    }

    /// Tag attached to a handle (empty when none).
    pub fn tag_bytes(&self, key: PoolKey) -> Result<Bytes> {
        match self.handles.with(key, |h| h.security_tag)? {
            Some(tag) => self
                .security_tags
                .with(tag, |buf| Bytes::copy_from_slice(buf.as_slice())),
            None => Ok(Bytes::new()),
        }
    }

    /// Queue item wrapping a received data buffer.
    pub fn acquire_rx_item(&self, data: PoolKey, len: usize, endpoint: u8) -> Result<PoolKey> {
        let key = self.rx_items.acquire()?;
        self.rx_items.with(key, |item| {
            item.data = Some(data);
            item.len = len;
            item.kind = HandleKind::RxUser;
            item.endpoint = endpoint;
        })?;
        Ok(key)
    }

    /// Release a queue item, returning what it wrapped.
    pub fn take_rx_item(&self, key: PoolKey) -> Result<RxQueueItem> {
        let item = self.rx_items.with(key, |item| *item)?;
        self.rx_items.release(key)?;
        Ok(item)
    }

    /// Drop a queued item together with its data buffer.
    pub fn discard_rx_item(&self, key: PoolKey) {
        if let Ok(RxQueueItem {
            data: Some(data), ..
        }) = self.take_rx_item(key)
        {
            self.release_rx_data(data);
        }
    }

    /// Whether a receive data buffer was freed since the last call.
    pub fn take_rx_buffer_freed(&self) -> bool {
        self.rx_buffer_freed.swap(false, Ordering::AcqRel)
    }

    /// Whether a receive handle was freed since the last call.
    pub fn take_rx_handle_freed(&self) -> bool {
        self.rx_handle_freed.swap(false, Ordering::AcqRel)
    }

    /// Occupancy of every pool and budget.
    pub fn usage(&self) -> Vec<PoolUsage> {
        let budget = |b: &BudgetController| PoolUsage {
            kind: b.kind(),
            used: b.used(),
            capacity: b.capacity(),
            high_water: b.high_water(),
        };
        vec![
            self.handles.usage(),
            self.headers.usage(),
            self.rejects.usage(),
            self.rx_data.usage(),
            self.rx_items.usage(),
            self.security_tags.usage(),
            budget(&self.tx_data),
            budget(&self.supervisory),
        ]
    }
}

/// Received payload owned by the application.
///
/// The data buffer returns to its pool on [`RxBuffer::release`] or drop.
pub struct RxBuffer {
    pools: Arc<BufferPools>,
    data: Option<PoolKey>,
    len: usize,
    endpoint: u8,
}

impl RxBuffer {
    pub(crate) fn new(pools: Arc<BufferPools>, data: Option<PoolKey>, len: usize, endpoint: u8) -> Self {
        Self {
            pools,
            data,
            len,
            endpoint,
        }
    }

    #[inline]
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the payload. Holds the buffer slot lock while alive.
    pub fn data(&self) -> RxData<'_> {
        let guard = self.data.and_then(|key| self.pools.rx_data.get(key).ok());
        RxData {
            guard,
            len: self.len,
        }
    }

    /// Copy the payload out.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data())
    }

    /// Return the buffer to its pool now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(key) = self.data.take() {
            self.pools.release_rx_data(key);
        }
    }
}

impl Drop for RxBuffer {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for RxBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxBuffer")
            .field("endpoint", &self.endpoint)
            .field("len", &self.len)
            .finish()
    }
}

/// Borrowed view of an [`RxBuffer`] payload.
pub struct RxData<'a> {
    guard: Option<PoolRef<'a, RxDataBuffer>>,
    len: usize,
}

impl Deref for RxData<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.guard {
            Some(buf) => {
                let bytes = buf.as_slice();
                &bytes[..self.len.min(bytes.len())]
            }
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PoolConfig {
        PoolConfig {
            buffer_handles: 4,
            header_buffers: 4,
            reject_buffers: 1,
            rx_data_buffers: 2,
            rx_queue_items: 2,
            tx_data_buffers: 2,
            supervisory_frames: 2,
            command_contexts: 2,
        }
    }

    fn header(address: u8) -> [u8; HEADER_SIZE] {
        crate::protocol::Header::new(address, 0, 0xC0).encode()
    }

    #[test]
    fn test_rx_handle_allocation() {
        let pools = BufferPools::new(&small_config(), 32, 0, 1);
        let key = pools.acquire_rx_handle(&header(5), b"hello").unwrap();

        pools
            .with_handle(key, |h| {
                assert_eq!(h.ref_count(), 1);
                assert_eq!(h.address, 5);
                assert_eq!(h.payload_len, 5);
                assert_eq!(h.instance, 1);
            })
            .unwrap();
        assert_eq!(pools.header_bytes(key).unwrap(), header(5));
    }

    #[test]
    fn test_rx_handle_unwinds_on_data_exhaustion() {
        let pools = BufferPools::new(&small_config(), 32, 0, 1);
        let _a = pools.acquire_rx_handle(&header(1), b"a").unwrap();
        let _b = pools.acquire_rx_handle(&header(1), b"b").unwrap();

        assert!(matches!(
            pools.acquire_rx_handle(&header(1), b"c"),
            Err(CpcError::ResourceExhausted(PoolKind::RxDataBuffer))
        ));
        assert_eq!(pools.handles.used(), 2);
        assert_eq!(pools.headers.used(), 2);
    }

    #[test]
    fn test_rx_payload_too_large() {
        let pools = BufferPools::new(&small_config(), 4, 0, 1);
        assert!(matches!(
            pools.acquire_rx_handle(&header(1), b"too long"),
            Err(CpcError::PayloadTooLarge { len: 8, max: 4 })
        ));
        assert_eq!(pools.handles.used(), 0);
    }

    #[test]
    fn test_free_requires_zero_refs() {
        let pools = BufferPools::new(&small_config(), 32, 0, 1);
        let key = pools.acquire_tx_handle(HandleKind::Supervisory).unwrap();
        assert_eq!(pools.supervisory().used(), 1);

        assert!(matches!(pools.free_handle(key), Err(CpcError::Busy)));
        assert_eq!(pools.retain(key).unwrap(), 2);
        assert_eq!(pools.release_and_free(key).unwrap(), None);

        let freed = pools.release_and_free(key).unwrap().unwrap();
        assert_eq!(freed.kind, HandleKind::Supervisory);
        assert_eq!(pools.supervisory().used(), 0);
        assert!(matches!(pools.release_ref(key), Err(CpcError::InvalidHandle)));
    }

    #[test]
    fn test_release_ref_does_not_underflow() {
        let pools = BufferPools::new(&small_config(), 32, 0, 1);
        let key = pools.acquire_tx_handle(HandleKind::Supervisory).unwrap();
        assert_eq!(pools.release_ref(key).unwrap(), 0);
        assert!(matches!(pools.release_ref(key), Err(CpcError::InvalidHandle)));
        pools.with_handle(key, |h| assert_eq!(h.ref_count(), 0)).unwrap();
    }

    #[test]
    fn test_list_membership_is_exclusive() {
        let pools = BufferPools::new(&small_config(), 32, 0, 1);
        let key = pools.acquire_tx_handle(HandleKind::Supervisory).unwrap();
        pools
            .with_handle(key, |h| {
                h.enter_core_list(CoreList::TxQueue).unwrap();
                assert!(matches!(h.enter_core_list(CoreList::Retransmit), Err(CpcError::Busy)));
                h.enter_driver_list(DriverList::TxPending).unwrap();
                assert!(h.enter_driver_list(DriverList::TxPending).is_err());
            })
            .unwrap();

        pools.release_ref(key).unwrap();
        assert!(matches!(pools.free_handle(key), Err(CpcError::Busy)));

        pools
            .with_handle(key, |h| {
                h.leave_core_list();
                h.leave_driver_list();
            })
            .unwrap();
        pools.free_handle(key).unwrap();
    }

    #[test]
    fn test_reject_handle_carries_reason() {
        let pools = BufferPools::new(&small_config(), 32, 0, 1);
        let key = pools.acquire_tx_handle(HandleKind::Reject).unwrap();
        pools.set_reject_reason(key, 2).unwrap();
        assert_eq!(pools.reject_reason(key).unwrap(), 2);

        assert!(matches!(
            pools.acquire_tx_handle(HandleKind::Reject),
            Err(CpcError::ResourceExhausted(PoolKind::RejectBuffer))
        ));
        assert_eq!(pools.supervisory().used(), 1);
    }

    #[test]
    fn test_data_handle_returns_tx_budget() {
        let pools = BufferPools::new(&small_config(), 32, 0, 1);
        pools.tx_data().try_reserve().unwrap();
        let key = pools.acquire_tx_handle(HandleKind::Data).unwrap();
        assert_eq!(pools.tx_data().used(), 1);

        pools.release_and_free(key).unwrap();
        assert_eq!(pools.tx_data().used(), 0);
    }

    #[test]
    fn test_rx_buffer_release_on_drop() {
        let pools = Arc::new(BufferPools::new(&small_config(), 32, 0, 1));
        let handle = pools.acquire_rx_handle(&header(3), b"payload").unwrap();
        let (data, len) = pools.take_rx_data(handle).unwrap().unwrap();
        pools.release_and_free(handle).unwrap();
        assert!(pools.take_rx_handle_freed());
        assert!(!pools.take_rx_buffer_freed());

        let item = pools.acquire_rx_item(data, len, 3).unwrap();
        let item = pools.take_rx_item(item).unwrap();
        let buffer = RxBuffer::new(pools.clone(), item.data, item.len, item.endpoint);
        assert_eq!(&*buffer.data(), b"payload");
        assert_eq!(buffer.to_bytes(), Bytes::from_static(b"payload"));
        assert_eq!(pools.rx_data.used(), 1);

        drop(buffer);
        assert_eq!(pools.rx_data.used(), 0);
        assert!(pools.take_rx_buffer_freed());
    }

    #[test]
    fn test_security_tag_attachment() {
        let pools = BufferPools::new(&small_config(), 32, 1, 1);
        pools.tx_data().try_reserve().unwrap();
        let key = pools.acquire_tx_handle(HandleKind::Data).unwrap();
        pools.attach_tag(key, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&pools.tag_bytes(key).unwrap()[..], &[1, 2, 3, 4]);

        pools.release_and_free(key).unwrap();
        assert_eq!(pools.security_tags.used(), 0);
    }
}
