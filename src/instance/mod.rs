//! The CPC core instance.
//!
//! An [`Instance`] owns one driver, the buffer pools, the endpoint table and
//! the system endpoint. All protocol work happens inside [`Instance::process`]:
//!
//! ```text
//! driver ctx ──rx_ready / tx_complete / tx_ready──► Dispatcher ─┐
//! timers (poll at process entry) ───────────────────────────────┤
//! API (write, connect, close) ──schedule pump──────────────────┘
//!                                                               ▼
//!                                                   Instance::process
//!                                   rx drain · tx completions · tx pump
//!                                   retransmit timers · system endpoint
//! ```
//!
//! # Lifecycle
//!
//! `Uninitialized → early_init → EarlyInitialized → hw_init →
//! HardwareInitialized → start → Started`. `deinit` returns to
//! `Uninitialized` from any stage.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use cpc_core::config::Role;
//! use cpc_core::driver::LoopbackDriver;
//! use cpc_core::endpoint::{EndpointState, OpenOptions, WriteFlags};
//! use cpc_core::instance::Instance;
//!
//! let (a, b, _tap) = LoopbackDriver::pair();
//! let mut host = Instance::builder(a).role(Role::Primary).build();
//! let mut device = Instance::builder(b).role(Role::Secondary).build();
//! for instance in [&mut host, &mut device] {
//!     instance.init().unwrap();
//!     instance.start().unwrap();
//! }
//!
//! let run = |host: &mut Instance<_>, device: &mut Instance<_>| {
//!     for _ in 0..32 {
//!         host.process().unwrap();
//!         device.process().unwrap();
//!     }
//! };
//! run(&mut host, &mut device);
//! assert!(host.handshake_complete() && device.handshake_complete());
//!
//! host.open_endpoint(5, OpenOptions::default()).unwrap();
//! device.open_endpoint(5, OpenOptions::default()).unwrap();
//! host.connect(5).unwrap();
//! run(&mut host, &mut device);
//! assert_eq!(device.endpoint_state(5), EndpointState::Connected);
//!
//! host.write(5, Bytes::from_static(b"ping"), WriteFlags::NONE).unwrap();
//! run(&mut host, &mut device);
//! let rx = device.read(5).unwrap().unwrap();
//! assert_eq!(&*rx.data(), b"ping");
//! ```

mod rx;
mod system;
mod tx;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::backpressure::BudgetGuard;
use crate::clock::{Clock, SystemClock};
use crate::config::{CoreConfig, InstanceBuilder, Role};
use crate::dispatcher::{DispatchHandle, Dispatcher};
use crate::driver::{Driver, DriverContext, DriverEvents};
use crate::endpoint::system::{RemoteInfo, ResetState, SystemState};
use crate::endpoint::{
    CloseOrigin, Endpoint, EndpointCallbacks, EndpointFlags, EndpointId, EndpointInfo,
    EndpointState, OpenOptions, WriteFlags, WriteToken, SYSTEM_ENDPOINT, TEMPORARY_ENDPOINT_RANGE,
};
use crate::error::{CpcError, FaultCause, Result};
use crate::pool::{lock, BufferPools, PoolKey, PoolKind, PoolUsage, RxBuffer};
use crate::protocol::system::{CommandId, PropertyId, RemoteEndpointState};
use crate::protocol::{ABSOLUTE_MAX_PAYLOAD_SIZE, MAX_SECURITY_TAG_SIZE, MAX_WINDOW};
use crate::security::FrameSecurity;

const ENDPOINT_SLOTS: usize = 256;

/// Upper bound on dispatcher passes per `process` call.
const MAX_PASSES: usize = 8;

/// Initialization stage of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Uninitialized,
    EarlyInitialized,
    HardwareInitialized,
    Started,
}

/// Forwards driver notifications into the dispatcher.
struct EventBridge<D: Driver> {
    dispatcher: Arc<Dispatcher<Instance<D>>>,
    completions: Arc<Mutex<VecDeque<PoolKey>>>,
    rx_work: DispatchHandle,
    tx_complete_work: DispatchHandle,
    pump_work: DispatchHandle,
}

// `Busy` from a push means the same drain is already queued.
impl<D: Driver> DriverEvents for EventBridge<D> {
    fn rx_ready(&self) {
        let _ = self.dispatcher.push(&self.rx_work, Instance::<D>::run_rx, 0);
    }

    fn tx_complete(&self, handle: PoolKey) {
        lock(&self.completions).push_back(handle);
        let _ = self
            .dispatcher
            .push(&self.tx_complete_work, Instance::<D>::run_tx_complete, 0);
    }

    fn tx_ready(&self) {
        let _ = self.dispatcher.push(&self.pump_work, Instance::<D>::run_pump, 0);
    }
}

/// One CPC link.
pub struct Instance<D: Driver> {
    driver: D,
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    security: Option<Box<dyn FrameSecurity>>,
    lifecycle: Lifecycle,
    fault: Option<FaultCause>,
    dispatcher: Arc<Dispatcher<Instance<D>>>,
    rx_work: DispatchHandle,
    tx_complete_work: DispatchHandle,
    pump_work: DispatchHandle,
    /// Keys reported by `notify_tx_complete`, drained by the core.
    completions: Arc<Mutex<VecDeque<PoolKey>>>,
    pools: Option<Arc<BufferPools>>,
    endpoints: Vec<Option<Endpoint>>,
    system: SystemState,
    /// Data frames waiting for the driver, retransmissions first.
    tx_queue: VecDeque<PoolKey>,
    /// Supervisory and unnumbered control frames; sent before data.
    sframe_queue: VecDeque<PoolKey>,
    next_token: u32,
}

impl<D: Driver> Instance<D> {
    /// Uninitialized instance using the system clock and no security module.
    pub fn new(driver: D, config: CoreConfig) -> Self {
        Self::with_parts(driver, config, Arc::new(SystemClock), None)
    }

    pub fn builder(driver: D) -> InstanceBuilder<D> {
        InstanceBuilder::new(driver)
    }

    pub(crate) fn with_parts(
        driver: D,
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        security: Option<Box<dyn FrameSecurity>>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        Self {
            driver,
            config,
            clock,
            security,
            lifecycle: Lifecycle::Uninitialized,
            fault: None,
            rx_work: dispatcher.handle(),
            tx_complete_work: dispatcher.handle(),
            pump_work: dispatcher.handle(),
            system: SystemState::new(0, 0, dispatcher.handle()),
            dispatcher,
            completions: Arc::new(Mutex::new(VecDeque::new())),
            pools: None,
            endpoints: Vec::new(),
            tx_queue: VecDeque::new(),
            sframe_queue: VecDeque::new(),
            next_token: 1,
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Validate the configuration and allocate pools and tables.
    pub fn early_init(&mut self) -> Result<()> {
        self.require(Lifecycle::Uninitialized)?;
        self.config.validate()?;

        let tag_len = self.security.as_ref().map_or(0, |s| s.tag_len());
        if tag_len > MAX_SECURITY_TAG_SIZE {
            return Err(CpcError::InvalidConfig(format!(
                "security tag of {tag_len} bytes exceeds {MAX_SECURITY_TAG_SIZE}"
            )));
        }
        let tag_buffers = if tag_len > 0 {
            self.config.pools.tx_data_buffers
        } else {
            0
        };

        let pools = BufferPools::new(
            &self.config.pools,
            self.config.max_rx_payload + tag_len,
            tag_buffers,
            self.config.instance_id,
        );
        self.pools = Some(Arc::new(pools));
        self.endpoints = (0..ENDPOINT_SLOTS).map(|_| None).collect();
        self.system = SystemState::new(
            self.config.system_command_queue,
            self.config.pools.command_contexts,
            self.dispatcher.handle(),
        );
        self.lifecycle = Lifecycle::EarlyInitialized;
        debug!(instance = self.config.instance_id, "early init complete");
        Ok(())
    }

    /// Bring up the driver and bind it to this instance.
    pub fn hw_init(&mut self) -> Result<()> {
        self.require(Lifecycle::EarlyInitialized)?;
        let pools = self.pools()?;
        self.driver.hw_init().map_err(driver_init_error)?;

        let events: Arc<dyn DriverEvents> = Arc::new(EventBridge {
            dispatcher: self.dispatcher.clone(),
            completions: self.completions.clone(),
            rx_work: self.rx_work.clone(),
            tx_complete_work: self.tx_complete_work.clone(),
            pump_work: self.pump_work.clone(),
        });
        let ctx = DriverContext::new(pools, events, self.driver.capabilities());
        if let Err(err) = self.driver.init(ctx) {
            warn!(error = %err, "driver init failed");
            self.driver.deinit();
            return Err(driver_init_error(err));
        }

        self.lifecycle = Lifecycle::HardwareInitialized;
        debug!(bitrate = self.driver.bus_bitrate(), "driver initialized");
        Ok(())
    }

    /// `early_init` followed by `hw_init`.
    pub fn init(&mut self) -> Result<()> {
        self.early_init()?;
        self.hw_init()
    }

    /// Open the system endpoint, start receiving and begin the link reset.
    pub fn start(&mut self) -> Result<()> {
        self.require(Lifecycle::HardwareInitialized)?;
        self.endpoints[SYSTEM_ENDPOINT as usize] = Some(Endpoint::new(
            SYSTEM_ENDPOINT,
            OpenOptions::default().window(1),
            &self.config.retransmit,
            self.dispatcher.handle(),
        ));
        if let Err(err) = self.driver.start_rx() {
            self.endpoints[SYSTEM_ENDPOINT as usize] = None;
            return Err(driver_init_error(err));
        }

        self.lifecycle = Lifecycle::Started;
        info!(
            role = ?self.config.role,
            instance = self.config.instance_id,
            bitrate = self.driver.bus_bitrate(),
            "cpc instance started"
        );
        if self.config.role == Role::Primary {
            self.begin_reset();
        }
        Ok(())
    }

    /// Stop the driver and release everything. Outstanding writes complete
    /// `Aborted`.
    pub fn deinit(&mut self) {
        if self.lifecycle == Lifecycle::Uninitialized {
            return;
        }
        if self.lifecycle >= Lifecycle::HardwareInitialized {
            self.driver.deinit();
        }

        for id in 0..self.endpoints.len() {
            self.abort_writes(id as EndpointId);
            self.discard_received(id as EndpointId);
        }
        self.tx_queue.clear();
        self.sframe_queue.clear();
        lock(&self.completions).clear();
        self.dispatcher.clear();
        self.endpoints.clear();
        self.system.clear();
        self.system.reset = ResetState::Idle;
        self.system.deadline = None;
        self.fault = None;
        self.pools = None;
        self.lifecycle = Lifecycle::Uninitialized;
        info!(instance = self.config.instance_id, "cpc instance deinitialized");
    }

    // ── Endpoints ──────────────────────────────────────────────────────

    pub fn open_endpoint(&mut self, id: EndpointId, options: OpenOptions) -> Result<()> {
        self.ensure_initialized()?;
        if id == SYSTEM_ENDPOINT {
            return Err(CpcError::InvalidEndpoint(id));
        }
        if !options.window_is_valid() {
            return Err(CpcError::InvalidConfig(format!(
                "window {} outside 1..={MAX_WINDOW}",
                options.window
            )));
        }
        if let Some(ep) = self.endpoint(id) {
            if !is_reclaimable(ep) {
                return Err(CpcError::EndpointAlreadyOpen(id));
            }
        }
        let open = self
            .endpoints
            .iter()
            .flatten()
            .filter(|ep| ep.id != SYSTEM_ENDPOINT && ep.state != EndpointState::Freed)
            .count();
        if open >= self.config.max_open_endpoints {
            return Err(CpcError::ResourceExhausted(PoolKind::Endpoint));
        }

        if let Some(old) = self.endpoints[id as usize].take() {
            self.dispatcher.cancel(&old.timer_work);
        }
        self.endpoints[id as usize] = Some(Endpoint::new(
            id,
            options,
            &self.config.retransmit,
            self.dispatcher.handle(),
        ));
        debug!(endpoint = id, window = options.window, "endpoint opened");
        Ok(())
    }

    /// Open the first free endpoint in the temporary range.
    pub fn open_temporary_endpoint(&mut self, options: OpenOptions) -> Result<EndpointId> {
        self.ensure_initialized()?;
        let mut ids = TEMPORARY_ENDPOINT_RANGE;
        let id = ids
            .find(|&id| self.endpoint(id).map_or(true, is_reclaimable))
            .ok_or(CpcError::ResourceExhausted(PoolKind::Endpoint))?;
        self.open_endpoint(id, options)?;
        Ok(id)
    }

    /// Ask the peer to connect an open endpoint.
    pub fn connect(&mut self, id: EndpointId) -> Result<()> {
        self.ensure_running()?;
        if id == SYSTEM_ENDPOINT {
            return Err(CpcError::InvalidEndpoint(id));
        }
        let state = self.endpoint(id).ok_or(CpcError::EndpointNotOpen(id))?.state;
        if state != EndpointState::Open {
            return Err(CpcError::InvalidState { endpoint: id, state });
        }
        if !self.system.handshake_complete {
            return Err(CpcError::HandshakePending);
        }

        self.system.request(
            CommandId::PropValueSet,
            PropertyId::EndpointState(id),
            &[RemoteEndpointState::Connected as u8],
        )?;
        if let Some(ep) = self.endpoint_mut(id) {
            ep.reset_sequence();
            ep.state = EndpointState::Connecting;
            ep.close_origin = None;
        }
        self.schedule_pump();
        debug!(endpoint = id, "connect requested");
        Ok(())
    }

    /// Close an endpoint. A connected endpoint first goes through
    /// `Closing` until the peer confirms.
    pub fn close_endpoint(&mut self, id: EndpointId) -> Result<()> {
        self.ensure_running()?;
        if id == SYSTEM_ENDPOINT {
            return Err(CpcError::InvalidEndpoint(id));
        }
        let ep = self.endpoint(id).ok_or(CpcError::EndpointNotOpen(id))?;
        let (state, origin) = (ep.state, ep.close_origin);

        match state {
            EndpointState::Connected | EndpointState::Connecting => {
                self.abort_writes(id);
                if let Some(ep) = self.endpoint_mut(id) {
                    ep.state = EndpointState::Closing;
                    ep.close_origin = Some(CloseOrigin::Local);
                    ep.pending_ack = false;
                }
                let notified = self.system.request(
                    CommandId::PropValueSet,
                    PropertyId::EndpointState(id),
                    &[RemoteEndpointState::Closed as u8],
                );
                if let Err(err) = notified {
                    warn!(endpoint = id, error = %err, "cannot notify peer of close");
                    self.free_endpoint(id);
                }
                self.schedule_pump();
            }
            EndpointState::Closing if origin == Some(CloseOrigin::Remote) => self.free_endpoint(id),
            EndpointState::Closing => {}
            EndpointState::Freed | EndpointState::Closed => {
                return Err(CpcError::EndpointNotOpen(id));
            }
            _ => self.free_endpoint(id),
        }
        debug!(endpoint = id, from = %state, "endpoint close requested");
        Ok(())
    }

    /// State of an endpoint; `Closed` when the slot is empty.
    pub fn endpoint_state(&self, id: EndpointId) -> EndpointState {
        self.endpoint(id).map_or(EndpointState::Closed, |ep| ep.state)
    }

    pub fn endpoint_info(&self, id: EndpointId) -> Option<EndpointInfo> {
        self.endpoint(id).map(Endpoint::info)
    }

    /// Install user callbacks. They run inside `process`.
    pub fn set_callbacks(&mut self, id: EndpointId, callbacks: EndpointCallbacks) -> Result<()> {
        self.ensure_initialized()?;
        let ep = self.endpoint_mut(id).ok_or(CpcError::EndpointNotOpen(id))?;
        ep.callbacks = callbacks;
        Ok(())
    }

    // ── Data ───────────────────────────────────────────────────────────

    /// Queue a payload for transmission.
    ///
    /// Returns immediately: `WindowFull` when the window is used up,
    /// `ResourceExhausted(TxDataBudget)` when no transmit buffer is free.
    pub fn write(&mut self, id: EndpointId, payload: Bytes, flags: WriteFlags) -> Result<WriteToken> {
        self.check_write(id, payload.len(), flags)?;
        let pools = self.pools()?;
        pools.tx_data().try_reserve()?;
        self.queue_write(id, payload, flags, BudgetGuard::new(pools.tx_data()))
    }

    /// `write` for a caller that already reserved a transmit buffer slot.
    /// The slot is returned if the write is refused.
    pub(crate) fn write_reserved(
        &mut self,
        id: EndpointId,
        payload: Bytes,
        flags: WriteFlags,
    ) -> Result<WriteToken> {
        let pools = self.pools()?;
        let reservation = BudgetGuard::new(pools.tx_data());
        self.check_write(id, payload.len(), flags)?;
        self.queue_write(id, payload, flags, reservation)
    }

    fn queue_write(
        &mut self,
        id: EndpointId,
        payload: Bytes,
        flags: WriteFlags,
        reservation: BudgetGuard<'_>,
    ) -> Result<WriteToken> {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1).max(1);
        let unnumbered = flags.contains(WriteFlags::UNNUMBERED);
        let len = payload.len();
        self.enqueue_frame(id, payload, unnumbered, Some(token), reservation)?;
        debug!(endpoint = id, len, token, unnumbered, "write queued");
        Ok(WriteToken(token))
    }

    fn check_write(&self, id: EndpointId, len: usize, flags: WriteFlags) -> Result<()> {
        self.ensure_running()?;
        if id == SYSTEM_ENDPOINT {
            return Err(CpcError::InvalidEndpoint(id));
        }
        let ep = self.endpoint(id).ok_or(CpcError::EndpointNotOpen(id))?;
        if len == 0 {
            return Err(CpcError::EmptyPayload);
        }
        let max = self.max_tx_payload();
        if len > max {
            return Err(CpcError::PayloadTooLarge { len, max });
        }
        if ep.state.is_error() {
            return Err(CpcError::EndpointFault {
                endpoint: id,
                state: ep.state,
            });
        }
        let invalid = CpcError::InvalidState {
            endpoint: id,
            state: ep.state,
        };
        if ep.state != EndpointState::Connected {
            return Err(invalid);
        }
        if flags.contains(WriteFlags::UNNUMBERED) {
            if !ep.flags.contains(EndpointFlags::UFRAME_ENABLE) {
                return Err(invalid);
            }
        } else {
            if ep.flags.contains(EndpointFlags::IFRAME_DISABLE) {
                return Err(invalid);
            }
            if ep.in_flight() >= ep.window {
                return Err(CpcError::WindowFull {
                    endpoint: id,
                    window: ep.window,
                });
            }
        }
        Ok(())
    }

    /// Take the oldest received payload of an endpoint.
    pub fn read(&mut self, id: EndpointId) -> Result<Option<RxBuffer>> {
        self.ensure_initialized()?;
        if id == SYSTEM_ENDPOINT {
            return Err(CpcError::InvalidEndpoint(id));
        }
        let pools = self.pools()?;
        let ep = self.endpoint_mut(id).ok_or(CpcError::EndpointNotOpen(id))?;
        let Some(key) = ep.rx_queue.pop_front() else {
            return Ok(None);
        };
        let item = pools.take_rx_item(key)?;
        Ok(Some(RxBuffer::new(pools, item.data, item.len, id)))
    }

    // ── Processing ─────────────────────────────────────────────────────

    /// Run due timers and all queued work.
    ///
    /// Returns `Fault(cause)` once a fatal fault has been recorded.
    pub fn process(&mut self) -> Result<()> {
        self.ensure_running()?;
        let now = self.clock.now();
        self.poll_timers(now);

        let dispatcher = self.dispatcher.clone();
        for _ in 0..MAX_PASSES {
            if dispatcher.process(self) == 0 || self.fault.is_some() {
                break;
            }
        }

        if let Some(pools) = self.pools.clone() {
            if pools.take_rx_handle_freed() {
                self.driver.on_rx_buffer_handle_free();
            }
            if pools.take_rx_buffer_freed() {
                self.driver.on_rx_buffer_free();
            }
        }
        self.reclaim_endpoints();

        match self.fault {
            Some(cause) => Err(CpcError::Fault(cause)),
            None => Ok(()),
        }
    }

    /// When `process` next has something to do. `None` when idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.lifecycle != Lifecycle::Started || self.fault.is_some() {
            return None;
        }
        if self.dispatcher.pending() > 0 {
            return Some(self.clock.now());
        }
        self.endpoints
            .iter()
            .flatten()
            .filter_map(|ep| ep.retransmit_deadline)
            .chain(self.system.deadline)
            .min()
    }

    /// Work items waiting in the dispatcher.
    pub fn pending_events(&self) -> usize {
        self.dispatcher.pending()
    }

    fn poll_timers(&mut self, now: Instant) {
        if self.system.deadline.is_some_and(|at| at <= now) {
            let _ = self
                .dispatcher
                .push(&self.system.timer_work, Self::run_system_timer, 0);
        }
        for ep in self.endpoints.iter().flatten() {
            if ep.retransmit_deadline.is_some_and(|at| at <= now) {
                let _ = self
                    .dispatcher
                    .push(&ep.timer_work, Self::run_retransmit, ep.id as usize);
            }
        }
    }

    fn reclaim_endpoints(&mut self) {
        for slot in self.endpoints.iter_mut() {
            if !slot.as_ref().is_some_and(|ep| ep.state == EndpointState::Freed && ep.handle_refs == 0) {
                continue;
            }
            if let Some(ep) = slot.take() {
                self.dispatcher.cancel(&ep.timer_work);
                debug!(endpoint = ep.id, "endpoint slot reclaimed");
            }
        }
    }

    // ── Introspection ──────────────────────────────────────────────────

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn fault(&self) -> Option<FaultCause> {
        self.fault
    }

    pub fn handshake_complete(&self) -> bool {
        self.system.handshake_complete
    }

    /// What the peer reported about itself so far.
    pub fn remote_info(&self) -> RemoteInfo {
        self.system.remote
    }

    pub fn pool_usage(&self) -> Vec<PoolUsage> {
        self.pools.as_ref().map(|p| p.usage()).unwrap_or_default()
    }

    pub fn bus_bitrate(&self) -> u32 {
        self.driver.bus_bitrate()
    }

    pub fn bus_max_bitrate(&self) -> u32 {
        self.driver.bus_max_bitrate()
    }

    pub(crate) fn pools_handle(&self) -> Option<Arc<BufferPools>> {
        self.pools.clone()
    }

    /// Signal `notify` whenever work is queued.
    pub(crate) fn set_waker(&self, notify: Option<Arc<Notify>>) {
        self.dispatcher.set_waker(notify);
    }

    // ── Internal helpers ───────────────────────────────────────────────

    fn require(&self, expected: Lifecycle) -> Result<()> {
        if self.lifecycle != expected {
            return Err(CpcError::InvalidLifecycle {
                expected,
                actual: self.lifecycle,
            });
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if let Some(cause) = self.fault {
            return Err(CpcError::Fault(cause));
        }
        if self.lifecycle == Lifecycle::Uninitialized {
            return Err(CpcError::InvalidLifecycle {
                expected: Lifecycle::EarlyInitialized,
                actual: self.lifecycle,
            });
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if let Some(cause) = self.fault {
            return Err(CpcError::Fault(cause));
        }
        self.require(Lifecycle::Started)
    }

    fn pools(&self) -> Result<Arc<BufferPools>> {
        self.pools.clone().ok_or(CpcError::InvalidLifecycle {
            expected: Lifecycle::EarlyInitialized,
            actual: self.lifecycle,
        })
    }

    fn endpoint(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.get(id as usize).and_then(Option::as_ref)
    }

    fn endpoint_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(id as usize).and_then(Option::as_mut)
    }

    fn schedule_pump(&self) {
        let _ = self.dispatcher.push(&self.pump_work, Self::run_pump, 0);
    }

    /// Security tag length used on an endpoint's payloads.
    fn tag_len_for(&self, id: EndpointId) -> usize {
        let Some(security) = self.security.as_ref() else {
            return 0;
        };
        let bypass = id == SYSTEM_ENDPOINT
            || self
                .endpoint(id)
                .is_some_and(|ep| ep.flags.contains(EndpointFlags::DISABLE_ENCRYPTION));
        if bypass {
            0
        } else {
            security.tag_len()
        }
    }

    /// Largest payload the peer accepts.
    fn max_tx_payload(&self) -> usize {
        self.system
            .remote
            .rx_capability
            .map_or(self.config.max_rx_payload, usize::from)
            .min(ABSOLUTE_MAX_PAYLOAD_SIZE)
    }

    /// Tear an endpoint down to `Freed`; the slot is reclaimed once no
    /// buffer handle references it.
    fn free_endpoint(&mut self, id: EndpointId) {
        self.abort_writes(id);
        self.discard_received(id);
        if let Some(ep) = self.endpoints.get_mut(id as usize).and_then(Option::as_mut) {
            ep.state = EndpointState::Freed;
            ep.pending_ack = false;
            ep.retransmit_deadline = None;
            self.dispatcher.cancel(&ep.timer_work);
        }
        debug!(endpoint = id, "endpoint freed");
    }

    fn discard_received(&mut self, id: EndpointId) {
        let Ok(pools) = self.pools() else {
            return;
        };
        if let Some(ep) = self.endpoint_mut(id) {
            for item in ep.rx_queue.drain(..) {
                pools.discard_rx_item(item);
            }
        }
    }
}

fn is_reclaimable(ep: &Endpoint) -> bool {
    ep.state == EndpointState::Freed && ep.handle_refs == 0
}

fn driver_init_error(err: CpcError) -> CpcError {
    match err {
        CpcError::DriverInit(_) => err,
        other => CpcError::DriverInit(other.to_string()),
    }
}
