//! Integration tests for cpc-core.
//!
//! Two instances talk over the in-memory loopback link; faults are injected
//! through the link tap.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cpc_core::driver::{FilterAction, Side};
use cpc_core::protocol::system::{capabilities, CommandId, PropertyId, SystemCommand};
use cpc_core::protocol::{encode_frame, Control, UnnumberedKind, HEADER_SIZE};
use cpc_core::{
    spawn_core_task, CoreConfig, CpcError, Driver, DriverCapabilities, DriverContext,
    EndpointCallbacks, EndpointFlags, EndpointState, FaultCause, FrameSecurity, Instance,
    InstanceBuilder, Lifecycle, LinkTap, LoopbackDriver, ManualClock, OpenOptions, PoolKind,
    Role, SecurityError, TxFrame, WriteFlags, WriteStatus,
};

struct Pair {
    host: Instance<LoopbackDriver>,
    device: Instance<LoopbackDriver>,
    tap: LinkTap,
    clock: ManualClock,
}

impl Pair {
    fn new(
        host: impl FnOnce(InstanceBuilder<LoopbackDriver>) -> InstanceBuilder<LoopbackDriver>,
        device: impl FnOnce(InstanceBuilder<LoopbackDriver>) -> InstanceBuilder<LoopbackDriver>,
    ) -> Self {
        let (a, b, tap) = LoopbackDriver::pair();
        let clock = ManualClock::new();
        let mut host = host(Instance::builder(a).role(Role::Primary))
            .clock(Arc::new(clock.clone()))
            .build();
        let mut device = device(Instance::builder(b).role(Role::Secondary))
            .clock(Arc::new(clock.clone()))
            .build();
        device.init().unwrap();
        device.start().unwrap();
        host.init().unwrap();
        host.start().unwrap();

        let mut pair = Self {
            host,
            device,
            tap,
            clock,
        };
        pair.settle();
        pair
    }

    fn plain() -> Self {
        Self::new(|b| b, |b| b)
    }

    fn step(&mut self) {
        let _ = self.host.process();
        let _ = self.device.process();
    }

    fn settle(&mut self) {
        for _ in 0..32 {
            self.step();
        }
    }

    fn connect(&mut self, id: u8, options: OpenOptions) {
        self.host.open_endpoint(id, options).unwrap();
        self.device.open_endpoint(id, options).unwrap();
        self.host.connect(id).unwrap();
        self.settle();
        assert_eq!(self.host.endpoint_state(id), EndpointState::Connected);
        assert_eq!(self.device.endpoint_state(id), EndpointState::Connected);
    }
}

fn read_all(instance: &mut Instance<LoopbackDriver>, id: u8) -> Vec<Bytes> {
    let mut out = Vec::new();
    while let Some(rx) = instance.read(id).unwrap() {
        out.push(rx.to_bytes());
    }
    out
}

fn is_iframe_for(frame: &[u8], id: u8) -> bool {
    frame.len() > HEADER_SIZE && frame[1] == id && frame[4] & 0x80 == 0
}

/// Every write's completion status, in firing order.
fn record_completions(
    instance: &mut Instance<LoopbackDriver>,
    id: u8,
) -> Arc<Mutex<Vec<WriteStatus>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    instance
        .set_callbacks(
            id,
            EndpointCallbacks::default().on_write_complete(move |_, _, status| {
                sink.lock().unwrap().push(status)
            }),
        )
        .unwrap();
    log
}

#[test]
fn test_handshake_exchanges_properties() {
    let pair = Pair::new(|b| b.max_rx_payload(512), |b| b.max_rx_payload(128));
    assert!(pair.host.handshake_complete());
    assert!(pair.device.handshake_complete());
    assert_eq!(pair.host.remote_info().rx_capability, Some(128));
    assert_eq!(pair.device.remote_info().rx_capability, Some(512));
    assert_eq!(pair.host.remote_info().capabilities, Some(0));
}

#[test]
fn test_remote_rx_capability_limits_writes() {
    let mut pair = Pair::new(|b| b, |b| b.max_rx_payload(64));
    pair.connect(5, OpenOptions::default());

    assert!(matches!(
        pair.host.write(5, Bytes::from(vec![1u8; 65]), WriteFlags::NONE),
        Err(CpcError::PayloadTooLarge { len: 65, max: 64 })
    ));
    pair.host
        .write(5, Bytes::from(vec![1u8; 64]), WriteFlags::NONE)
        .unwrap();
    pair.settle();
    assert_eq!(read_all(&mut pair.device, 5), vec![Bytes::from(vec![1u8; 64])]);
}

#[test]
fn test_config_from_json_drives_instance() {
    let config = CoreConfig::from_json_str(
        r#"{"role":"secondary","max_rx_payload":100,"pools":{"rx_data_buffers":4}}"#,
    )
    .unwrap();
    let (a, b, _tap) = LoopbackDriver::pair();
    let mut host = Instance::new(a, CoreConfig::default());
    let mut device = Instance::new(b, config);
    device.init().unwrap();
    device.start().unwrap();
    host.init().unwrap();
    host.start().unwrap();
    for _ in 0..32 {
        host.process().unwrap();
        device.process().unwrap();
    }

    assert_eq!(host.remote_info().rx_capability, Some(100));
    let rx_data = device
        .pool_usage()
        .into_iter()
        .find(|u| u.kind == PoolKind::RxDataBuffer)
        .unwrap();
    assert_eq!(rx_data.capacity, 4);
}

#[test]
fn test_lossy_link_delivers_in_order() {
    let mut pair = Pair::new(|b| b.max_retries(30), |b| b.max_retries(30));
    pair.connect(5, OpenOptions::default().window(4));

    let mut state = 0x2545_f491u32;
    pair.tap.set_filter(Side::A, move |frame| {
        if frame[1] != 5 {
            return FilterAction::Pass;
        }
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        if (state >> 16) % 4 == 0 {
            FilterAction::Drop
        } else {
            FilterAction::Pass
        }
    });

    let messages: Vec<Bytes> = (0..40).map(|i| Bytes::from(format!("message {i}"))).collect();
    let mut next = 0;
    let mut received = Vec::new();
    for _ in 0..4000 {
        while next < messages.len() {
            match pair.host.write(5, messages[next].clone(), WriteFlags::NONE) {
                Ok(_) => next += 1,
                Err(CpcError::WindowFull { .. }) => break,
                Err(err) => panic!("write failed: {err}"),
            }
        }
        pair.step();
        received.extend(read_all(&mut pair.device, 5));
        if received.len() == messages.len() {
            break;
        }
        pair.clock.advance(Duration::from_millis(50));
    }

    assert_eq!(received, messages);
    assert_eq!(pair.host.endpoint_state(5), EndpointState::Connected);
    let device_stats = pair.device.endpoint_info(5).unwrap().stats;
    assert_eq!(device_stats.iframes_received, 40);
}

#[test]
fn test_corrupted_payload_is_rejected_then_resent() {
    let mut pair = Pair::plain();
    pair.connect(5, OpenOptions::default());

    let mut corrupted = false;
    pair.tap.set_filter(Side::A, move |frame| {
        if !corrupted && is_iframe_for(frame, 5) {
            corrupted = true;
            FilterAction::Corrupt(HEADER_SIZE + 1)
        } else {
            FilterAction::Pass
        }
    });

    pair.host
        .write(5, Bytes::from_static(b"fragile"), WriteFlags::NONE)
        .unwrap();
    pair.settle();

    assert_eq!(read_all(&mut pair.device, 5), vec![Bytes::from_static(b"fragile")]);
    let host_stats = pair.host.endpoint_info(5).unwrap().stats;
    assert_eq!(host_stats.rejects_received, 1);
    assert_eq!(host_stats.iframes_sent, 2);
    assert_eq!(pair.host.endpoint_info(5).unwrap().in_flight, 0);
}

#[test]
fn test_transmit_not_ready_defers_frames() {
    let mut pair = Pair::plain();
    pair.connect(5, OpenOptions::default());

    pair.tap.set_transmit_ready(Side::A, false);
    pair.host
        .write(5, Bytes::from_static(b"later"), WriteFlags::NONE)
        .unwrap();
    pair.settle();
    assert!(read_all(&mut pair.device, 5).is_empty());

    pair.tap.set_transmit_ready(Side::A, true);
    pair.settle();
    assert_eq!(read_all(&mut pair.device, 5), vec![Bytes::from_static(b"later")]);
}

#[test]
fn test_version_mismatch_faults_instance() {
    let (driver, tap) = LoopbackDriver::standalone();
    let mut host = Instance::new(driver, CoreConfig::default());
    host.init().unwrap();
    host.start().unwrap();
    host.process().unwrap();

    let reset_ack = Control::Unnumbered(UnnumberedKind::Acknowledge).encode();
    tap.inject(Side::A, &encode_frame(0, reset_ack, &[], &[]));
    host.process().unwrap();
    assert_eq!(host.endpoint_state(0), EndpointState::Connected);

    let report = SystemCommand::property(CommandId::PropValueIs, 0, PropertyId::ProtocolVersion, &[4]);
    let control = Control::information(0, 1).encode();
    tap.inject(Side::A, &encode_frame(0, control, &report.encode(), &[]));

    let expected = FaultCause::HandshakeMismatch { local: 5, remote: 4 };
    assert!(matches!(host.process(), Err(CpcError::Fault(cause)) if cause == expected));
    assert_eq!(host.fault(), Some(expected));
    assert!(matches!(
        host.open_endpoint(5, OpenOptions::default()),
        Err(CpcError::Fault(_))
    ));
    assert!(host.next_deadline().is_none());
}

#[test]
fn test_capability_mismatch_faults_host() {
    let pair = Pair::new(|b| b.required_capabilities(capabilities::GPIO), |b| b);
    assert_eq!(
        pair.host.fault(),
        Some(FaultCause::CapabilityMismatch {
            missing: capabilities::GPIO
        })
    );
    assert!(pair.device.fault().is_none());
}

#[test]
fn test_remote_close_reaches_both_sides() {
    let mut pair = Pair::plain();
    pair.connect(5, OpenOptions::default());

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    pair.host
        .set_callbacks(
            5,
            EndpointCallbacks::default().on_error(move |id, state| sink.lock().unwrap().push((id, state))),
        )
        .unwrap();

    pair.device.close_endpoint(5).unwrap();
    pair.settle();
    assert_eq!(*errors.lock().unwrap(), vec![(5, EndpointState::Closing)]);
    assert_eq!(pair.host.endpoint_state(5), EndpointState::Closing);
    assert_eq!(pair.device.endpoint_state(5), EndpointState::Closed);
    assert!(matches!(
        pair.host.write(5, Bytes::from_static(b"x"), WriteFlags::NONE),
        Err(CpcError::InvalidState { endpoint: 5, state: EndpointState::Closing })
    ));

    pair.host.close_endpoint(5).unwrap();
    pair.settle();
    assert_eq!(pair.host.endpoint_state(5), EndpointState::Closed);
}

#[test]
fn test_connect_refused_when_peer_endpoint_closed() {
    let mut pair = Pair::plain();
    pair.host.open_endpoint(8, OpenOptions::default()).unwrap();
    pair.host.connect(8).unwrap();
    pair.settle();
    assert_eq!(
        pair.host.endpoint_state(8),
        EndpointState::ErrorDestinationUnreachable
    );
}

#[test]
fn test_unnumbered_frames_need_receiver_opt_in() {
    let mut pair = Pair::plain();
    pair.host
        .open_endpoint(6, OpenOptions::default().flags(EndpointFlags::UFRAME_ENABLE))
        .unwrap();
    pair.device.open_endpoint(6, OpenOptions::default()).unwrap();
    pair.host.connect(6).unwrap();
    pair.settle();

    let completions = record_completions(&mut pair.host, 6);
    pair.host
        .write(6, Bytes::from_static(b"beacon"), WriteFlags::UNNUMBERED)
        .unwrap();
    pair.settle();

    assert_eq!(*completions.lock().unwrap(), vec![WriteStatus::Sent]);
    assert!(read_all(&mut pair.device, 6).is_empty());
    assert_eq!(pair.device.endpoint_info(6).unwrap().stats.uframes_received, 0);
}

/// Appends a two-byte keyed checksum as the security tag.
struct KeyedTag {
    key: u16,
    refuse: Arc<AtomicBool>,
}

impl KeyedTag {
    fn tag(&self, endpoint: u8, payload: &[u8]) -> [u8; 2] {
        let sum = payload
            .iter()
            .fold(self.key ^ endpoint as u16, |acc, &b| acc.rotate_left(3) ^ b as u16);
        sum.to_le_bytes()
    }
}

impl FrameSecurity for KeyedTag {
    fn tag_len(&self) -> usize {
        2
    }

    fn seal(&mut self, endpoint: u8, payload: &[u8]) -> Result<Vec<u8>, SecurityError> {
        Ok(self.tag(endpoint, payload).to_vec())
    }

    fn open(&mut self, endpoint: u8, payload: &[u8], tag: &[u8]) -> Result<(), SecurityError> {
        if self.refuse.load(Ordering::SeqCst) || tag != self.tag(endpoint, payload) {
            return Err(SecurityError("tag mismatch".into()));
        }
        Ok(())
    }
}

fn secured(refuse: &Arc<AtomicBool>) -> Box<dyn FrameSecurity> {
    Box::new(KeyedTag {
        key: 0x5a5a,
        refuse: refuse.clone(),
    })
}

#[test]
fn test_security_tag_is_appended_and_verified() {
    let host_refuse = Arc::new(AtomicBool::new(false));
    let device_refuse = Arc::new(AtomicBool::new(false));
    let mut pair = Pair::new(
        |b| b.security(secured(&host_refuse)),
        |b| b.security(secured(&device_refuse)),
    );
    pair.connect(5, OpenOptions::default());
    pair.tap.take_written(Side::A);

    pair.host
        .write(5, Bytes::from_static(b"hello"), WriteFlags::NONE)
        .unwrap();
    pair.settle();

    let sent = pair
        .tap
        .written(Side::A)
        .into_iter()
        .find(|f| is_iframe_for(f, 5))
        .unwrap();
    let length = u16::from_le_bytes([sent[2], sent[3]]);
    assert_eq!(length, 5 + 2 + 2);
    assert_eq!(read_all(&mut pair.device, 5), vec![Bytes::from_static(b"hello")]);
}

#[test]
fn test_security_failure_poisons_endpoint_on_both_sides() {
    let host_refuse = Arc::new(AtomicBool::new(false));
    let device_refuse = Arc::new(AtomicBool::new(false));
    let mut pair = Pair::new(
        |b| b.security(secured(&host_refuse)),
        |b| b.security(secured(&device_refuse)),
    );
    pair.connect(5, OpenOptions::default());
    device_refuse.store(true, Ordering::SeqCst);

    pair.host
        .write(5, Bytes::from_static(b"hello"), WriteFlags::NONE)
        .unwrap();
    pair.settle();

    assert!(read_all(&mut pair.device, 5).is_empty());
    assert_eq!(pair.device.endpoint_state(5), EndpointState::ErrorSecurityIncident);
    assert_eq!(pair.host.endpoint_state(5), EndpointState::ErrorSecurityIncident);
    assert!(matches!(
        pair.host.write(5, Bytes::from_static(b"again"), WriteFlags::NONE),
        Err(CpcError::EndpointFault { endpoint: 5, .. })
    ));
}

#[test]
fn test_disable_encryption_bypasses_security() {
    let host_refuse = Arc::new(AtomicBool::new(false));
    let device_refuse = Arc::new(AtomicBool::new(true));
    let mut pair = Pair::new(
        |b| b.security(secured(&host_refuse)),
        |b| b.security(secured(&device_refuse)),
    );
    pair.connect(
        5,
        OpenOptions::default().flags(EndpointFlags::DISABLE_ENCRYPTION),
    );

    pair.host
        .write(5, Bytes::from_static(b"plain"), WriteFlags::NONE)
        .unwrap();
    pair.settle();
    assert_eq!(read_all(&mut pair.device, 5), vec![Bytes::from_static(b"plain")]);
}

/// Where [`FailingDriver`] refuses to come up.
#[derive(Clone, Copy, PartialEq)]
enum FailAt {
    HwInit,
    Init,
    StartRx,
}

struct FailingDriver {
    fail_at: FailAt,
    deinits: Arc<AtomicUsize>,
}

impl Driver for FailingDriver {
    fn hw_init(&mut self) -> cpc_core::Result<()> {
        if self.fail_at == FailAt::HwInit {
            return Err(CpcError::DriverInit("peripheral absent".into()));
        }
        Ok(())
    }

    fn init(&mut self, _ctx: DriverContext) -> cpc_core::Result<()> {
        if self.fail_at == FailAt::Init {
            return Err(CpcError::DriverNotReady);
        }
        Ok(())
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    fn start_rx(&mut self) -> cpc_core::Result<()> {
        if self.fail_at == FailAt::StartRx {
            return Err(CpcError::DriverInit("receiver stuck".into()));
        }
        Ok(())
    }

    fn read(&mut self) -> Option<cpc_core::pool::PoolKey> {
        None
    }

    fn write(&mut self, _frame: TxFrame) -> cpc_core::Result<()> {
        Err(CpcError::DriverNotReady)
    }

    fn is_transmit_ready(&self) -> bool {
        false
    }

    fn bus_bitrate(&self) -> u32 {
        0
    }

    fn bus_max_bitrate(&self) -> u32 {
        0
    }

    fn deinit(&mut self) {
        self.deinits.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_driver_failures_unwind_init() {
    for fail_at in [FailAt::HwInit, FailAt::Init, FailAt::StartRx] {
        let deinits = Arc::new(AtomicUsize::new(0));
        let mut instance = Instance::new(
            FailingDriver {
                fail_at,
                deinits: deinits.clone(),
            },
            CoreConfig::default(),
        );

        let result = instance.init().and_then(|()| instance.start());
        assert!(matches!(result, Err(CpcError::DriverInit(_))));
        let (lifecycle, driver_deinits) = match fail_at {
            FailAt::HwInit => (Lifecycle::EarlyInitialized, 0),
            FailAt::Init => (Lifecycle::EarlyInitialized, 1),
            FailAt::StartRx => (Lifecycle::HardwareInitialized, 0),
        };
        assert_eq!(instance.lifecycle(), lifecycle);
        assert_eq!(deinits.load(Ordering::SeqCst), driver_deinits);

        instance.deinit();
        assert_eq!(instance.lifecycle(), Lifecycle::Uninitialized);
        assert!(instance.pool_usage().is_empty());
    }
}

#[test]
fn test_rx_buffers_return_to_pool() {
    let mut pair = Pair::plain();
    pair.connect(5, OpenOptions::default().window(4));
    for i in 0..4u8 {
        pair.host
            .write(5, Bytes::from(vec![i; 16]), WriteFlags::NONE)
            .unwrap();
    }
    pair.settle();

    let used = |instance: &Instance<LoopbackDriver>, kind| {
        instance
            .pool_usage()
            .into_iter()
            .find(|u| u.kind == kind)
            .map_or(0, |u| u.used)
    };
    assert_eq!(used(&pair.device, PoolKind::RxDataBuffer), 4);
    assert_eq!(used(&pair.device, PoolKind::RxQueueItem), 4);

    let received = read_all(&mut pair.device, 5);
    assert_eq!(received.len(), 4);
    assert_eq!(used(&pair.device, PoolKind::RxDataBuffer), 0);
    assert_eq!(used(&pair.device, PoolKind::RxQueueItem), 0);
    assert_eq!(used(&pair.device, PoolKind::BufferHandle), 0);
}

#[tokio::test]
async fn test_runtime_round_trip_with_callbacks() {
    let (a, b, _tap) = LoopbackDriver::pair();
    let mut host = Instance::builder(a).role(Role::Primary).build();
    let mut device = Instance::builder(b).role(Role::Secondary).build();
    for instance in [&mut host, &mut device] {
        instance.init().unwrap();
        instance.start().unwrap();
    }
    let (host, host_task) = spawn_core_task(host);
    let (device, device_task) = spawn_core_task(device);

    let wait = Duration::from_secs(5);
    host.wait_handshake(wait).await.unwrap();
    device.wait_handshake(wait).await.unwrap();
    device.open(12, OpenOptions::default().window(2)).await.unwrap();
    host.open(12, OpenOptions::default().window(2)).await.unwrap();

    let rx_events = Arc::new(AtomicUsize::new(0));
    let counter = rx_events.clone();
    device
        .set_callbacks(
            12,
            EndpointCallbacks::default().on_rx(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    host.connect(12, wait).await.unwrap();

    for i in 0..10u8 {
        host.write_waiting(12, Bytes::from(vec![i; 32])).await.unwrap();
    }
    for i in 0..10u8 {
        let rx = device.recv(12, wait).await.unwrap();
        assert_eq!(rx.to_bytes(), Bytes::from(vec![i; 32]));
    }
    assert_eq!(rx_events.load(Ordering::SeqCst), 10);

    host.close(12).await.unwrap();
    host.shutdown();
    device.shutdown();
    host_task.await.unwrap();
    device_task.await.unwrap();
    assert_eq!(host.lifecycle(), Lifecycle::Uninitialized);
}
