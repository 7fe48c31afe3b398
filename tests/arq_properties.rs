//! Property tests over the full link: whatever a finite loss pattern does,
//! every payload arrives once and in order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cpc_core::driver::{FilterAction, Side};
use cpc_core::protocol::{encode_frame, FrameBuffer, FLAG};
use cpc_core::{CpcError, EndpointState, Instance, LoopbackDriver, ManualClock, OpenOptions, Role, WriteFlags};
use proptest::prelude::*;

/// Drop the `n`th frame `side` writes on endpoint 5 for every `n` in `drops`.
fn drop_frames(tap: &cpc_core::LinkTap, side: Side, drops: HashSet<usize>) {
    let mut seen = 0usize;
    tap.set_filter(side, move |frame| {
        if frame[1] != 5 {
            return FilterAction::Pass;
        }
        seen += 1;
        if drops.contains(&(seen - 1)) {
            FilterAction::Drop
        } else {
            FilterAction::Pass
        }
    });
}

fn transfer(window: u8, count: usize, data_drops: HashSet<usize>, ack_drops: HashSet<usize>) -> Vec<Bytes> {
    let (a, b, tap) = LoopbackDriver::pair();
    let clock = ManualClock::new();
    let build = |driver, role| {
        let mut instance = Instance::builder(driver)
            .role(role)
            .max_retries(30)
            .clock(Arc::new(clock.clone()))
            .build();
        instance.init().unwrap();
        instance.start().unwrap();
        instance
    };
    let mut device = build(b, Role::Secondary);
    let mut host = build(a, Role::Primary);
    let step = |host: &mut Instance<LoopbackDriver>, device: &mut Instance<LoopbackDriver>| {
        let _ = host.process();
        let _ = device.process();
    };
    for _ in 0..32 {
        step(&mut host, &mut device);
    }

    let options = OpenOptions::default().window(window);
    host.open_endpoint(5, options).unwrap();
    device.open_endpoint(5, options).unwrap();
    host.connect(5).unwrap();
    for _ in 0..32 {
        step(&mut host, &mut device);
    }
    assert_eq!(host.endpoint_state(5), EndpointState::Connected);

    drop_frames(&tap, Side::A, data_drops);
    drop_frames(&tap, Side::B, ack_drops);

    let mut next = 0;
    let mut received = Vec::new();
    for _ in 0..5000 {
        while next < count {
            let payload = Bytes::from(format!("payload {next}"));
            match host.write(5, payload, WriteFlags::NONE) {
                Ok(_) => next += 1,
                Err(CpcError::WindowFull { .. }) => break,
                Err(err) => panic!("write failed: {err}"),
            }
        }
        step(&mut host, &mut device);
        while let Some(rx) = device.read(5).unwrap() {
            received.push(rx.to_bytes());
        }
        if received.len() == count && host.endpoint_info(5).unwrap().in_flight == 0 {
            break;
        }
        clock.advance(Duration::from_millis(50));
    }
    assert_eq!(host.endpoint_state(5), EndpointState::Connected);
    received
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_lossy_transfer_is_exact_and_ordered(
        window in 1u8..=7,
        count in 1usize..24,
        data_drops in proptest::collection::hash_set(0usize..48, 0..10),
        ack_drops in proptest::collection::hash_set(0usize..48, 0..6),
    ) {
        let received = transfer(window, count, data_drops, ack_drops);
        let expected: Vec<Bytes> = (0..count).map(|i| Bytes::from(format!("payload {i}"))).collect();
        prop_assert_eq!(received, expected);
    }

    #[test]
    fn prop_reassembly_ignores_chunking(
        frames in proptest::collection::vec(
            (any::<u8>(), any::<u8>(), proptest::collection::vec(any::<u8>(), 0..40)),
            1..8,
        ),
        noise in proptest::collection::vec(any::<u8>().prop_filter("not a flag", |b| *b != FLAG), 0..8),
        chunk in 1usize..32,
    ) {
        let encoded: Vec<Bytes> = frames
            .iter()
            .map(|(address, control, payload)| encode_frame(*address, *control, payload, &[]))
            .collect();
        let mut stream = noise.clone();
        for frame in &encoded {
            stream.extend_from_slice(frame);
        }

        let mut buffer = FrameBuffer::new();
        let mut out = Vec::new();
        for piece in stream.chunks(chunk) {
            out.extend(buffer.push(piece));
        }
        prop_assert_eq!(out, encoded);
    }
}
