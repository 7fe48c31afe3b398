//! Receive path: frame classification, sequence checks and delivery.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::Instance;
use crate::driver::Driver;
use crate::endpoint::arq::{classify, RxSequence};
use crate::endpoint::{EndpointFlags, EndpointState, SYSTEM_ENDPOINT};
use crate::error::{CpcError, Result};
use crate::pool::{BufferPools, PoolKey};
use crate::protocol::{
    crc16, seq_add, Control, RejectReason, SupervisoryFunction, UnnumberedKind,
};
use crate::security::SecurityError;

/// A received frame after its buffer handle has been released. Owns the
/// receive data buffer until it is queued or dropped.
struct Received {
    pools: Arc<BufferPools>,
    address: u8,
    fcs: u16,
    data: Option<(PoolKey, usize)>,
}

impl Received {
    /// Payload plus tag length.
    fn len(&self) -> usize {
        self.data.map_or(0, |(_, len)| len)
    }

    fn checksum_ok(&self) -> bool {
        match self.data {
            None => true,
            Some((key, _)) => self
                .pools
                .with_rx_data(key, |buf| crc16(buf.as_slice()) == self.fcs)
                .unwrap_or(false),
        }
    }

    fn bytes(&self) -> Bytes {
        match self.data {
            Some((key, _)) => self
                .pools
                .with_rx_data(key, |buf| Bytes::copy_from_slice(buf.as_slice()))
                .unwrap_or_default(),
            None => Bytes::new(),
        }
    }

    /// Trim the tag and wrap the buffer in a receive-queue item.
    fn into_rx_item(mut self, payload_len: usize) -> Result<PoolKey> {
        let Some((data, len)) = self.data.take() else {
            return Err(CpcError::EmptyPayload);
        };
        let _ = self.pools.with_rx_data(data, |buf| buf.truncate(payload_len));
        match self.pools.acquire_rx_item(data, payload_len, self.address) {
            Ok(item) => Ok(item),
            Err(err) => {
                self.data = Some((data, len));
                Err(err)
            }
        }
    }
}

impl Drop for Received {
    fn drop(&mut self) {
        if let Some((key, _)) = self.data.take() {
            self.pools.release_rx_data(key);
        }
    }
}

impl<D: Driver> Instance<D> {
    /// Drain the driver's rx-ready list.
    pub(super) fn run_rx(&mut self, _: usize) {
        while let Some(key) = self.driver.read() {
            self.on_frame(key);
            if self.fault.is_some() {
                break;
            }
        }
        self.schedule_pump();
    }

    fn on_frame(&mut self, key: PoolKey) {
        let Ok(pools) = self.pools() else {
            return;
        };
        let fields = pools.with_handle(key, |h| {
            h.leave_driver_list();
            (h.address, h.control, h.fcs)
        });
        let Ok((address, control, fcs)) = fields else {
            debug!("read returned a stale handle");
            return;
        };
        let data = pools.take_rx_data(key).ok().flatten();
        let _ = pools.release_and_free(key);
        let frame = Received {
            pools,
            address,
            fcs,
            data,
        };

        let control = match Control::decode(control) {
            Ok(control) => control,
            Err(err) => {
                debug!(endpoint = address, error = %err, "undecodable control byte");
                return;
            }
        };
        trace!(endpoint = address, ?control, len = frame.len(), "frame received");

        match control {
            Control::Information { seq, ack, .. } => self.on_information(frame, seq, ack),
            Control::Supervisory {
                function: SupervisoryFunction::Ack,
                ack,
            } => {
                if let Some(ep) = self.endpoint_mut(address) {
                    ep.stats.acks_received += 1;
                }
                self.process_ack(address, ack);
            }
            Control::Supervisory {
                function: SupervisoryFunction::Reject,
                ack,
            } => self.on_reject(frame, ack),
            Control::Unnumbered(UnnumberedKind::Information) => self.on_unnumbered(frame),
            Control::Unnumbered(UnnumberedKind::ResetSequence) if address == SYSTEM_ENDPOINT => {
                self.on_reset_request()
            }
            Control::Unnumbered(UnnumberedKind::Acknowledge) if address == SYSTEM_ENDPOINT => {
                self.on_reset_acknowledged()
            }
            other => debug!(endpoint = address, control = ?other, "frame ignored"),
        }
    }

    fn on_information(&mut self, frame: Received, seq: u8, ack: u8) {
        let id = frame.address;
        match self.endpoint(id).map(|ep| ep.state) {
            Some(EndpointState::Connected) => {}
            Some(EndpointState::Connecting) => {
                if let Some(ep) = self.endpoint_mut(id) {
                    ep.state = EndpointState::Connected;
                }
                debug!(endpoint = id, "peer data confirms connection");
            }
            _ if id == SYSTEM_ENDPOINT => {
                debug!("system frame before sequence reset dropped");
                return;
            }
            Some(EndpointState::Closing) => {
                debug!(endpoint = id, "frame for closing endpoint dropped");
                return;
            }
            _ => {
                self.reject(id, seq, RejectReason::UnreachableEndpoint);
                return;
            }
        }

        self.process_ack(id, ack);
        if frame.len() == 0 {
            return;
        }

        let Some(expected) = self.endpoint(id).map(|ep| ep.expected_seq) else {
            return;
        };
        if !frame.checksum_ok() {
            warn!(endpoint = id, seq, "payload checksum mismatch");
            self.reject(id, expected, RejectReason::ChecksumMismatch);
            return;
        }

        match classify(seq, expected) {
            RxSequence::Expected => self.accept(frame),
            RxSequence::Duplicate => {
                if let Some(ep) = self.endpoint_mut(id) {
                    ep.stats.duplicates += 1;
                    ep.pending_ack = true;
                }
                debug!(endpoint = id, seq, expected, "duplicate frame discarded");
            }
            RxSequence::OutOfOrder => {
                let first = self.endpoint_mut(id).is_some_and(|ep| {
                    ep.stats.dropped += 1;
                    !std::mem::replace(&mut ep.reject_sent, true)
                });
                if first {
                    self.reject(id, expected, RejectReason::SequenceMismatch);
                } else {
                    // The reject may have been lost; keep N(R) flowing.
                    if let Some(ep) = self.endpoint_mut(id) {
                        ep.pending_ack = true;
                    }
                    debug!(endpoint = id, seq, expected, "out-of-order frame discarded");
                }
            }
        }
    }

    /// Deliver the in-sequence frame.
    fn accept(&mut self, frame: Received) {
        let id = frame.address;
        let Some(expected) = self.endpoint(id).map(|ep| ep.expected_seq) else {
            return;
        };
        let payload_len = match self.verify_tag(&frame) {
            Ok(len) => len,
            Err(err) => {
                warn!(endpoint = id, error = %err, "security check failed");
                self.reject(id, expected, RejectReason::SecurityIssue);
                self.set_error_state(id, EndpointState::ErrorSecurityIncident);
                return;
            }
        };

        if id == SYSTEM_ENDPOINT {
            let bytes = frame.bytes();
            drop(frame);
            if let Some(ep) = self.endpoint_mut(id) {
                ep.expected_seq = seq_add(ep.expected_seq, 1);
                ep.pending_ack = true;
                ep.reject_sent = false;
                ep.stats.iframes_received += 1;
                ep.stats.bytes_received += bytes.len() as u64;
            }
            self.on_system_command(&bytes);
            return;
        }

        match frame.into_rx_item(payload_len) {
            Ok(item) => {
                if let Some(ep) = self.endpoint_mut(id) {
                    ep.rx_queue.push_back(item);
                    ep.expected_seq = seq_add(ep.expected_seq, 1);
                    ep.pending_ack = true;
                    ep.reject_sent = false;
                    ep.stats.iframes_received += 1;
                    ep.stats.bytes_received += payload_len as u64;
                    ep.fire_rx();
                }
            }
            Err(err) => {
                warn!(endpoint = id, error = %err, "no receive queue item");
                if let Some(ep) = self.endpoint_mut(id) {
                    ep.stats.dropped += 1;
                }
                self.reject(id, expected, RejectReason::OutOfMemory);
            }
        }
    }

    fn on_reject(&mut self, frame: Received, ack: u8) {
        let id = frame.address;
        if frame.len() == 0 || !frame.checksum_ok() {
            debug!(endpoint = id, "malformed reject dropped");
            return;
        }
        let reason = RejectReason::from_u8(frame.bytes()[0]);
        drop(frame);
        let Some(ep) = self.endpoint_mut(id) else {
            return;
        };
        ep.stats.rejects_received += 1;
        warn!(endpoint = id, ?reason, ack, "reject received");

        // An unreachable peer echoes the refused sequence, which says
        // nothing about delivery.
        if reason != RejectReason::UnreachableEndpoint {
            self.process_ack(id, ack);
        }
        let state = self.endpoint_state(id);
        if !matches!(state, EndpointState::Connected | EndpointState::Connecting) {
            return;
        }
        match reason {
            RejectReason::SequenceMismatch | RejectReason::ChecksumMismatch => {
                let frames = self.go_back_n(id);
                debug!(endpoint = id, frames, "go-back-N after reject");
            }
            RejectReason::UnreachableEndpoint => {
                self.set_error_state(id, EndpointState::ErrorDestinationUnreachable)
            }
            RejectReason::SecurityIssue => {
                self.set_error_state(id, EndpointState::ErrorSecurityIncident)
            }
            // Out of memory waits for the retransmit timer.
            _ => {}
        }
    }

    fn on_unnumbered(&mut self, frame: Received) {
        let id = frame.address;
        let accepts = self.endpoint(id).is_some_and(|ep| {
            ep.state == EndpointState::Connected && ep.flags.contains(EndpointFlags::UFRAME_ENABLE)
        });
        if !accepts {
            debug!(endpoint = id, "unnumbered frame not accepted");
            return;
        }
        if frame.len() == 0 || !frame.checksum_ok() {
            debug!(endpoint = id, "unnumbered frame with bad checksum dropped");
            return;
        }
        let payload_len = match self.verify_tag(&frame) {
            Ok(len) => len,
            Err(err) => {
                warn!(endpoint = id, error = %err, "unnumbered frame failed security check");
                return;
            }
        };

        match frame.into_rx_item(payload_len) {
            Ok(item) => {
                if let Some(ep) = self.endpoint_mut(id) {
                    ep.rx_queue.push_back(item);
                    ep.stats.uframes_received += 1;
                    ep.stats.bytes_received += payload_len as u64;
                    ep.fire_rx();
                }
            }
            Err(err) => {
                debug!(endpoint = id, error = %err, "unnumbered frame dropped");
                if let Some(ep) = self.endpoint_mut(id) {
                    ep.stats.dropped += 1;
                }
            }
        }
    }

    /// Check the security tag. Returns the payload length without the tag.
    fn verify_tag(&mut self, frame: &Received) -> std::result::Result<usize, SecurityError> {
        let tag_len = self.tag_len_for(frame.address);
        let len = frame.len();
        if tag_len == 0 {
            return Ok(len);
        }
        if len <= tag_len {
            return Err(SecurityError(format!(
                "{len} bytes cannot hold a {tag_len} byte tag"
            )));
        }
        let (Some((key, _)), Some(security)) = (frame.data, self.security.as_mut()) else {
            return Ok(len);
        };
        let checked = frame.pools.with_rx_data(key, |buf| {
            let (payload, tag) = buf.as_slice().split_at(len - tag_len);
            security.open(frame.address, payload, tag)
        });
        match checked {
            Ok(result) => result.map(|()| len - tag_len),
            Err(err) => Err(SecurityError(err.to_string())),
        }
    }
}
