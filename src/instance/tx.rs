//! Transmit path: frame assembly, the transmit pump, acknowledgement
//! processing and go-back-N retransmission.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use super::{Instance, Lifecycle};
use crate::backpressure::BudgetGuard;
use crate::driver::{Driver, TxFrame};
use crate::endpoint::arq::acked_count;
use crate::endpoint::{EndpointId, EndpointState, WriteStatus, SYSTEM_ENDPOINT};
use crate::error::{CpcError, FaultCause, Result};
use crate::pool::{
    lock, BufferPools, CoreList, DriverList, FreedHandle, HandleKind, Payload, PoolKey,
};
use crate::protocol::{
    crc16, frame_checksum, seq_add, Control, Header, RejectReason, UnnumberedKind,
};
use crate::security::SecurityError;

impl<D: Driver> Instance<D> {
    /// Build a data frame and queue it. I-frames take the endpoint's next
    /// send sequence and join its unacknowledged list.
    ///
    /// `reservation` is a transmit-data slot; the handle takes it over.
    pub(super) fn enqueue_frame(
        &mut self,
        id: EndpointId,
        payload: Bytes,
        unnumbered: bool,
        token: Option<u32>,
        reservation: BudgetGuard<'_>,
    ) -> Result<()> {
        let pools = self.pools()?;
        let seq = self
            .endpoint(id)
            .ok_or(CpcError::EndpointNotOpen(id))?
            .next_seq;
        let key = pools.acquire_tx_handle(HandleKind::Data)?;
        reservation.disarm();

        let control = if unnumbered {
            Control::Unnumbered(UnnumberedKind::Information)
        } else {
            Control::information(seq, 0)
        };
        if let Err(err) = self.fill_data_handle(&pools, key, id, payload, control, token) {
            let _ = pools.release_and_free(key);
            return Err(err);
        }

        if let Some(ep) = self.endpoint_mut(id) {
            ep.handle_refs += 1;
            if !unnumbered {
                ep.next_seq = seq_add(ep.next_seq, 1);
                ep.unacked.push_back(key);
            }
        }
        self.tx_queue.push_back(key);
        self.schedule_pump();
        Ok(())
    }

    fn fill_data_handle(
        &mut self,
        pools: &BufferPools,
        key: PoolKey,
        id: EndpointId,
        payload: Bytes,
        control: Control,
        token: Option<u32>,
    ) -> Result<()> {
        let tag_len = self.tag_len_for(id);
        let mut tag = Vec::new();
        if tag_len > 0 {
            if let Some(security) = self.security.as_mut() {
                tag = security.seal(id, &payload)?;
            }
            if tag.len() != tag_len {
                return Err(SecurityError(format!(
                    "sealed tag is {} bytes, expected {tag_len}",
                    tag.len()
                ))
                .into());
            }
            pools.attach_tag(key, &tag)?;
        }

        let control = control.encode();
        let header = Header::for_payload(id, control, payload.len(), tag_len);
        pools.set_header(key, header.encode())?;
        let fcs = frame_checksum(&payload, &tag);
        pools.with_handle(key, |h| {
            h.address = id;
            h.control = control;
            h.fcs = fcs;
            h.payload_len = payload.len();
            h.token = token;
            h.payload = Payload::Tx(payload);
            h.enter_core_list(CoreList::TxQueue)
        })?
    }

    /// Queue an S-frame or U-control frame without payload.
    pub(super) fn queue_control(&mut self, address: u8, control: Control) -> Result<()> {
        let pools = self.pools()?;
        let key = pools.acquire_tx_handle(HandleKind::Supervisory)?;
        self.queue_supervisory(&pools, key, address, control.encode(), 0, 0)
    }

    /// Queue a REJECT carrying `reason` with N(R) = `ack`.
    pub(super) fn send_reject(&mut self, address: u8, ack: u8, reason: RejectReason) -> Result<()> {
        let pools = self.pools()?;
        let key = pools.acquire_tx_handle(HandleKind::Reject)?;
        if let Err(err) = pools.set_reject_reason(key, reason.as_u8()) {
            let _ = pools.release_and_free(key);
            return Err(err);
        }
        let fcs = crc16(&[reason.as_u8()]);
        self.queue_supervisory(&pools, key, address, Control::reject(ack).encode(), 1, fcs)?;

        if let Some(ep) = self.endpoint_mut(address) {
            ep.stats.rejects_sent += 1;
        }
        warn!(endpoint = address, ?reason, ack, "reject sent");
        Ok(())
    }

    /// `send_reject`, logging instead of failing.
    pub(super) fn reject(&mut self, address: u8, ack: u8, reason: RejectReason) {
        if let Err(err) = self.send_reject(address, ack, reason) {
            warn!(endpoint = address, ?reason, error = %err, "cannot queue reject");
        }
    }

    fn queue_supervisory(
        &mut self,
        pools: &BufferPools,
        key: PoolKey,
        address: u8,
        control: u8,
        payload_len: usize,
        fcs: u16,
    ) -> Result<()> {
        let header = Header::for_payload(address, control, payload_len, 0);
        let filled = pools.set_header(key, header.encode()).and_then(|()| {
            pools.with_handle(key, |h| {
                h.address = address;
                h.control = control;
                h.payload_len = payload_len;
                h.fcs = fcs;
                h.enter_core_list(CoreList::SupervisoryQueue)
            })?
        });
        if let Err(err) = filled {
            let _ = pools.release_and_free(key);
            return Err(err);
        }
        self.sframe_queue.push_back(key);
        self.schedule_pump();
        Ok(())
    }

    /// Transmit pump: feed system commands into endpoint 0, flush pending
    /// acknowledgements, then hand queued frames to the driver until it
    /// refuses one.
    pub(super) fn run_pump(&mut self, _: usize) {
        if self.fault.is_some() || self.lifecycle != Lifecycle::Started {
            return;
        }
        let Ok(pools) = self.pools() else {
            return;
        };
        self.feed_system_endpoint();
        self.flush_acks(&pools);

        while self.driver.is_transmit_ready() {
            let (key, supervisory) = if let Some(key) = self.sframe_queue.pop_front() {
                (key, true)
            } else if let Some(key) = self.tx_queue.pop_front() {
                (key, false)
            } else {
                break;
            };

            match self.transmit(&pools, key) {
                Ok(()) => {}
                Err(err) if pools.handles().contains(key) => {
                    if !matches!(err, CpcError::DriverNotReady) {
                        warn!(error = %err, "driver write failed");
                    }
                    if supervisory {
                        self.sframe_queue.push_front(key);
                    } else {
                        self.tx_queue.push_front(key);
                    }
                    break;
                }
                Err(err) => debug!(error = %err, "dropping stale transmit entry"),
            }
        }
    }

    fn feed_system_endpoint(&mut self) {
        loop {
            let Some(ep) = self.endpoint(SYSTEM_ENDPOINT) else {
                return;
            };
            if ep.state != EndpointState::Connected || ep.in_flight() >= ep.window {
                return;
            }
            let Some(command) = self.system.front() else {
                return;
            };
            let payload = command.encode();
            let Ok(pools) = self.pools() else {
                return;
            };
            if pools.tx_data().try_reserve().is_err() {
                return;
            }
            let reservation = BudgetGuard::new(pools.tx_data());
            if let Err(err) = self.enqueue_frame(SYSTEM_ENDPOINT, payload, false, None, reservation) {
                warn!(error = %err, "cannot queue system command");
                return;
            }
            self.system.pop_front();
        }
    }

    fn flush_acks(&mut self, pools: &BufferPools) {
        let pending: Vec<(EndpointId, u8)> = self
            .endpoints
            .iter()
            .flatten()
            .filter(|ep| ep.pending_ack)
            .map(|ep| (ep.id, ep.expected_seq))
            .collect();

        for (id, ack) in pending {
            let piggyback = self.tx_queue.iter().any(|&key| {
                pools
                    .with_handle(key, |h| h.address == id && h.seq().is_some())
                    .unwrap_or(false)
            });
            if piggyback {
                continue;
            }
            if let Err(err) = self.queue_control(id, Control::ack(ack)) {
                debug!(endpoint = id, error = %err, "ack deferred");
                break;
            }
            if let Some(ep) = self.endpoint_mut(id) {
                ep.pending_ack = false;
                ep.stats.acks_sent += 1;
            }
        }
    }

    /// Hand one frame to the driver. On failure the handle is back on the
    /// list it came from.
    fn transmit(&mut self, pools: &Arc<BufferPools>, key: PoolKey) -> Result<()> {
        let (kind, address, control, payload, fcs, retransmitted) = pools.with_handle(key, |h| {
            (h.kind, h.address, h.control, h.payload.clone(), h.fcs, h.retransmitted)
        })?;
        let information = kind == HandleKind::Data && Control::decode(control)?.is_information();

        let mut header = pools.header_bytes(key)?;
        if information {
            let ack = self.endpoint(address).map_or(0, |ep| ep.expected_seq);
            let mut parsed = Header::decode_unchecked(&header)?;
            parsed.control = Control::decode(control)?.with_ack(ack).encode();
            header = parsed.encode();
            pools.set_header(key, header)?;
            pools.with_handle(key, |h| h.control = parsed.control)?;
        }

        let payload = match payload {
            Payload::Tx(bytes) => bytes,
            Payload::Reject(_) => Bytes::copy_from_slice(&[pools.reject_reason(key)?]),
            Payload::Rx(_) | Payload::None => Bytes::new(),
        };
        let len = payload.len();
        let frame = TxFrame {
            handle: key,
            header,
            payload,
            tag: pools.tag_bytes(key)?,
            fcs,
        };

        // The core keeps its reference to an I-frame until it is acknowledged;
        // every other frame passes its reference to the driver.
        if information {
            pools.retain(key)?;
        }
        let from = pools.with_handle(key, |h| {
            h.enter_driver_list(DriverList::TxPending)?;
            Ok::<_, CpcError>(h.leave_core_list())
        })??;

        if let Err(err) = self.driver.write(frame) {
            let _ = pools.with_handle(key, |h| {
                h.leave_driver_list();
                if let Some(list) = from {
                    let _ = h.enter_core_list(list);
                }
            });
            if information {
                let _ = pools.release_ref(key);
            }
            return Err(err);
        }

        let now = self.clock.now();
        if information {
            pools.with_handle(key, |h| {
                h.sent_at.get_or_insert(now);
                h.enter_core_list(CoreList::Retransmit)
            })??;
        }
        if let Some(ep) = self.endpoint_mut(address) {
            match kind {
                HandleKind::Data if information => {
                    ep.pending_ack = false;
                    ep.stats.iframes_sent += 1;
                    ep.stats.bytes_sent += len as u64;
                    if retransmitted {
                        ep.stats.retransmits += 1;
                    }
                }
                HandleKind::Data => {
                    ep.stats.uframes_sent += 1;
                    ep.stats.bytes_sent += len as u64;
                }
                _ => {}
            }
        }
        trace!(endpoint = address, control, len, "frame written");
        Ok(())
    }

    /// Drain transmit completions reported by the driver.
    pub(super) fn run_tx_complete(&mut self, _: usize) {
        let keys: Vec<PoolKey> = lock(&self.completions).drain(..).collect();
        for key in keys {
            self.on_transmit_complete(key);
        }
        self.schedule_pump();
    }

    fn on_transmit_complete(&mut self, key: PoolKey) {
        let Ok(pools) = self.pools() else {
            return;
        };
        let fields = pools.with_handle(key, |h| {
            h.leave_driver_list();
            (h.address, h.kind, h.seq().is_some(), h.core_list())
        });
        let Ok((address, kind, information, list)) = fields else {
            debug!("completion for a stale handle");
            return;
        };
        let freed = self.drop_ref(&pools, key);

        if kind == HandleKind::Data && information {
            if list == Some(CoreList::Retransmit) {
                let now = self.clock.now();
                if let Some(ep) = self.endpoint_mut(address) {
                    if ep.retransmit_deadline.is_none() {
                        ep.retransmit_deadline = Some(now + ep.rto.current());
                    }
                }
            }
        } else if let Some(freed) = freed.filter(|f| f.kind == HandleKind::Data) {
            if let Some(ep) = self.endpoint_mut(address) {
                ep.fire_write_complete(freed.token, WriteStatus::Sent);
            }
        }
    }

    /// Drop one reference; free the handle when none remain.
    fn drop_ref(&mut self, pools: &BufferPools, key: PoolKey) -> Option<FreedHandle> {
        match pools.release_ref(key) {
            Ok(0) => {}
            Ok(_) => return None,
            Err(err) => {
                debug!(error = %err, "release of an unreferenced handle");
                return None;
            }
        }
        match pools.free_handle(key) {
            Ok(freed) => {
                if freed.kind == HandleKind::Data {
                    if let Some(ep) = self.endpoint_mut(freed.address) {
                        ep.handle_refs = ep.handle_refs.saturating_sub(1);
                    }
                }
                Some(freed)
            }
            Err(err) => {
                debug!(error = %err, "handle not freed");
                None
            }
        }
    }

    /// Release every frame before N(R) = `ack`. Out-of-window values are
    /// ignored.
    pub(super) fn process_ack(&mut self, id: EndpointId, ack: u8) {
        let Ok(pools) = self.pools() else {
            return;
        };
        let Some(ep) = self.endpoint(id) else {
            return;
        };
        let Some(count) = acked_count(ep.send_base(), ack, ep.in_flight()) else {
            debug!(endpoint = id, ack, base = ep.send_base(), "ack outside window ignored");
            return;
        };
        if count == 0 {
            return;
        }

        let now = self.clock.now();
        for _ in 0..count {
            let Some(key) = self.endpoint_mut(id).and_then(|ep| ep.unacked.pop_front()) else {
                break;
            };
            self.tx_queue.retain(|&queued| queued != key);
            let acked = pools.with_handle(key, |h| {
                h.leave_core_list();
                (h.token, h.sent_at, h.retransmitted)
            });
            if let (Ok((token, sent_at, retransmitted)), Some(ep)) = (acked, self.endpoint_mut(id)) {
                if let Some(at) = sent_at.filter(|_| !retransmitted) {
                    ep.rto.sample(now.saturating_duration_since(at));
                }
                ep.fire_write_complete(token, WriteStatus::Acked);
            }
            self.drop_ref(&pools, key);
        }

        if let Some(ep) = self.endpoints.get_mut(id as usize).and_then(Option::as_mut) {
            ep.retry_count = 0;
            if ep.unacked.is_empty() {
                ep.retransmit_deadline = None;
                self.dispatcher.cancel(&ep.timer_work);
            } else {
                ep.retransmit_deadline = Some(now + ep.rto.current());
            }
        }
        trace!(endpoint = id, ack, count, "frames acknowledged");
        self.schedule_pump();
    }

    /// Queue every sent, unacknowledged frame the driver no longer holds
    /// ahead of other traffic. Returns how many were queued.
    pub(super) fn go_back_n(&mut self, id: EndpointId) -> usize {
        let Ok(pools) = self.pools() else {
            return 0;
        };
        let Some(ep) = self.endpoint(id) else {
            return 0;
        };
        let requeue: Vec<PoolKey> = ep
            .unacked
            .iter()
            .copied()
            .filter(|&key| {
                pools
                    .with_handle(key, |h| {
                        if h.core_list() != Some(CoreList::Retransmit) || h.driver_list().is_some() {
                            return false;
                        }
                        h.leave_core_list();
                        h.retransmitted = true;
                        h.enter_core_list(CoreList::TxQueue).is_ok()
                    })
                    .unwrap_or(false)
            })
            .collect();

        for &key in requeue.iter().rev() {
            self.tx_queue.push_front(key);
        }
        if !requeue.is_empty() {
            self.schedule_pump();
        }
        requeue.len()
    }

    /// Retransmit timer expiry for endpoint `data`.
    pub(super) fn run_retransmit(&mut self, data: usize) {
        let id = data as EndpointId;
        let now = self.clock.now();
        let max_retries = self.config.retransmit.max_retries;
        let Some(ep) = self.endpoint_mut(id) else {
            return;
        };
        if !ep.retransmit_deadline.is_some_and(|at| at <= now) {
            return;
        }

        ep.retry_count = ep.retry_count.saturating_add(1);
        if ep.retry_count > max_retries {
            let retries = ep.retry_count - 1;
            warn!(endpoint = id, retries, "retransmit limit reached");
            self.set_error_state(id, EndpointState::ErrorDestinationUnreachable);
            return;
        }
        ep.rto.backoff();
        ep.retransmit_deadline = Some(now + ep.rto.current());
        let (attempt, rto) = (ep.retry_count, ep.rto.current());

        let frames = self.go_back_n(id);
        warn!(
            endpoint = id,
            attempt,
            frames,
            rto_ms = rto.as_millis() as u64,
            "retransmit timeout"
        );
    }

    /// Move an endpoint into an error state. Outstanding writes are aborted
    /// and the error callback fires once.
    pub(super) fn set_error_state(&mut self, id: EndpointId, state: EndpointState) {
        match self.endpoint(id) {
            Some(ep) if ep.state != state => {}
            _ => return,
        }
        self.abort_writes(id);
        if let Some(ep) = self.endpoint_mut(id) {
            ep.state = state;
            ep.pending_ack = false;
            ep.fire_error();
        }
        error!(endpoint = id, %state, "endpoint entered error state");
        if id == SYSTEM_ENDPOINT {
            self.raise_fault(FaultCause::SystemEndpointUnreachable);
        }
    }

    /// Drop queued and unacknowledged data frames of an endpoint; each
    /// write completes `Aborted`.
    pub(super) fn abort_writes(&mut self, id: EndpointId) {
        let Ok(pools) = self.pools() else {
            return;
        };
        let Some(ep) = self.endpoint_mut(id) else {
            return;
        };
        let mut keys: Vec<PoolKey> = ep.unacked.drain(..).collect();
        let queued: Vec<PoolKey> = self
            .tx_queue
            .iter()
            .copied()
            .filter(|key| !keys.contains(key))
            .filter(|&key| pools.with_handle(key, |h| h.address == id).unwrap_or(false))
            .collect();
        keys.extend(queued);
        self.tx_queue.retain(|key| !keys.contains(key));

        for &key in &keys {
            let token = pools
                .with_handle(key, |h| {
                    h.leave_core_list();
                    h.token
                })
                .ok()
                .flatten();
            if let Some(ep) = self.endpoint_mut(id) {
                ep.fire_write_complete(token, WriteStatus::Aborted);
            }
            self.drop_ref(&pools, key);
        }

        if let Some(ep) = self.endpoints.get_mut(id as usize).and_then(Option::as_mut) {
            ep.retransmit_deadline = None;
            ep.retry_count = 0;
            self.dispatcher.cancel(&ep.timer_work);
        }
        if !keys.is_empty() {
            debug!(endpoint = id, frames = keys.len(), "writes aborted");
        }
    }
}
