//! System endpoint: sequence reset, handshake, property requests and
//! endpoint connect/disconnect negotiation.

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use super::Instance;
use crate::driver::Driver;
use crate::endpoint::system::ResetState;
use crate::endpoint::{CloseOrigin, EndpointId, EndpointState, SYSTEM_ENDPOINT};
use crate::error::FaultCause;
use crate::protocol::system::{
    status, CommandId, PropertyId, RemoteEndpointState, SystemCommand, PROTOCOL_VERSION,
};
use crate::protocol::{Control, UnnumberedKind};

impl<D: Driver> Instance<D> {
    /// Send RESET_SEQUENCE and start the retry timer.
    pub(super) fn begin_reset(&mut self) {
        self.reset_system_endpoint();
        if let Err(err) = self.queue_control(
            SYSTEM_ENDPOINT,
            Control::Unnumbered(UnnumberedKind::ResetSequence),
        ) {
            warn!(error = %err, "cannot queue sequence reset");
        }
        self.system.reset = ResetState::AwaitingAck { attempts: 1 };
        self.system.deadline = Some(self.clock.now() + self.config.reset_retry_interval());
        debug!("sequence reset sent");
    }

    /// Reset retry timer expiry.
    pub(super) fn run_system_timer(&mut self, _: usize) {
        let now = self.clock.now();
        if !self.system.deadline.is_some_and(|at| at <= now) {
            return;
        }
        let ResetState::AwaitingAck { attempts } = self.system.reset else {
            self.system.deadline = None;
            return;
        };
        if attempts > self.config.retransmit.max_retries {
            self.raise_fault(FaultCause::HandshakeTimeout);
            return;
        }

        if let Err(err) = self.queue_control(
            SYSTEM_ENDPOINT,
            Control::Unnumbered(UnnumberedKind::ResetSequence),
        ) {
            warn!(error = %err, "cannot queue sequence reset");
        }
        self.system.reset = ResetState::AwaitingAck {
            attempts: attempts.saturating_add(1),
        };
        self.system.deadline = Some(now + self.config.reset_retry_interval());
        warn!(attempt = attempts + 1, "sequence reset not acknowledged, retrying");
    }

    fn reset_system_endpoint(&mut self) {
        self.abort_writes(SYSTEM_ENDPOINT);
        if let Some(ep) = self.endpoint_mut(SYSTEM_ENDPOINT) {
            ep.reset_sequence();
            ep.rto.reset();
            ep.state = EndpointState::Open;
        }
        self.system.clear();
    }

    /// Peer asked for a sequence reset: it restarted.
    pub(super) fn on_reset_request(&mut self) {
        if let Err(err) = self.queue_control(
            SYSTEM_ENDPOINT,
            Control::Unnumbered(UnnumberedKind::Acknowledge),
        ) {
            warn!(error = %err, "cannot acknowledge sequence reset");
        }
        self.reset_system_endpoint();

        let stale: Vec<EndpointId> = self
            .endpoints
            .iter()
            .flatten()
            .filter(|ep| {
                ep.id != SYSTEM_ENDPOINT
                    && matches!(ep.state, EndpointState::Connected | EndpointState::Connecting)
            })
            .map(|ep| ep.id)
            .collect();
        for id in stale {
            self.set_error_state(id, EndpointState::ErrorDestinationUnreachable);
        }

        self.system.reset = ResetState::Done;
        self.system.deadline = None;
        info!("peer requested sequence reset");
        self.system_connected();
    }

    pub(super) fn on_reset_acknowledged(&mut self) {
        if !matches!(self.system.reset, ResetState::AwaitingAck { .. }) {
            debug!("unexpected reset acknowledgement ignored");
            return;
        }
        self.system.reset = ResetState::Done;
        self.system.deadline = None;
        debug!("sequence reset acknowledged");
        self.system_connected();
    }

    /// Endpoint 0 is usable: start the property handshake.
    fn system_connected(&mut self) {
        if let Some(ep) = self.endpoint_mut(SYSTEM_ENDPOINT) {
            ep.state = EndpointState::Connected;
        }
        for property in [
            PropertyId::ProtocolVersion,
            PropertyId::Capabilities,
            PropertyId::RxCapability,
        ] {
            if let Err(err) = self.system.request(CommandId::PropValueGet, property, &[]) {
                warn!(?property, error = %err, "cannot queue handshake request");
            }
        }
        self.schedule_pump();
    }

    /// Handle one command received on endpoint 0.
    pub(super) fn on_system_command(&mut self, bytes: &[u8]) {
        let command = match SystemCommand::decode(bytes) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, "malformed system command");
                return;
            }
        };
        debug!(command = ?command.command, seq = command.seq, "system command");

        match command.command {
            CommandId::Noop => self.reply(SystemCommand::new(CommandId::Noop, command.seq, Bytes::new())),
            CommandId::Reset => self.reply(SystemCommand::property(
                CommandId::PropValueIs,
                command.seq,
                PropertyId::LastStatus,
                &status::OK.to_le_bytes(),
            )),
            CommandId::PropValueGet => match command.property_value() {
                Ok((property, _)) => self.reply_property(command.seq, property),
                Err(err) => warn!(error = %err, "malformed property request"),
            },
            CommandId::PropValueSet => match command.property_value() {
                Ok((PropertyId::EndpointState(id), value)) => {
                    let requested = RemoteEndpointState::from_u8(value.first().copied().unwrap_or(0));
                    let granted = self.on_remote_state_request(id, requested);
                    self.reply(SystemCommand::property(
                        CommandId::PropValueIs,
                        command.seq,
                        PropertyId::EndpointState(id),
                        &[granted as u8],
                    ));
                }
                // Other properties are read-only.
                Ok((property, _)) => self.reply_property(command.seq, property),
                Err(err) => warn!(error = %err, "malformed property update"),
            },
            CommandId::PropValueIs => {
                self.system.complete(command.seq);
                match command.property_value() {
                    Ok((property, value)) => self.on_property_report(property, value),
                    Err(err) => warn!(error = %err, "malformed property report"),
                }
            }
        }
    }

    fn reply(&mut self, command: SystemCommand) {
        if let Err(err) = self.system.enqueue(command) {
            warn!(error = %err, "system reply dropped");
        }
        self.schedule_pump();
    }

    fn reply_property(&mut self, seq: u8, property: PropertyId) {
        let command = match self.local_property(property) {
            Some(value) => SystemCommand::property(CommandId::PropValueIs, seq, property, &value),
            None => SystemCommand::property(
                CommandId::PropValueIs,
                seq,
                PropertyId::LastStatus,
                &status::NOT_FOUND.to_le_bytes(),
            ),
        };
        self.reply(command);
    }

    fn local_property(&self, property: PropertyId) -> Option<Vec<u8>> {
        let value = match property {
            PropertyId::LastStatus => status::OK.to_le_bytes().to_vec(),
            PropertyId::ProtocolVersion => vec![PROTOCOL_VERSION],
            PropertyId::Capabilities => self.config.capabilities.to_le_bytes().to_vec(),
            PropertyId::RxCapability => (self.config.max_rx_payload as u16).to_le_bytes().to_vec(),
            PropertyId::EndpointState(id) => vec![self.advertised_state(id) as u8],
            PropertyId::Other(_) => return None,
        };
        Some(value)
    }

    fn advertised_state(&self, id: EndpointId) -> RemoteEndpointState {
        match self.endpoint_state(id) {
            EndpointState::Connected => RemoteEndpointState::Connected,
            EndpointState::Open | EndpointState::Connecting => RemoteEndpointState::Open,
            _ => RemoteEndpointState::Closed,
        }
    }

    /// Peer asks to connect or disconnect endpoint `id`. Returns the state
    /// to report back.
    fn on_remote_state_request(
        &mut self,
        id: EndpointId,
        requested: RemoteEndpointState,
    ) -> RemoteEndpointState {
        if id == SYSTEM_ENDPOINT {
            return RemoteEndpointState::Closed;
        }
        let state = self.endpoint_state(id);
        let origin = self.endpoint(id).and_then(|ep| ep.close_origin);

        if requested == RemoteEndpointState::Connected {
            let acceptable = matches!(
                state,
                EndpointState::Open | EndpointState::Connecting | EndpointState::Connected
            );
            if !self.system.handshake_complete || !acceptable {
                debug!(endpoint = id, %state, "peer connect refused");
                return RemoteEndpointState::Closed;
            }
            self.abort_writes(id);
            if let Some(ep) = self.endpoint_mut(id) {
                ep.reset_sequence();
                ep.state = EndpointState::Connected;
                ep.close_origin = None;
            }
            info!(endpoint = id, "endpoint connected by peer");
            return RemoteEndpointState::Connected;
        }

        match state {
            EndpointState::Connected | EndpointState::Connecting => self.remote_close(id),
            EndpointState::Closing if origin == Some(CloseOrigin::Local) => self.free_endpoint(id),
            _ => {}
        }
        RemoteEndpointState::Closed
    }

    /// The peer disconnected a connected endpoint.
    fn remote_close(&mut self, id: EndpointId) {
        self.abort_writes(id);
        if let Some(ep) = self.endpoint_mut(id) {
            ep.state = EndpointState::Closing;
            ep.close_origin = Some(CloseOrigin::Remote);
            ep.pending_ack = false;
            ep.fire_error();
        }
        info!(endpoint = id, "endpoint closed by peer");
    }

    fn on_property_report(&mut self, property: PropertyId, value: &[u8]) {
        match property {
            PropertyId::ProtocolVersion => {
                let Some(&remote) = value.first() else {
                    return;
                };
                self.system.remote.protocol_version = Some(remote);
                if remote != PROTOCOL_VERSION {
                    self.raise_fault(FaultCause::HandshakeMismatch {
                        local: PROTOCOL_VERSION,
                        remote,
                    });
                    return;
                }
            }
            PropertyId::Capabilities => {
                let Some(bytes) = value.get(..4) else {
                    return;
                };
                let remote = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                self.system.remote.capabilities = Some(remote);
                let missing = self.config.required_capabilities & !remote;
                if missing != 0 {
                    self.raise_fault(FaultCause::CapabilityMismatch { missing });
                    return;
                }
            }
            PropertyId::RxCapability => {
                let Some(bytes) = value.get(..2) else {
                    return;
                };
                self.system.remote.rx_capability = Some(u16::from_le_bytes([bytes[0], bytes[1]]));
            }
            PropertyId::EndpointState(id) => {
                let reported = RemoteEndpointState::from_u8(value.first().copied().unwrap_or(0));
                self.on_remote_state_report(id, reported);
            }
            PropertyId::LastStatus | PropertyId::Other(_) => {
                debug!(?property, "property report ignored");
            }
        }

        if !self.system.handshake_complete && self.system.remote.is_complete() {
            self.system.handshake_complete = true;
            info!(
                remote_version = ?self.system.remote.protocol_version,
                remote_capabilities = ?self.system.remote.capabilities,
                remote_rx_capability = ?self.system.remote.rx_capability,
                "system endpoint handshake complete"
            );
        }
    }

    /// Peer reported the state of endpoint `id`, usually answering our
    /// connect or close request.
    fn on_remote_state_report(&mut self, id: EndpointId, reported: RemoteEndpointState) {
        let Some(ep) = self.endpoint(id) else {
            return;
        };
        match (ep.state, ep.close_origin, reported) {
            (EndpointState::Connecting, _, RemoteEndpointState::Connected) => {
                if let Some(ep) = self.endpoint_mut(id) {
                    ep.state = EndpointState::Connected;
                }
                info!(endpoint = id, "endpoint connected");
            }
            (EndpointState::Connecting, _, _) => {
                self.set_error_state(id, EndpointState::ErrorDestinationUnreachable)
            }
            (EndpointState::Closing, Some(CloseOrigin::Local), RemoteEndpointState::Closed) => {
                self.free_endpoint(id)
            }
            (EndpointState::Connected, _, RemoteEndpointState::Closed) => self.remote_close(id),
            (state, _, reported) => {
                debug!(endpoint = id, %state, ?reported, "endpoint state report ignored")
            }
        }
    }

    /// Record a fatal fault. Only the first one sticks.
    pub(super) fn raise_fault(&mut self, cause: FaultCause) {
        if self.fault.is_some() {
            return;
        }
        self.fault = Some(cause);
        self.system.deadline = None;
        error!(%cause, instance = self.config.instance_id, "cpc instance fault");

        let connected: Vec<EndpointId> = self
            .endpoints
            .iter()
            .flatten()
            .filter(|ep| {
                ep.id != SYSTEM_ENDPOINT
                    && matches!(ep.state, EndpointState::Connected | EndpointState::Connecting)
            })
            .map(|ep| ep.id)
            .collect();
        for id in connected {
            self.set_error_state(id, EndpointState::ErrorDestinationUnreachable);
        }
    }
}
