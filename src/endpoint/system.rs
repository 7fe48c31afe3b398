//! State of the system endpoint (id 0): sequence reset progress, outbound
//! command queue, outstanding requests and what the peer reported about
//! itself.

use std::collections::VecDeque;
use std::time::Instant;

use crate::dispatcher::DispatchHandle;
use crate::error::{CpcError, Result};
use crate::pool::{Pool, PoolKey, PoolKind, Poolable};
use crate::protocol::system::{CommandId, PropertyId, SystemCommand};

/// Outstanding request awaiting its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContext {
    pub command: CommandId,
    pub seq: u8,
    pub property: Option<PropertyId>,
}

impl Default for CommandContext {
    fn default() -> Self {
        Self {
            command: CommandId::Noop,
            seq: 0,
            property: None,
        }
    }
}

impl Poolable for CommandContext {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What the peer reported during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    pub protocol_version: Option<u8>,
    pub capabilities: Option<u32>,
    /// Largest payload the peer accepts.
    pub rx_capability: Option<u16>,
}

impl RemoteInfo {
    pub fn is_complete(&self) -> bool {
        self.protocol_version.is_some() && self.capabilities.is_some() && self.rx_capability.is_some()
    }
}

/// Progress of the sequence reset exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    Idle,
    AwaitingAck { attempts: u8 },
    Done,
}

pub(crate) struct SystemState {
    pub(crate) reset: ResetState,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timer_work: DispatchHandle,
    pub(crate) remote: RemoteInfo,
    pub(crate) handshake_complete: bool,
    next_seq: u8,
    outbound: VecDeque<SystemCommand>,
    queue_limit: usize,
    pending: Vec<PoolKey>,
    contexts: Pool<CommandContext>,
}

impl SystemState {
    pub(crate) fn new(queue_limit: usize, contexts: usize, timer_work: DispatchHandle) -> Self {
        Self {
            reset: ResetState::Idle,
            deadline: None,
            timer_work,
            remote: RemoteInfo::default(),
            handshake_complete: false,
            next_seq: 0,
            outbound: VecDeque::new(),
            queue_limit,
            pending: Vec::new(),
            contexts: Pool::new(PoolKind::CommandContext, contexts, CommandContext::default),
        }
    }

    /// Queue a reply or notification.
    pub(crate) fn enqueue(&mut self, command: SystemCommand) -> Result<()> {
        if self.outbound.len() >= self.queue_limit {
            return Err(CpcError::ResourceExhausted(PoolKind::CommandContext));
        }
        self.outbound.push_back(command);
        Ok(())
    }

    /// Queue a request and hold a context until its reply arrives.
    pub(crate) fn request(
        &mut self,
        command: CommandId,
        property: PropertyId,
        value: &[u8],
    ) -> Result<u8> {
        let seq = self.next_seq;
        let key = self.contexts.acquire()?;
        self.contexts.with(key, |ctx| {
            *ctx = CommandContext {
                command,
                seq,
                property: Some(property),
            }
        })?;
        if let Err(err) = self.enqueue(SystemCommand::property(command, seq, property, value)) {
            let _ = self.contexts.release(key);
            return Err(err);
        }
        self.pending.push(key);
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(seq)
    }

    /// Release and return the context waiting for reply `seq`.
    pub(crate) fn complete(&mut self, seq: u8) -> Option<CommandContext> {
        let pos = self.pending.iter().position(|&key| {
            self.contexts
                .with(key, |ctx| ctx.seq == seq)
                .unwrap_or(false)
        })?;
        let key = self.pending.remove(pos);
        let ctx = self.contexts.with(key, |ctx| *ctx).ok();
        let _ = self.contexts.release(key);
        ctx
    }

    pub(crate) fn front(&self) -> Option<&SystemCommand> {
        self.outbound.front()
    }

    pub(crate) fn pop_front(&mut self) -> Option<SystemCommand> {
        self.outbound.pop_front()
    }

    pub(crate) fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Forget queued commands, outstanding requests and peer information.
    pub(crate) fn clear(&mut self) {
        self.outbound.clear();
        for key in self.pending.drain(..) {
            let _ = self.contexts.release(key);
        }
        self.remote = RemoteInfo::default();
        self.handshake_complete = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;

    fn state(limit: usize, contexts: usize) -> SystemState {
        let dispatcher: Dispatcher<()> = Dispatcher::new();
        SystemState::new(limit, contexts, dispatcher.handle())
    }

    #[test]
    fn test_request_and_complete() {
        let mut sys = state(4, 2);
        let seq = sys
            .request(CommandId::PropValueGet, PropertyId::ProtocolVersion, &[])
            .unwrap();
        assert_eq!(sys.pending_requests(), 1);
        assert_eq!(sys.outbound_len(), 1);

        let ctx = sys.complete(seq).unwrap();
        assert_eq!(ctx.property, Some(PropertyId::ProtocolVersion));
        assert_eq!(sys.pending_requests(), 0);
        assert!(sys.complete(seq).is_none());
    }

    #[test]
    fn test_context_exhaustion() {
        let mut sys = state(8, 1);
        sys.request(CommandId::PropValueGet, PropertyId::Capabilities, &[])
            .unwrap();
        assert!(matches!(
            sys.request(CommandId::PropValueGet, PropertyId::RxCapability, &[]),
            Err(CpcError::ResourceExhausted(PoolKind::CommandContext))
        ));
    }

    #[test]
    fn test_queue_limit_releases_context() {
        let mut sys = state(1, 4);
        sys.enqueue(SystemCommand::new(CommandId::Noop, 0, Default::default()))
            .unwrap();
        assert!(sys
            .request(CommandId::PropValueSet, PropertyId::EndpointState(3), &[2])
            .is_err());
        assert_eq!(sys.pending_requests(), 0);
        assert_eq!(sys.contexts.used(), 0);
    }

    #[test]
    fn test_clear() {
        let mut sys = state(4, 4);
        sys.request(CommandId::PropValueGet, PropertyId::Capabilities, &[])
            .unwrap();
        sys.remote.protocol_version = Some(5);
        sys.handshake_complete = true;

        sys.clear();
        assert_eq!(sys.pending_requests(), 0);
        assert_eq!(sys.remote, RemoteInfo::default());
        assert!(!sys.handshake_complete);
        assert!(sys.front().is_none());
    }
}
