//! Tokio task that drives an [`Instance`].
//!
//! [`spawn_core_task`] moves a started instance behind a mutex and calls
//! `process()` whenever driver events or API calls queue work, and whenever
//! the next retransmit or handshake deadline elapses. [`CoreHandle`] exposes
//! the endpoint operations to async code, including a write that waits for
//! window space and transmit buffers.
//!
//! ```text
//! driver events ─► Dispatcher ─► wake ─┐
//! timer deadline ──────────────────────┼─► core task: lock · process · unlock
//! CoreHandle (write / connect / ...) ──┘             │
//!                                                    ▼
//!                                     progress ─► waiting CoreHandle calls
//! ```
//!
//! Endpoint callbacks run on the core task while the instance is locked.
//! They must not call back into a `CoreHandle`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::driver::Driver;
use crate::endpoint::{
    EndpointCallbacks, EndpointId, EndpointInfo, EndpointState, OpenOptions, WriteFlags,
    WriteToken,
};
use crate::error::{CpcError, FaultCause, Result};
use crate::instance::{Instance, Lifecycle};
use crate::pool::{lock, PoolKind, RxBuffer};

struct Shared<D: Driver> {
    instance: Mutex<Instance<D>>,
    /// Signalled by the dispatcher on every queued work item.
    wake: Arc<Notify>,
    /// Signalled after every `process` pass.
    progress: Notify,
    shutdown: Notify,
    stopped: AtomicBool,
}

/// Move `instance` onto a new tokio task.
///
/// The instance should already be started. The task ends on
/// [`CoreHandle::shutdown`] (which deinitializes the instance) or when the
/// instance records a fatal fault.
pub fn spawn_core_task<D: Driver>(instance: Instance<D>) -> (CoreHandle<D>, JoinHandle<()>) {
    let wake = Arc::new(Notify::new());
    instance.set_waker(Some(wake.clone()));

    let shared = Arc::new(Shared {
        instance: Mutex::new(instance),
        wake,
        progress: Notify::new(),
        shutdown: Notify::new(),
        stopped: AtomicBool::new(false),
    });
    let task = tokio::spawn(core_loop(shared.clone()));
    (CoreHandle { shared }, task)
}

async fn core_loop<D: Driver>(shared: Arc<Shared<D>>) {
    debug!("core task started");
    loop {
        let (result, deadline) = {
            let mut instance = lock(&shared.instance);
            let result = if instance.lifecycle() == Lifecycle::Started {
                instance.process()
            } else {
                Ok(())
            };
            (result, instance.next_deadline())
        };
        shared.progress.notify_waiters();

        match result {
            Ok(()) => {}
            Err(CpcError::Fault(cause)) => {
                error!(%cause, "core task stopping on fault");
                break;
            }
            Err(err) => debug!(error = %err, "process failed"),
        }

        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = timer => {}
            _ = shared.shutdown.notified() => {
                let mut instance = lock(&shared.instance);
                instance.set_waker(None);
                instance.deinit();
                break;
            }
        }
    }

    shared.stopped.store(true, Ordering::Release);
    shared.progress.notify_waiters();
    info!("core task stopped");
}

/// Async access to an instance running on a core task.
pub struct CoreHandle<D: Driver> {
    shared: Arc<Shared<D>>,
}

impl<D: Driver> Clone for CoreHandle<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Driver> CoreHandle<D> {
    /// Run `f` with the instance locked.
    ///
    /// Work queued by `f` is picked up by the core task.
    pub fn with<R>(&self, f: impl FnOnce(&mut Instance<D>) -> R) -> R {
        f(&mut lock(&self.shared.instance))
    }

    pub async fn open(&self, id: EndpointId, options: OpenOptions) -> Result<()> {
        self.with(|instance| instance.open_endpoint(id, options))
    }

    pub async fn open_temporary(&self, options: OpenOptions) -> Result<EndpointId> {
        self.with(|instance| instance.open_temporary_endpoint(options))
    }

    /// Request a connection and wait until the peer grants it.
    ///
    /// A refusal surfaces as `EndpointFault` with the endpoint's error state.
    pub async fn connect(&self, id: EndpointId, timeout: Duration) -> Result<()> {
        self.with(|instance| instance.connect(id))?;
        self.wait_until(timeout, |instance| match instance.endpoint_state(id) {
            EndpointState::Connected => Ok(Some(())),
            EndpointState::Connecting => Ok(None),
            state if state.is_error() => Err(CpcError::EndpointFault { endpoint: id, state }),
            state => Err(CpcError::InvalidState { endpoint: id, state }),
        })
        .await
    }

    /// Wait for the sequence reset and property exchange to finish.
    pub async fn wait_handshake(&self, timeout: Duration) -> Result<()> {
        self.wait_until(timeout, |instance| {
            if let Some(cause) = instance.fault() {
                return Err(CpcError::Fault(cause));
            }
            Ok(instance.handshake_complete().then_some(()))
        })
        .await
    }

    /// Non-waiting write. See [`Instance::write`].
    pub async fn write(&self, id: EndpointId, payload: Bytes) -> Result<WriteToken> {
        self.write_with(id, payload, WriteFlags::NONE).await
    }

    pub async fn write_with(
        &self,
        id: EndpointId,
        payload: Bytes,
        flags: WriteFlags,
    ) -> Result<WriteToken> {
        self.with(|instance| instance.write(id, payload, flags))
    }

    /// Write, waiting up to `timeout` for window space and a transmit buffer.
    pub async fn write_blocking(
        &self,
        id: EndpointId,
        payload: Bytes,
        flags: WriteFlags,
        timeout: Duration,
    ) -> Result<WriteToken> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let progressed = self.shared.progress.notified();
            tokio::pin!(progressed);
            progressed.as_mut().enable();

            match self.with(|instance| instance.write(id, payload.clone(), flags)) {
                Err(CpcError::WindowFull { .. }) => {}
                Err(CpcError::ResourceExhausted(PoolKind::TxDataBudget)) => {
                    let Some(pools) = self.with(|instance| instance.pools_handle()) else {
                        return Err(CpcError::ResourceExhausted(PoolKind::TxDataBudget));
                    };
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    pools.tx_data().reserve(remaining).await?;
                    match self.with(|instance| instance.write_reserved(id, payload.clone(), flags)) {
                        Err(CpcError::WindowFull { .. }) => {}
                        other => return other,
                    }
                }
                other => return other,
            }

            if self.shared.stopped.load(Ordering::Acquire) {
                return Err(self.stopped_error());
            }
            if tokio::time::timeout_at(deadline, progressed).await.is_err() {
                return Err(CpcError::Timeout);
            }
        }
    }

    /// `write_blocking` bounded by the configured `tx_wait_timeout_ms`.
    pub async fn write_waiting(&self, id: EndpointId, payload: Bytes) -> Result<WriteToken> {
        let timeout = self.with(|instance| instance.config().tx_wait_timeout());
        self.write_blocking(id, payload, WriteFlags::NONE, timeout).await
    }

    /// Take a received payload if one is queued.
    pub async fn read(&self, id: EndpointId) -> Result<Option<RxBuffer>> {
        self.with(|instance| instance.read(id))
    }

    /// Wait up to `timeout` for a received payload.
    pub async fn recv(&self, id: EndpointId, timeout: Duration) -> Result<RxBuffer> {
        self.wait_until(timeout, |instance| instance.read(id)).await
    }

    pub async fn close(&self, id: EndpointId) -> Result<()> {
        self.with(|instance| instance.close_endpoint(id))
    }

    pub fn state(&self, id: EndpointId) -> EndpointState {
        self.with(|instance| instance.endpoint_state(id))
    }

    pub fn info(&self, id: EndpointId) -> Option<EndpointInfo> {
        self.with(|instance| instance.endpoint_info(id))
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.with(|instance| instance.lifecycle())
    }

    pub fn handshake_complete(&self) -> bool {
        self.with(|instance| instance.handshake_complete())
    }

    pub fn fault(&self) -> Option<FaultCause> {
        self.with(|instance| instance.fault())
    }

    pub fn set_callbacks(&self, id: EndpointId, callbacks: EndpointCallbacks) -> Result<()> {
        self.with(|instance| instance.set_callbacks(id, callbacks))
    }

    /// Ask the core task to deinitialize the instance and exit.
    pub fn shutdown(&self) {
        self.shared.shutdown.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Poll `check` after every `process` pass until it yields a value.
    async fn wait_until<T>(
        &self,
        timeout: Duration,
        mut check: impl FnMut(&mut Instance<D>) -> Result<Option<T>>,
    ) -> Result<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let progressed = self.shared.progress.notified();
            tokio::pin!(progressed);
            progressed.as_mut().enable();

            if let Some(value) = self.with(&mut check)? {
                return Ok(value);
            }
            if self.shared.stopped.load(Ordering::Acquire) {
                return Err(self.stopped_error());
            }
            if tokio::time::timeout_at(deadline, progressed).await.is_err() {
                return Err(CpcError::Timeout);
            }
        }
    }

    fn stopped_error(&self) -> CpcError {
        match self.fault() {
            Some(cause) => CpcError::Fault(cause),
            None => CpcError::InvalidLifecycle {
                expected: Lifecycle::Started,
                actual: self.lifecycle(),
            },
        }
    }
}
