//! Deferred work queue between interrupt-style producers and the core.
//!
//! Producers (driver callbacks, timers, the API) push a reusable
//! [`DispatchHandle`] with a function pointer and an opaque argument. The
//! single consumer runs queued work in FIFO order from [`Dispatcher::process`].
//!
//! ```text
//! driver callback ─┐
//! timer expiry    ─┼─► push(handle, fn, data) ─► VecDeque ─► process(&mut ctx)
//! API call        ─┘
//! ```
//!
//! A handle can be queued at most once; pushing it again while queued
//! returns `Busy`. `process` only runs the items pending when it was called,
//! so work that re-submits itself runs on the next call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{CpcError, Result};
use crate::pool::lock;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct HandleInner {
    id: u64,
    submitted: AtomicBool,
}

/// Reusable work item descriptor.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    inner: Arc<HandleInner>,
}

impl DispatchHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                submitted: AtomicBool::new(false),
            }),
        }
    }

    /// Whether the handle is currently queued.
    #[inline]
    pub fn is_submitted(&self) -> bool {
        self.inner.submitted.load(Ordering::Acquire)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

/// Callback signature for dispatched work.
pub type WorkFn<C> = fn(&mut C, usize);

struct Work<C> {
    handle: DispatchHandle,
    func: WorkFn<C>,
    data: usize,
}

/// FIFO work queue with an atomic pending counter.
pub struct Dispatcher<C> {
    queue: Mutex<VecDeque<Work<C>>>,
    pending: AtomicUsize,
    waker: Mutex<Option<Arc<Notify>>>,
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            waker: Mutex::new(None),
        }
    }

    /// Create a work item descriptor.
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle::new()
    }

    /// Signal `notify` on every push.
    pub fn set_waker(&self, notify: Option<Arc<Notify>>) {
        *lock(&self.waker) = notify;
    }

    /// Queue `func(ctx, data)`. `Busy` if the handle is already queued.
    pub fn push(&self, handle: &DispatchHandle, func: WorkFn<C>, data: usize) -> Result<()> {
        {
            let mut queue = lock(&self.queue);
            if handle.inner.submitted.swap(true, Ordering::AcqRel) {
                return Err(CpcError::Busy);
            }
            queue.push_back(Work {
                handle: handle.clone(),
                func,
                data,
            });
            self.pending.fetch_add(1, Ordering::AcqRel);
        }

        if let Some(notify) = lock(&self.waker).as_ref() {
            notify.notify_one();
        }
        Ok(())
    }

    /// Remove a queued item. Returns whether it was queued.
    pub fn cancel(&self, handle: &DispatchHandle) -> bool {
        let mut queue = lock(&self.queue);
        let Some(pos) = queue
            .iter()
            .position(|work| Arc::ptr_eq(&work.handle.inner, &handle.inner))
        else {
            return false;
        };
        queue.remove(pos);
        handle.inner.submitted.store(false, Ordering::Release);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Run the work pending at entry. Returns the number of items run.
    pub fn process(&self, ctx: &mut C) -> usize {
        let snapshot = self.pending.load(Ordering::Acquire);
        let mut ran = 0;

        for _ in 0..snapshot {
            let work = {
                let mut queue = lock(&self.queue);
                let Some(work) = queue.pop_front() else {
                    break;
                };
                work.handle.inner.submitted.store(false, Ordering::Release);
                self.pending.fetch_sub(1, Ordering::AcqRel);
                work
            };
            (work.func)(ctx, work.data);
            ran += 1;
        }
        ran
    }

    /// Number of queued items.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Drop every queued item.
    pub fn clear(&self) {
        let mut queue = lock(&self.queue);
        for work in queue.drain(..) {
            work.handle.inner.submitted.store(false, Ordering::Release);
        }
        self.pending.store(0, Ordering::Release);
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Ctx {
        log: Vec<usize>,
        resubmit: Option<(Arc<Dispatcher<Ctx>>, DispatchHandle)>,
    }

    fn record(ctx: &mut Ctx, data: usize) {
        ctx.log.push(data);
    }

    fn record_and_resubmit(ctx: &mut Ctx, data: usize) {
        ctx.log.push(data);
        if let Some((dispatcher, handle)) = ctx.resubmit.clone() {
            dispatcher.push(&handle, record_and_resubmit, data + 1).unwrap();
        }
    }

    #[test]
    fn test_fifo_order() {
        let dispatcher = Dispatcher::new();
        let handles: Vec<_> = (0..3).map(|_| dispatcher.handle()).collect();
        for (i, h) in handles.iter().enumerate() {
            dispatcher.push(h, record, i).unwrap();
        }

        let mut ctx = Ctx::default();
        assert_eq!(dispatcher.process(&mut ctx), 3);
        assert_eq!(ctx.log, vec![0, 1, 2]);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_double_push_is_busy() {
        let dispatcher = Dispatcher::new();
        let h = dispatcher.handle();
        dispatcher.push(&h, record, 1).unwrap();
        assert!(matches!(dispatcher.push(&h, record, 2), Err(CpcError::Busy)));

        let mut ctx = Ctx::default();
        dispatcher.process(&mut ctx);
        assert_eq!(ctx.log, vec![1]);
        assert!(!h.is_submitted());
    }

    #[test]
    fn test_cancel() {
        let dispatcher = Dispatcher::new();
        let a = dispatcher.handle();
        let b = dispatcher.handle();
        dispatcher.push(&a, record, 1).unwrap();
        dispatcher.push(&b, record, 2).unwrap();

        assert!(dispatcher.cancel(&a));
        assert!(!dispatcher.cancel(&a));
        assert_eq!(dispatcher.pending(), 1);

        let mut ctx = Ctx::default();
        dispatcher.process(&mut ctx);
        assert_eq!(ctx.log, vec![2]);
        dispatcher.push(&a, record, 3).unwrap();
    }

    #[test]
    fn test_resubmission_runs_next_call() {
        let dispatcher = Arc::new(Dispatcher::new());
        let h = dispatcher.handle();
        let mut ctx = Ctx {
            resubmit: Some((dispatcher.clone(), h.clone())),
            ..Ctx::default()
        };
        dispatcher.push(&h, record_and_resubmit, 0).unwrap();

        assert_eq!(dispatcher.process(&mut ctx), 1);
        assert_eq!(ctx.log, vec![0]);
        assert_eq!(dispatcher.pending(), 1);

        ctx.resubmit = None;
        assert_eq!(dispatcher.process(&mut ctx), 1);
        assert_eq!(ctx.log, vec![0, 1]);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_clear() {
        let dispatcher: Dispatcher<Ctx> = Dispatcher::new();
        let h = dispatcher.handle();
        dispatcher.push(&h, record, 0).unwrap();
        dispatcher.clear();
        assert_eq!(dispatcher.pending(), 0);
        assert!(!h.is_submitted());
    }

    #[tokio::test]
    async fn test_push_signals_waker() {
        let dispatcher: Dispatcher<Ctx> = Dispatcher::new();
        let notify = Arc::new(Notify::new());
        dispatcher.set_waker(Some(notify.clone()));

        let h = dispatcher.handle();
        dispatcher.push(&h, record, 0).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified())
            .await
            .unwrap();
    }
}
