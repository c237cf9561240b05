//! Single assignment result slot shared between the thread completing an operation and the tasks awaiting it.
//!
//! The slot moves through `Pending -> Writing -> Ready -> Taken`. Only the resolver winning the
//! `Pending -> Writing` exchange stores a result, every other resolution attempt is rejected. Exactly one
//! consumer waits for `Ready` and moves the result out.
//!
//! The consumer's waker sits in a single slot. Polling again with a waker that would wake the same task keeps
//! the registered one, so a future polled many times while pending holds one waker, not one per poll.
use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use concurrent_queue::{ConcurrentQueue, PushError};

use crate::{BridgeError, CancellationSource, Result};

const PENDING: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;
const TAKEN: u8 = 3;

struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<Result<T>>>,
    waker: ConcurrentQueue<Waker>,
}

// Safety: `value` is written only by the resolver that won PENDING -> WRITING, and read only by the consumer
//         that won READY -> TAKEN.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

pub(crate) struct Promise<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.slot.state.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> Promise<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                state: AtomicU8::new(PENDING),
                value: UnsafeCell::new(None),
                waker: ConcurrentQueue::bounded(1),
            }),
        }
    }

    /// Store `result` if nothing was stored yet. Returns whether this call resolved the promise.
    pub(crate) fn resolve(&self, result: Result<T>) -> bool {
        if self
            .slot
            .state
            .compare_exchange(PENDING, WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Safety: winning the exchange gives us exclusive access to the value until READY is published.
        unsafe { *self.slot.value.get() = Some(result) };
        // SeqCst pairs with the re-check in `poll_resolved`: either the consumer sees READY, or we see its waker.
        self.slot.state.store(READY, Ordering::SeqCst);

        if let Ok(waker) = self.slot.waker.pop() {
            waker.wake();
        }
        true
    }

    pub(crate) fn cancel(&self) -> bool {
        self.resolve(Err(BridgeError::Cancelled))
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.slot.state.load(Ordering::SeqCst) >= READY
    }

    // Register the waker, then check again so a resolution racing with the registration is not missed.
    fn poll_resolved(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_resolved() {
            return Poll::Ready(());
        }
        self.register(cx.waker());
        if self.is_resolved() {
            return Poll::Ready(());
        }
        Poll::Pending
    }

    // Keep the registered waker if it wakes the same task, otherwise replace it. A displaced waker is woken
    // so its owner gets to poll and register again.
    fn register(&self, waker: &Waker) {
        let mut waker = waker.clone();
        loop {
            match self.slot.waker.push(waker) {
                Ok(()) => return,
                Err(PushError::Full(rejected)) => {
                    waker = rejected;
                    if let Ok(previous) = self.slot.waker.pop() {
                        if previous.will_wake(&waker) {
                            waker = previous;
                        } else {
                            previous.wake();
                        }
                    }
                }
                Err(PushError::Closed(_)) => return,
            }
        }
    }

    /// Wait for the result and move it out.
    ///
    /// ### Panics
    /// If the result was already moved out.
    pub(crate) fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        futures_lite::ready!(self.poll_resolved(cx));
        if self
            .slot
            .state
            .compare_exchange(READY, TAKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("promise result taken more than once");
        }
        // Safety: winning READY -> TAKEN gives us exclusive access to the stored value.
        let value = unsafe { (*self.slot.value.get()).take() };
        match value {
            Some(value) => Poll::Ready(value),
            None => unreachable!("ready promise without a value"),
        }
    }

    /// Block the current thread until the result is available, then move it out.
    pub(crate) fn wait(&self) -> Result<T> {
        futures_lite::future::block_on(futures_lite::future::poll_fn(|cx| self.poll_take(cx)))
    }
}

/// The future returned by [`OutboundBridge::invoke`](crate::OutboundBridge::invoke).
///
/// Dropping it does not cancel the foreign operation, use the cancellation token passed to `invoke` for that.
pub struct BridgeFuture<T> {
    promise: Option<Promise<T>>,
    // Keeps the deadline of a timed call alive until the call is observed.
    deadline: Option<CancellationSource>,
}

impl<T> fmt::Debug for BridgeFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeFuture")
            .field("promise", &self.promise)
            .finish()
    }
}

impl<T> BridgeFuture<T> {
    pub(crate) fn new(promise: Promise<T>) -> Self {
        Self {
            promise: Some(promise),
            deadline: None,
        }
    }

    pub(crate) fn cancelled() -> Self {
        let promise = Promise::new();
        promise.cancel();
        Self::new(promise)
    }

    pub(crate) fn with_deadline(mut self, deadline: CancellationSource) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// True once the operation produced its result, without waiting for it.
    pub fn is_resolved(&self) -> bool {
        self.promise.as_ref().map_or(true, Promise::is_resolved)
    }

    /// Block the current thread until the operation completes.
    pub fn wait(mut self) -> Result<T> {
        let promise = self
            .promise
            .take()
            .expect("BridgeFuture polled after completion");
        let result = promise.wait();
        self.release_deadline();
        result
    }

    fn release_deadline(&mut self) {
        if let Some(deadline) = self.deadline.take() {
            deadline.dispose();
        }
    }
}

impl<T> Future for BridgeFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let promise = this
            .promise
            .as_ref()
            .expect("BridgeFuture polled after completion");
        let result = futures_lite::ready!(promise.poll_take(cx));
        this.promise.take();
        this.release_deadline();
        Poll::Ready(result)
    }
}

impl<T> Drop for BridgeFuture<T> {
    fn drop(&mut self) {
        self.release_deadline();
    }
}
