//! Calling out: turning a foreign begin/end operation into a [`BridgeFuture`].
//!
//! ### Completion race
//! A foreign operation completes in one of two ways. Either it finishes before `begin` returns (synchronous
//! completion), or it finishes later and the foreign runtime invokes the callback passed to `begin`, from any
//! thread (asynchronous completion). The runtime may also invoke the callback for a synchronous completion,
//! possibly before `begin` has returned. Two paths therefore try to finish every operation:
//!
//! - the path returning from `begin`, which only proceeds if `completed_synchronously()` is true,
//! - the callback, which only proceeds if `completed_synchronously()` is false.
//!
//! Both read the same flag from the handle, so exactly one of them calls `end`. Whichever path sees the handle
//! first installs it into the [`SharedHandle`], the other one drops its reference. A late or duplicated callback
//! fails to acquire the handle once it is released, and the `end` closure can only be taken once.
//!
//! ### Cancellation
//! Cancelling the token passed to `invoke` calls `cancel()` on the handle if it can still be acquired. It does
//! not resolve the future, the operation still finishes through one of the two paths above.
//!
//! The cancellation registration is disposed by whichever of the registering path and the completion path
//! swaps it out of its slot. When the operation completes on the stack of its own cancellation callback,
//! disposing the registration there would wait on the callback we are running in, so that disposal is sent to
//! the configured [`Executor`](crate::Executor).
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, trace};
use scoped_tls::scoped_thread_local;

use crate::executor::{self, Executor};
use crate::last_error::LastErrorChannel;
use crate::op::TakeOnce;
use crate::promise::Promise;
use crate::{
    AsyncCallback, AsyncOperation, BridgeError, BridgeFuture, CancellationSource,
    CancellationToken, Config, ErrorCode, ErrorTable, Registration, Result, SharedHandle,
    TracePolicy,
};

// Address of the call whose cancellation callback is running on this thread.
scoped_thread_local!(static CANCELLING: usize);

type End<H, R> = Box<dyn FnOnce(&H) -> Result<R> + Send + 'static>;

/// Starts foreign operations and resolves a future with their results.
#[derive(Clone)]
pub struct OutboundBridge {
    tag: Arc<str>,
    trace: TracePolicy,
    executor: Arc<dyn Executor>,
    last_error: Arc<LastErrorChannel>,
}

impl fmt::Debug for OutboundBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundBridge")
            .field("tag", &self.tag)
            .field("trace", &self.trace)
            .finish()
    }
}

impl OutboundBridge {
    /// `tag` names the foreign operation in logs.
    pub fn new(tag: &str, config: &Config) -> Self {
        Self {
            tag: Arc::from(tag),
            trace: config.trace(),
            executor: config.shared_executor(),
            last_error: config.last_error(),
        }
    }

    pub fn trace_policy(mut self, trace: TracePolicy) -> Self {
        self.trace = trace;
        self
    }

    /// Start a foreign operation.
    ///
    /// `begin` receives the callback to register with the foreign runtime and returns the operation handle.
    /// `end` is called at most once, with the handle, once the operation completed. If `cancel` is already
    /// cancelled, `begin` is not called and the future resolves as cancelled.
    pub fn invoke<H, R, B, E>(&self, begin: B, end: E, cancel: &CancellationToken) -> BridgeFuture<R>
    where
        H: AsyncOperation,
        R: Send + 'static,
        B: FnOnce(Arc<dyn AsyncCallback<H>>) -> Result<H>,
        E: FnOnce(&H) -> Result<R> + Send + 'static,
    {
        if cancel.is_cancelled() {
            trace!("{}: cancelled before begin", self.tag);
            return BridgeFuture::cancelled();
        }

        let call = Arc::new(CallOut {
            tag: Arc::clone(&self.tag),
            trace: self.trace,
            executor: Arc::clone(&self.executor),
            handle: SharedHandle::new(),
            end: TakeOnce::new(Box::new(end) as End<H, R>),
            promise: Promise::new(),
            registration: AtomicPtr::new(ptr::null_mut()),
            completed: AtomicBool::new(false),
        });
        let future = BridgeFuture::new(call.promise.clone());

        let callback: Arc<dyn AsyncCallback<H>> = Arc::new(Completion {
            call: Arc::clone(&call),
        });
        trace!("{}: begin", self.tag);
        match begin(callback) {
            Ok(operation) => {
                if !call.handle.initialize(operation) {
                    debug!("{}: callback installed the handle before begin returned", self.tag);
                }
                call.finish(true);
                if !call.completed.load(Ordering::SeqCst) && cancel.can_be_cancelled() {
                    call.register_cancellation(cancel);
                }
            }
            Err(e) => call.complete(Err(e)),
        }
        future
    }

    /// Call a foreign function which completes before returning.
    ///
    /// A failure code is translated through the process-wide [`ErrorTable`], picking up the diagnostic text the
    /// foreign side published on the configured last-error channel, and traced per the bridge's policy.
    pub fn invoke_sync<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> std::result::Result<R, ErrorCode>,
    {
        trace!("{}: invoke", self.tag);
        f().map_err(|code| {
            let error = ErrorTable::global().translate_with(code, &self.last_error);
            self.trace.trace(&self.tag, &error);
            error
        })
    }

    /// Like [`invoke`](Self::invoke), cancelling the operation once `timeout` elapses.
    ///
    /// Timeouts beyond `u32::MAX` milliseconds cannot be expressed to the foreign runtime and are rejected.
    pub fn invoke_with_timeout<H, R, B, E>(
        &self,
        begin: B,
        end: E,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> BridgeFuture<R>
    where
        H: AsyncOperation,
        R: Send + 'static,
        B: FnOnce(Arc<dyn AsyncCallback<H>>) -> Result<H>,
        E: FnOnce(&H) -> Result<R> + Send + 'static,
    {
        if timeout.as_millis() > u128::from(u32::MAX) {
            let error = BridgeError::invalid_argument(format!(
                "timeout of {:?} exceeds {} milliseconds",
                timeout,
                u32::MAX
            ));
            self.trace.trace(&self.tag, &error);
            let promise = Promise::new();
            promise.resolve(Err(error));
            return BridgeFuture::new(promise);
        }

        let deadline = CancellationSource::linked(cancel);
        deadline.cancel_after(timeout);
        let token = deadline.token();
        self.invoke(begin, end, &token).with_deadline(deadline)
    }
}

struct CallOut<H, R> {
    tag: Arc<str>,
    trace: TracePolicy,
    executor: Arc<dyn Executor>,
    handle: SharedHandle<H>,
    end: TakeOnce<End<H, R>>,
    promise: Promise<R>,
    registration: AtomicPtr<Registration>,
    completed: AtomicBool,
}

impl<H, R> CallOut<H, R>
where
    H: AsyncOperation,
    R: Send + 'static,
{
    /// Call `end` if the handle's completion mode matches the path we are on.
    fn finish(&self, synchronous: bool) {
        let outcome = self.handle.with_handle(|operation| {
            if operation.completed_synchronously() != synchronous {
                return None;
            }
            let end = self.end.take()?;
            trace!(
                "{}: end ({})",
                self.tag,
                if synchronous { "synchronous" } else { "asynchronous" }
            );
            Some(end(operation))
        });
        if let Some(Some(result)) = outcome {
            self.complete(result);
        }
    }

    fn on_callback(&self, operation: H) {
        if !self.handle.initialize(operation) {
            trace!("{}: callback handle already installed", self.tag);
        }
        self.finish(false);
    }

    fn complete(&self, result: Result<R>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = &result {
            self.trace.trace(&self.tag, e);
        }
        self.handle.release();
        self.dispose_registration();
        self.promise.resolve(result);
    }

    fn register_cancellation(self: &Arc<Self>, cancel: &CancellationToken) {
        let call: Weak<Self> = Arc::downgrade(self);
        let registration = cancel.register(move || {
            let id = call.as_ptr() as usize;
            // The call may also be dropped in here, when the upgrade below holds its last reference.
            CANCELLING.set(&id, || {
                if let Some(call) = call.upgrade() {
                    call.request_cancel();
                }
            });
        });

        let raw = Box::into_raw(Box::new(registration));
        self.registration.store(raw, Ordering::SeqCst);
        // Completion may have swapped the slot before we filled it. Only one of us gets the registration out.
        if self.completed.load(Ordering::SeqCst) {
            self.dispose_registration();
        }
    }

    fn request_cancel(&self) {
        let cancelled = self.handle.with_handle(|operation| operation.cancel());
        if cancelled.is_none() {
            trace!("{}: cancel after completion ignored", self.tag);
        }
    }
}

impl<H, R> CallOut<H, R> {
    fn dispose_registration(&self) {
        let raw = self.registration.swap(ptr::null_mut(), Ordering::SeqCst);
        if raw.is_null() {
            return;
        }
        // Safety: the swap gave us sole ownership of the registration.
        let registration = unsafe { Box::from_raw(raw) };

        let id = self as *const Self as usize;
        if CANCELLING.is_set() && CANCELLING.with(|cancelling| *cancelling == id) {
            debug!(
                "{}: completed inside its cancellation callback, disposing the registration elsewhere",
                self.tag
            );
            executor::defer(&*self.executor, move || drop(registration));
        } else {
            drop(registration);
        }
    }
}

impl<H, R> Drop for CallOut<H, R> {
    fn drop(&mut self) {
        self.dispose_registration();
    }
}

/// The callback handed to the foreign runtime.
struct Completion<H, R> {
    call: Arc<CallOut<H, R>>,
}

impl<H, R> AsyncCallback<H> for Completion<H, R>
where
    H: AsyncOperation,
    R: Send + 'static,
{
    fn invoke(&self, operation: H) {
        self.call.on_callback(operation)
    }
}
