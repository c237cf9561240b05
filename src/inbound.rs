//! Calling in: exposing a local future to the foreign runtime through the begin/end protocol.
//!
//! [`InboundBridge::begin`] starts driving the future and returns the context object handed back to the
//! foreign caller. The foreign side polls it through [`AsyncOperation`], waits for the callback, and collects
//! the result with [`InboundBridge::end`].
//!
//! The completion mode is decided by a single compare-and-swap on [`CompletionState`]. When the future
//! settles it tries `Unknown -> Synchronous`, and `begin` tries `Unknown -> Asynchronous` right before
//! returning. The future settling first means it finished before `begin` returned.
use std::fmt;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_lite::future::{block_on, poll_once};
use log::{debug, trace};
use pin_project_lite::pin_project;

use crate::last_error::LastErrorChannel;
use crate::promise::Promise;
use crate::{
    protocol_violation, AsyncCallback, AsyncOperation, BridgeError, CallbackSource,
    CancellationSource, CancellationToken, Config, ErrorCode, Result, TracePolicy,
};

const UNKNOWN: u8 = 0;
const SYNCHRONOUS: u8 = 1;
const ASYNCHRONOUS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// `begin` has not returned and the future has not settled yet.
    Unknown,
    /// The future settled before `begin` returned.
    Synchronous,
    Asynchronous,
}

impl CompletionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            UNKNOWN => CompletionState::Unknown,
            SYNCHRONOUS => CompletionState::Synchronous,
            ASYNCHRONOUS => CompletionState::Asynchronous,
            _ => unreachable!("invalid completion state {}", raw),
        }
    }
}

/// The completion callback the foreign caller registers with `begin`.
pub type InboundCallback<R> = Arc<dyn AsyncCallback<InboundBridge<R>>>;

struct CallIn<R> {
    tag: Arc<str>,
    trace: TracePolicy,
    state: AtomicU8,
    ended: AtomicBool,
    promise: Promise<R>,
    cancel: Option<CancellationSource>,
    callback: Option<InboundCallback<R>>,
    last_error: Arc<LastErrorChannel>,
}

/// The context object the foreign runtime drives a local future through.
pub struct InboundBridge<R> {
    inner: Arc<CallIn<R>>,
}

impl<R> Clone for InboundBridge<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> fmt::Debug for InboundBridge<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundBridge")
            .field("tag", &self.inner.tag)
            .field(
                "state",
                &CompletionState::from_raw(self.inner.state.load(Ordering::Acquire)),
            )
            .field("completed", &self.inner.promise.is_resolved())
            .finish()
    }
}

impl<R: Send + 'static> InboundBridge<R> {
    fn new(
        tag: &str,
        config: &Config,
        cancel: Option<CancellationSource>,
        callback: Option<InboundCallback<R>>,
    ) -> Self {
        Self {
            inner: Arc::new(CallIn {
                tag: Arc::from(tag),
                trace: config.trace(),
                state: AtomicU8::new(UNKNOWN),
                ended: AtomicBool::new(false),
                promise: Promise::new(),
                cancel,
                callback,
                last_error: config.last_error(),
            }),
        }
    }

    /// Start driving `future` and return the context to hand to the foreign caller.
    ///
    /// The future is polled once on the current thread. If it does not settle right away it is handed to the
    /// configured executor, so this never blocks. Once the future settles, `callback` is invoked with the
    /// context and `cancel` is disposed.
    pub fn begin<F>(
        tag: &str,
        config: &Config,
        future: F,
        cancel: Option<CancellationSource>,
        callback: Option<InboundCallback<R>>,
    ) -> Self
    where
        F: Future<Output = Result<R>> + Send + 'static,
    {
        let bridge = Self::new(tag, config, cancel, callback);
        trace!("{}: begin", tag);

        let mut task = Box::pin(CallInTask {
            future,
            context: Some(bridge.clone()),
        });
        if block_on(poll_once(&mut task)).is_none() {
            trace!("{}: pending, moving to the executor", tag);
            config.shared_executor().spawn(task);
        }

        if bridge
            .inner
            .state
            .compare_exchange(UNKNOWN, ASYNCHRONOUS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("{}: completes asynchronously", tag);
        }
        bridge
    }

    /// Like [`begin`](Self::begin), creating the cancellation source and passing its token to `make_future`.
    pub fn begin_cancellable<F, M>(
        tag: &str,
        config: &Config,
        make_future: M,
        callback: Option<InboundCallback<R>>,
    ) -> Self
    where
        F: Future<Output = Result<R>> + Send + 'static,
        M: FnOnce(CancellationToken) -> F,
    {
        let source = CancellationSource::new();
        let future = make_future(source.token());
        Self::begin(tag, config, future, Some(source), callback)
    }

    pub fn state(&self) -> CompletionState {
        CompletionState::from_raw(self.inner.state.load(Ordering::Acquire))
    }

    /// Block until the future settles and collect its result.
    ///
    /// A failure is reported as its foreign error code, its description is published on the configured
    /// last-error channel.
    ///
    /// ### Panics
    /// If called more than once on the same operation.
    pub fn end(&self) -> std::result::Result<R, ErrorCode> {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            protocol_violation(&format!("{}: end called more than once", self.inner.tag));
        }
        match self.inner.promise.wait() {
            Ok(value) => Ok(value),
            Err(e) => {
                self.inner.last_error.set_error(&e);
                Err(e.code())
            }
        }
    }

    fn settle(&self, result: Result<R>) {
        let inner = &*self.inner;
        if let Err(e) = &result {
            inner.trace.trace(&inner.tag, e);
        }
        inner.promise.resolve(result);

        if inner
            .state
            .compare_exchange(UNKNOWN, SYNCHRONOUS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("{}: completed synchronously", inner.tag);
        }

        let _dispose = scopeguard::guard((), |_| {
            if let Some(cancel) = &inner.cancel {
                cancel.dispose();
            }
        });
        if let Some(callback) = &inner.callback {
            callback.invoke(self.clone());
        }
    }
}

impl<R: Send + 'static> AsyncOperation for InboundBridge<R> {
    fn is_completed(&self) -> bool {
        self.inner.promise.is_resolved()
    }

    fn completed_synchronously(&self) -> bool {
        match self.state() {
            CompletionState::Unknown => protocol_violation(&format!(
                "{}: completion mode queried before begin returned",
                self.inner.tag
            )),
            CompletionState::Synchronous => true,
            CompletionState::Asynchronous => false,
        }
    }

    fn cancel(&self) {
        if let Some(source) = &self.inner.cancel {
            if let Err(e) = source.cancel() {
                debug!("{}: cancel ignored: {}", self.inner.tag, e);
            }
        }
    }
}

impl<R: Send + 'static> CallbackSource<InboundBridge<R>> for InboundBridge<R> {
    fn callback(&self) -> Option<InboundCallback<R>> {
        self.inner.callback.clone()
    }
}

/// Run local code on behalf of a foreign caller which expects the result right away.
///
/// A failure is traced per the configured policy, its description is published on the configured last-error
/// channel and its foreign error code is returned. A panic must not unwind into the foreign caller, so it is
/// caught and reported as [`ErrorCode::FAIL`].
pub fn run_sync<R, F>(tag: &str, config: &Config, f: F) -> std::result::Result<R, ErrorCode>
where
    F: FnOnce() -> Result<R>,
{
    trace!("{}: run", tag);
    let error = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(e)) => e,
        Err(payload) => BridgeError::Unknown {
            code: ErrorCode::FAIL,
            message: Some(format!("panicked: {}", panic_message(&*payload))),
        },
    };
    config.trace().trace(tag, &error);
    config.last_error().set_error(&error);
    Err(error.code())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

pin_project! {
    // Drives the local future and settles the context with its output.
    struct CallInTask<F, R> {
        #[pin]
        future: F,
        context: Option<InboundBridge<R>>,
    }
}

impl<F, R> Future for CallInTask<F, R>
where
    F: Future<Output = Result<R>>,
    R: Send + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        let result = futures_lite::ready!(this.future.poll(cx));
        if let Some(context) = this.context.take() {
            context.settle(result);
        }
        Poll::Ready(())
    }
}
