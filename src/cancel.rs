//! Cooperative cancellation signals and the registrations that forward them to foreign operations.
//!
//! A [`CancellationSource`] owns the signal, [`CancellationToken`]s observe it, and a [`Registration`] links a
//! callback to it. Callbacks run on the thread calling [`CancellationSource::cancel`], outside of any lock.
//!
//! Disposing a [`Registration`] (dropping it) guarantees its callback will not start afterwards. If the callback
//! is running on another thread at that moment, disposal waits for it to return. Disposing a registration from
//! inside its own callback therefore never returns; callers that can end up in that position have to hand the
//! registration to another execution context.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use smallvec::SmallVec;

use crate::op::TakeOnce;
use crate::timer::{self, TimerId};
use crate::{BridgeError, Result};

type Callback = Box<dyn FnOnce() + Send + 'static>;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const REMOVED: u8 = 3;

struct Entry {
    state: AtomicU8,
    callback: TakeOnce<Callback>,
}

impl Entry {
    fn new(callback: Callback) -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            callback: TakeOnce::new(callback),
        }
    }

    fn run(&self) {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        // Mark the entry done even if the callback unwinds, a waiting disposer would spin forever otherwise.
        let _done = scopeguard::guard((), |_| self.state.store(DONE, Ordering::Release));
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

struct Inner {
    cancelled: AtomicBool,
    disposed: AtomicBool,
    entries: Mutex<SmallVec<[Arc<Entry>; 4]>>,
    timers: Mutex<SmallVec<[TimerId; 1]>>,
    parent: Mutex<Option<Registration>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            entries: Mutex::new(SmallVec::new()),
            timers: Mutex::new(SmallVec::new()),
            parent: Mutex::new(None),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn cancel_timers(&self) {
        let timers = {
            let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *timers)
        };
        for id in timers {
            timer::cancel(id);
        }
    }

    fn remove(&self, entry: &Arc<Entry>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|e| !Arc::ptr_eq(e, entry));
    }
}

/// Owner of a cancellation signal. Clones share the same signal.
#[derive(Clone)]
pub struct CancellationSource {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.inner.is_cancelled())
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// A source which is cancelled whenever `parent` is.
    pub fn linked(parent: &CancellationToken) -> Self {
        let source = Self::new();
        let weak = Arc::downgrade(&source.inner);
        let registration = parent.register(move || {
            if let Some(inner) = weak.upgrade() {
                // A disposed child simply ignores its parent.
                let _ = CancellationSource { inner }.cancel();
            }
        });
        *source
            .inner
            .parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(registration);
        source
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Signal cancellation, running every registered callback on this thread. Cancelling twice is a no-op,
    /// cancelling a disposed source is an error.
    pub fn cancel(&self) -> Result<()> {
        if self.inner.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cancel_timers();

        let entries = {
            let mut entries = self
                .inner
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *entries)
        };
        debug!("cancelling, {} callbacks registered", entries.len());
        for entry in entries {
            entry.run();
        }
        Ok(())
    }

    /// Cancel once `timeout` elapses, unless the source is cancelled or disposed first.
    ///
    /// Deadlines of every source fire on one shared timer thread, so callbacks registered on a source with a
    /// deadline should not block for long.
    pub fn cancel_after(&self, timeout: Duration) {
        if self.inner.is_cancelled() || self.inner.is_disposed() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let id = timer::schedule(Instant::now() + timeout, move || {
            if let Some(inner) = weak.upgrade() {
                let _ = CancellationSource { inner }.cancel();
            }
        });
        let mut timers = self.inner.timers.lock().unwrap_or_else(PoisonError::into_inner);
        // A cancel or dispose racing with us may already have drained the list.
        if self.inner.is_cancelled() || self.inner.is_disposed() {
            drop(timers);
            timer::cancel(id);
            return;
        }
        timers.push(id);
    }

    /// Release the source. Pending callbacks are dropped without running and later `cancel` calls fail.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel_timers();
        let entries = {
            let mut entries = self
                .inner
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *entries)
        };
        for entry in entries {
            if entry
                .state
                .compare_exchange(IDLE, REMOVED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                drop(entry.callback.take());
            }
        }
        let parent = self
            .inner
            .parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(parent);
    }
}

/// Observer side of a [`CancellationSource`]. The default token can never be cancelled.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Option<Arc<Inner>>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.as_ref().map_or(false, |i| i.is_cancelled())
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.inner.as_ref().map_or(false, |i| !i.is_disposed())
    }

    /// Run `callback` once cancellation is signalled. If it already was, `callback` runs before this returns.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> Registration {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return Registration::empty(),
        };
        let entry = Arc::new(Entry::new(Box::new(callback)));
        {
            let mut entries = inner.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.is_disposed() {
                return Registration::empty();
            }
            if !inner.is_cancelled() {
                entries.push(Arc::clone(&entry));
                return Registration {
                    entry: Some(entry),
                    source: Arc::downgrade(inner),
                };
            }
        }
        entry.run();
        Registration::empty()
    }
}

/// Links a callback to a cancellation signal. Dropping it disposes the link.
pub struct Registration {
    entry: Option<Arc<Entry>>,
    source: Weak<Inner>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("linked", &self.entry.is_some())
            .finish()
    }
}

impl Registration {
    fn empty() -> Self {
        Self {
            entry: None,
            source: Weak::new(),
        }
    }

    /// Dispose the link. Same as dropping it.
    pub fn dispose(self) {
        drop(self)
    }

    /// True if the callback can still run.
    pub fn is_armed(&self) -> bool {
        self.entry
            .as_ref()
            .map_or(false, |e| e.state.load(Ordering::Acquire) == IDLE)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let entry = match self.entry.take() {
            Some(entry) => entry,
            None => return,
        };
        match entry
            .state
            .compare_exchange(IDLE, REMOVED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                drop(entry.callback.take());
                if let Some(source) = self.source.upgrade() {
                    source.remove(&entry);
                }
            }
            Err(RUNNING) => {
                // The callback is executing on another thread, wait until it returns.
                while entry.state.load(Ordering::Acquire) == RUNNING {
                    thread::yield_now();
                }
            }
            Err(_) => {}
        }
    }
}
