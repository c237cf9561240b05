//! Test doubles standing in for the foreign runtime.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{AsyncCallback, AsyncOperation, BridgeError, ErrorCode, Result};

/// A value which counts how many times it was dropped.
#[derive(Debug)]
pub(crate) struct Tracked {
    pub(crate) id: usize,
    drops: Arc<AtomicUsize>,
}

impl Tracked {
    pub(crate) fn new(id: usize, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            id,
            drops: Arc::clone(drops),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) type MockCallback = Arc<dyn AsyncCallback<MockOperation>>;

/// The foreign side of one operation. Every [`MockOperation`] handed out is one reference to it.
#[derive(Default)]
pub(crate) struct Recorder {
    completed: AtomicBool,
    synchronous: AtomicBool,
    complete_on_cancel: AtomicBool,
    failure: Mutex<Option<ErrorCode>>,
    callback: Mutex<Option<MockCallback>>,
    pub(crate) refs: AtomicUsize,
    pub(crate) releases: AtomicUsize,
    pub(crate) cancels: AtomicUsize,
    pub(crate) ends: AtomicUsize,
    pub(crate) begins: AtomicUsize,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    /// The operation completes from inside `cancel`, on the cancelling thread's stack.
    pub(crate) fn completing_on_cancel() -> Arc<Recorder> {
        let recorder = Recorder::new();
        recorder.complete_on_cancel.store(true, Ordering::SeqCst);
        recorder
    }

    /// `end` reports `code`.
    pub(crate) fn failing_with(code: ErrorCode) -> Arc<Recorder> {
        let recorder = Recorder::new();
        *recorder.failure.lock().unwrap() = Some(code);
        recorder
    }

    /// Hand out a new reference.
    pub(crate) fn handle(self: &Arc<Self>) -> MockOperation {
        self.refs.fetch_add(1, Ordering::SeqCst);
        MockOperation {
            recorder: Arc::clone(self),
        }
    }

    /// Begin without completing. The returned handle reports asynchronous completion.
    pub(crate) fn begin_async(self: &Arc<Self>, callback: MockCallback) -> Result<MockOperation> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock().unwrap() = Some(callback);
        Ok(self.handle())
    }

    /// Begin and complete before returning, invoking the callback inline like the foreign runtime does.
    pub(crate) fn begin_sync(self: &Arc<Self>, callback: MockCallback) -> Result<MockOperation> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        self.synchronous.store(true, Ordering::SeqCst);
        self.completed.store(true, Ordering::SeqCst);
        callback.invoke(self.handle());
        Ok(self.handle())
    }

    /// Complete an asynchronous operation and deliver the callback on the current thread.
    pub(crate) fn complete(self: &Arc<Self>) {
        self.completed.store(true, Ordering::SeqCst);
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback.invoke(self.handle());
        }
    }

    pub(crate) fn end(&self, operation: &MockOperation) -> Result<u32> {
        assert!(std::ptr::eq(self, &*operation.recorder), "end on a foreign operation");
        self.ends.fetch_add(1, Ordering::SeqCst);
        assert!(self.completed.load(Ordering::SeqCst), "end before completion");
        match *self.failure.lock().unwrap() {
            Some(code) => Err(BridgeError::Unknown {
                code,
                message: None,
            }),
            None if self.cancels.load(Ordering::SeqCst) > 0 => Err(BridgeError::Cancelled),
            None => Ok(42),
        }
    }

    pub(crate) fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Every reference handed out was released exactly once.
    pub(crate) fn assert_balanced(&self) {
        assert_eq!(
            self.refs.load(Ordering::SeqCst),
            self.releases.load(Ordering::SeqCst),
            "foreign references leaked or released twice"
        );
    }
}

pub(crate) struct MockOperation {
    recorder: Arc<Recorder>,
}

impl AsyncOperation for MockOperation {
    fn is_completed(&self) -> bool {
        self.recorder.completed.load(Ordering::SeqCst)
    }

    fn completed_synchronously(&self) -> bool {
        self.recorder.synchronous.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.recorder.cancels.fetch_add(1, Ordering::SeqCst);
        if self.recorder.complete_on_cancel.load(Ordering::SeqCst) && !self.is_completed() {
            self.recorder.complete();
        }
    }
}

impl Drop for MockOperation {
    fn drop(&mut self) {
        self.recorder.releases.fetch_add(1, Ordering::SeqCst);
    }
}
