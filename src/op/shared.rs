//! Reference counted ownership of a handle that belongs to the foreign runtime.
//!
//! ### Design
//! A foreign operation handle is observed by up to three parties at once: the thread which called `begin`,
//! the thread on which the foreign runtime delivers the completion callback, and the thread which requests
//! cancellation. Any of them may be the last one to look at the handle, and the handle must be released
//! exactly once, after all of them are done with it.
//!
//! [`SharedHandle<T>`] holds at most one handle together with a reference count. The count starts at 1 on
//! behalf of the owner (the party driving the operation to completion) and the handle slot starts empty.
//!
//! ```ascii
//!  initialize(h) ------------+
//!                            v
//! +-------------+      +-------------+   count hits 0   +-------------+
//! |    Empty    |----->|  Installed  |----------------->|  Released   |
//! +-------------+      +-------------+                  +-------------+
//!                        ^       |
//!          try_acquire() |       | release() / drop(Acquired)
//!          (count += 1)  +-------+ (count -= 1)
//! ```
//!
//! ### Rules
//!
//! 1. The first `initialize` wins. Every other handle offered to `initialize`, including ones offered after the
//!    slot was released, is dropped on the spot since it is another reference to a handle already accounted for.
//! 2. `try_acquire` only succeeds while the count is above zero. The count never moves up from zero, so a late
//!    party (a cancellation arriving after completion, a duplicate callback) fails to acquire and does nothing.
//! 3. The release which brings the count to zero drops the handle. Dropping a handle is the physical release.
//! 4. A count below zero means some party released a reference it never held. That is a protocol violation.
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, Ordering};

use log::trace;

use crate::protocol_violation;

pub struct SharedHandle<T> {
    slot: AtomicPtr<T>,
    count: AtomicIsize,
    retired: AtomicBool,
    _marker: PhantomData<T>,
}

// Safety: the handle is reached through shared references from several threads, and whichever thread performs
//         the last release drops it.
unsafe impl<T: Send> Send for SharedHandle<T> {}
unsafe impl<T: Send + Sync> Sync for SharedHandle<T> {}

impl<T> fmt::Debug for SharedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("installed", &!self.slot.load(Ordering::Acquire).is_null())
            .field("count", &self.count.load(Ordering::Acquire))
            .field("retired", &self.retired.load(Ordering::Acquire))
            .finish()
    }
}

impl<T> Default for SharedHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedHandle<T> {
    /// An empty slot, with the owner's reference already counted.
    pub fn new() -> Self {
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
            count: AtomicIsize::new(1),
            retired: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    /// Install `handle` unless some other handle got there first. Returns whether this call won.
    ///
    /// A losing handle is dropped before returning.
    pub fn initialize(&self, handle: T) -> bool {
        if self.retired.load(Ordering::Acquire) {
            drop(handle);
            return false;
        }

        let raw = Box::into_raw(Box::new(handle));
        let installed =
            self.slot
                .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire);
        if installed.is_err() {
            // Safety: `raw` never became visible to anyone else.
            drop(unsafe { Box::from_raw(raw) });
            return false;
        }

        // The last release may have retired the slot between our check and the exchange. It will either have
        // swapped our handle out already, or we take it back here. Only one of the two swaps sees it.
        if self.retired.load(Ordering::Acquire) {
            let raw = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // Safety: the swap handed us exclusive ownership of the allocation.
                drop(unsafe { Box::from_raw(raw) });
            }
            return false;
        }
        true
    }

    /// Bump the count and borrow the handle. Returns `None` if the count already drained to zero, or if nothing
    /// was ever installed.
    pub fn try_acquire(&self) -> Option<Acquired<'_, T>> {
        if self.slot.load(Ordering::Acquire).is_null() {
            trace!("acquire on an uninitialized or released handle");
            return None;
        }

        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return None;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // We hold a reference now, so the slot cannot be torn down under us.
        match NonNull::new(self.slot.load(Ordering::Acquire)) {
            Some(handle) => Some(Acquired {
                owner: self,
                handle,
            }),
            None => {
                self.release_ref();
                None
            }
        }
    }

    /// Give up the owner's reference.
    pub fn release(&self) {
        self.release_ref()
    }

    /// Run `f` against the handle if it can still be acquired. The reference taken for the call is given back
    /// afterwards, also when `f` panics.
    pub fn with_handle<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let handle = self.try_acquire()?;
        Some(f(&handle))
    }

    /// Current number of outstanding references.
    pub fn ref_count(&self) -> isize {
        self.count.load(Ordering::Acquire)
    }

    /// True once the count drained to zero.
    pub fn is_released(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn release_ref(&self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            protocol_violation("SharedHandle released more times than it was acquired");
        }
        if previous == 1 {
            self.retired.store(true, Ordering::Release);
            let raw = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                trace!("releasing foreign handle");
                // Safety: the count reached zero, so no `Acquired` is alive and nobody can create a new one.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}

impl<T> Drop for SharedHandle<T> {
    fn drop(&mut self) {
        // The owner never released, or a handle was installed after retirement. Either way we are the last user.
        let raw = *self.slot.get_mut();
        if !raw.is_null() {
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

/// A counted reference to the handle held in a [`SharedHandle`]. Dropping it releases the reference.
pub struct Acquired<'a, T> {
    owner: &'a SharedHandle<T>,
    handle: NonNull<T>,
}

impl<T> Deref for Acquired<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the reference we hold keeps the allocation alive.
        unsafe { self.handle.as_ref() }
    }
}

impl<T: fmt::Debug> fmt::Debug for Acquired<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Acquired").field(&**self).finish()
    }
}

impl<T> Drop for Acquired<'_, T> {
    fn drop(&mut self) {
        self.owner.release_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Tracked;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_first_initialize_wins() {
        let drops = Arc::new(AtomicUsize::new(0));
        let shared = SharedHandle::new();

        assert!(shared.initialize(Tracked::new(1, &drops)));
        assert!(!shared.initialize(Tracked::new(2, &drops)));
        // The loser is dropped right away, the winner stays.
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(shared.with_handle(|h| h.id), Some(1));

        shared.release();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_acquire_bumps_count() {
        let drops = Arc::new(AtomicUsize::new(0));
        let shared = SharedHandle::new();
        shared.initialize(Tracked::new(7, &drops));
        assert_eq!(shared.ref_count(), 1);

        let first = shared.try_acquire().unwrap();
        let second = shared.try_acquire().unwrap();
        assert_eq!(shared.ref_count(), 3);
        assert_eq!(first.id, 7);

        // The owner leaves first, the handle outlives it while borrowed.
        shared.release();
        drop(first);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(second.id, 7);
        drop(second);

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(shared.ref_count(), 0);
        assert!(shared.is_released());
    }

    #[test]
    fn test_acquire_after_drain() {
        let drops = Arc::new(AtomicUsize::new(0));
        let shared = SharedHandle::new();
        shared.initialize(Tracked::new(1, &drops));
        shared.release();

        assert!(shared.try_acquire().is_none());
        assert_eq!(shared.with_handle(|_| ()), None);
        assert_eq!(shared.ref_count(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_uninitialized() {
        let shared: SharedHandle<Tracked> = SharedHandle::new();
        assert!(shared.try_acquire().is_none());
        assert_eq!(shared.ref_count(), 1);
        shared.release();
        assert!(shared.is_released());
    }

    #[test]
    fn test_initialize_after_release() {
        let drops = Arc::new(AtomicUsize::new(0));
        let shared = SharedHandle::new();
        shared.initialize(Tracked::new(1, &drops));
        shared.release();

        assert!(!shared.initialize(Tracked::new(2, &drops)));
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_without_release() {
        let drops = Arc::new(AtomicUsize::new(0));
        let shared = SharedHandle::new();
        shared.initialize(Tracked::new(1, &drops));
        drop(shared);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_with_handle_releases_on_panic() {
        let drops = Arc::new(AtomicUsize::new(0));
        let shared = SharedHandle::new();
        shared.initialize(Tracked::new(1, &drops));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            shared.with_handle(|_| panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(shared.ref_count(), 1);

        shared.release();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic]
    fn test_double_release() {
        let shared: SharedHandle<()> = SharedHandle::new();
        shared.initialize(());
        shared.release();
        shared.release();
    }

    // Many threads acquire and release while the owner lets go at a random point. The handle must be dropped
    // exactly once and the count must end at zero.
    #[test]
    fn test_racing_release() {
        for _ in 0..200 {
            let drops = Arc::new(AtomicUsize::new(0));
            let shared = Arc::new(SharedHandle::new());
            shared.initialize(Tracked::new(1, &drops));

            let threads: Vec<_> = (0..4)
                .map(|_| {
                    let shared = Arc::clone(&shared);
                    std::thread::spawn(move || {
                        for _ in 0..fastrand::usize(1..20) {
                            shared.with_handle(|h| assert_eq!(h.id, 1));
                        }
                    })
                })
                .collect();
            std::thread::yield_now();
            shared.release();
            for t in threads {
                t.join().unwrap();
            }

            assert_eq!(drops.load(Ordering::SeqCst), 1);
            assert_eq!(shared.ref_count(), 0);
        }
    }

    // Racing initializers: exactly one handle survives, every other one is dropped immediately.
    #[test]
    fn test_racing_initialize() {
        for _ in 0..100 {
            let drops = Arc::new(AtomicUsize::new(0));
            let shared = Arc::new(SharedHandle::new());
            let wins = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..4)
                .map(|id| {
                    let shared = Arc::clone(&shared);
                    let drops = Arc::clone(&drops);
                    let wins = Arc::clone(&wins);
                    std::thread::spawn(move || {
                        if shared.initialize(Tracked::new(id, &drops)) {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }

            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert_eq!(drops.load(Ordering::SeqCst), 3);
            shared.release();
            assert_eq!(drops.load(Ordering::SeqCst), 4);
        }
    }
}
