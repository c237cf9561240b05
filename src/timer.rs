//! One process-wide thread firing deadline callbacks, earliest deadline first.
//!
//! Cancelled timers are dropped from the pending map right away. Their heap entries stay behind until their
//! deadline comes up, and are then skipped.
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use ahash::AHashMap;
use lazy_static::lazy_static;
use log::{error, trace};

type Callback = Box<dyn FnOnce() + Send + 'static>;

lazy_static! {
    static ref TIMER: Arc<Timer> = Timer::start();
}

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TimerId(u64);

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    id: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed, so the max-heap yields the earliest deadline.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Entry>,
    pending: AHashMap<u64, Callback>,
    next_id: u64,
}

impl State {
    fn pop_expired(&mut self, now: Instant) -> Vec<Callback> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let id = entry.id;
            self.heap.pop();
            if let Some(callback) = self.pending.remove(&id) {
                expired.push(callback);
            }
        }
        expired
    }
}

struct Timer {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Timer {
    fn start() -> Arc<Timer> {
        let timer = Arc::new(Timer {
            state: Mutex::new(State::default()),
            condvar: Condvar::new(),
        });
        let runner = Arc::clone(&timer);
        let spawned = thread::Builder::new()
            .name("callbridge-timer".into())
            .spawn(move || runner.run());
        if let Err(e) = spawned {
            error!("failed to spawn the timer thread, deadlines will not fire: {}", e);
        }
        timer
    }

    fn run(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let expired = state.pop_expired(Instant::now());
            if !expired.is_empty() {
                // Callbacks may schedule or cancel timers themselves.
                drop(state);
                trace!("firing {} timers", expired.len());
                for callback in expired {
                    callback();
                }
                state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            state = match state.heap.peek().map(|e| e.deadline) {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    self.condvar
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .condvar
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

/// Run `callback` on the timer thread once `deadline` passes.
pub(crate) fn schedule(deadline: Instant, callback: impl FnOnce() + Send + 'static) -> TimerId {
    let timer = &*TIMER;
    let mut state = timer.state.lock().unwrap_or_else(PoisonError::into_inner);
    let id = state.next_id;
    state.next_id += 1;
    state.pending.insert(id, Box::new(callback));
    let earliest = state.heap.peek().map_or(true, |e| deadline < e.deadline);
    state.heap.push(Entry { deadline, id });
    if earliest {
        timer.condvar.notify_one();
    }
    TimerId(id)
}

/// Forget a timer. Returns false if it already fired or was cancelled.
pub(crate) fn cancel(id: TimerId) -> bool {
    let callback = {
        let mut state = TIMER.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending.remove(&id.0)
    };
    // Dropped outside the lock, the callback may own anything.
    callback.is_some()
}
