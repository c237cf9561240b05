//! Running work on an execution context other than the current call stack.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::thread;

use log::error;

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Something which can drive a [`Task`] to completion away from the caller's stack.
pub trait Executor: Send + Sync + 'static {
    fn spawn(&self, task: Task);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn spawn(&self, task: Task) {
        (**self).spawn(task)
    }
}

/// Runs every task on a fresh OS thread, blocking that thread until the task finishes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn spawn(&self, task: Task) {
        let spawned = thread::Builder::new()
            .name("callbridge-task".into())
            .spawn(move || futures_lite::future::block_on(task));
        if let Err(e) = spawned {
            error!("failed to spawn a bridge task thread: {}", e);
        }
    }
}

/// Run `f` on `executor` instead of the current stack.
pub(crate) fn defer(executor: &dyn Executor, f: impl FnOnce() + Send + 'static) {
    executor.spawn(Box::pin(async move { f() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_thread_executor_leaves_current_thread() {
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        defer(&ThreadExecutor, move || {
            tx.send(thread::current().id()).unwrap();
        });
        let ran_on = rx.recv().unwrap();
        assert_ne!(ran_on, caller);
    }

    #[test]
    fn test_thread_executor_drives_futures() {
        let (tx, rx) = mpsc::channel();
        let executor: Arc<dyn Executor> = Arc::new(ThreadExecutor);
        executor.spawn(Box::pin(async move {
            futures_lite::future::yield_now().await;
            tx.send(7).unwrap();
        }));
        assert_eq!(rx.recv().unwrap(), 7);
    }
}
