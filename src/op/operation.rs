use std::sync::Arc;

/// The base capability every in-flight foreign operation exposes.
///
/// Implementors are handles owned by the foreign runtime. Dropping a handle value releases the
/// reference it holds, so a handle must only ever be dropped once per reference handed out.
pub trait AsyncOperation: Send + Sync + 'static {
    /// True once the operation has produced its result and `end` may be called without blocking.
    fn is_completed(&self) -> bool;

    /// True if the operation finished before `begin` returned to its caller.
    fn completed_synchronously(&self) -> bool;

    /// Ask the operation to finish early. Cancellation is advisory, the operation still completes
    /// through its normal path.
    fn cancel(&self);
}

/// Extension tier for operations which can hand back the callback they were started with.
pub trait CallbackSource<C>: AsyncOperation {
    fn callback(&self) -> Option<Arc<dyn AsyncCallback<C>>>;
}

/// Completion callback registered with `begin`. The foreign side may invoke it from any thread,
/// including from inside the `begin` call itself.
pub trait AsyncCallback<C>: Send + Sync + 'static {
    fn invoke(&self, context: C);
}

impl<C, F> AsyncCallback<C> for F
where
    F: Fn(C) + Send + Sync + 'static,
{
    fn invoke(&self, context: C) {
        (self)(context)
    }
}
