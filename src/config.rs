use std::fmt;
use std::sync::Arc;

use crate::executor::{Executor, ThreadExecutor};
use crate::last_error::LastErrorChannel;
use crate::TracePolicy;

/// Settings shared by the bridges built from it.
///
/// ```
/// use callbridge::{Config, ThreadExecutor, TracePolicy};
///
/// let config = Config::new()
///     .trace_policy(TracePolicy::WarningExceptTransient)
///     .executor(ThreadExecutor);
/// assert_eq!(config.trace(), TracePolicy::WarningExceptTransient);
/// ```
#[derive(Clone)]
pub struct Config {
    trace: TracePolicy,
    executor: Arc<dyn Executor>,
    last_error: Arc<LastErrorChannel>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("trace", &self.trace)
            .field("last_error_limit", &self.last_error.limit())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Warn on failures, run deferred work on fresh threads, publish diagnostics on the process-wide channel.
    pub fn new() -> Self {
        Self {
            trace: TracePolicy::default(),
            executor: Arc::new(ThreadExecutor),
            last_error: LastErrorChannel::shared(),
        }
    }

    pub fn trace_policy(mut self, trace: TracePolicy) -> Self {
        self.trace = trace;
        self
    }

    /// Where call-in futures that do not finish right away are driven, and where work that must leave the
    /// current stack is sent.
    pub fn executor(mut self, executor: impl Executor) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// The channel failure diagnostics are published on when they cross back into the foreign runtime.
    pub fn last_error_channel(mut self, channel: Arc<LastErrorChannel>) -> Self {
        self.last_error = channel;
        self
    }

    pub fn trace(&self) -> TracePolicy {
        self.trace
    }

    pub(crate) fn shared_executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor)
    }

    pub(crate) fn last_error(&self) -> Arc<LastErrorChannel> {
        Arc::clone(&self.last_error)
    }
}
