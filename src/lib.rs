//! Bridges between foreign begin/end/callback asynchronous operations and Rust futures.
//!
//! A foreign runtime exposes asynchronous work as a `begin(callback) -> handle` / `end(handle) -> result` pair.
//! The operation may finish before `begin` returns, or later on any thread through the callback. This crate
//! adapts that protocol in both directions:
//!
//! - [`OutboundBridge`] calls out: it starts a foreign operation and resolves a [`BridgeFuture`] with the value
//!   returned by `end`, whichever way the operation completes.
//! - [`InboundBridge`] calls in: it wraps a local future into a context object the foreign runtime can drive
//!   with its own begin/end protocol.
//!
//! Foreign handles are shared between the thread which started an operation, the thread completing it and the
//! thread cancelling it through a [`SharedHandle`], which releases the handle exactly once.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use callbridge::{AsyncCallback, AsyncOperation, CancellationToken, Config, OutboundBridge};
//!
//! // An operation which is already finished when `begin` returns.
//! struct Ready;
//!
//! impl AsyncOperation for Ready {
//!     fn is_completed(&self) -> bool { true }
//!     fn completed_synchronously(&self) -> bool { true }
//!     fn cancel(&self) {}
//! }
//!
//! let bridge = OutboundBridge::new("ready", &Config::new());
//! let future = bridge.invoke(
//!     |_callback: Arc<dyn AsyncCallback<Ready>>| Ok(Ready),
//!     |_handle: &Ready| Ok(42),
//!     &CancellationToken::none(),
//! );
//! assert_eq!(future.wait().unwrap(), 42);
//! ```
//!
//! # Protocol violations
//! Calling `end` twice on an [`InboundBridge`], querying its completion mode before `begin` returned, or
//! releasing a [`SharedHandle`] more often than it was acquired are programming errors. They are logged and
//! then panic. Build with `panic = "abort"` to turn them into process termination.
#![warn(missing_debug_implementations, rust_2018_idioms)]

mod op;
pub use op::{Acquired, AsyncCallback, AsyncOperation, CallbackSource, SharedHandle};

mod error;
pub use error::{BridgeError, Constructor, ErrorCode, ErrorKind, ErrorTable, Result};

pub mod last_error;
pub use last_error::LastErrorChannel;

mod trace;
pub use trace::TracePolicy;

mod executor;
pub use executor::{Executor, Task, ThreadExecutor};

mod timer;

mod cancel;
pub use cancel::{CancellationSource, CancellationToken, Registration};

mod promise;
pub use promise::BridgeFuture;

mod config;
pub use config::Config;

mod outbound;
pub use outbound::OutboundBridge;

mod inbound;
pub use inbound::{run_sync, CompletionState, InboundBridge, InboundCallback};

#[cfg(test)]
mod testing;

/// A single-call invariant of the begin/end protocol was broken.
#[track_caller]
pub(crate) fn protocol_violation(message: &str) -> ! {
    log::error!("protocol violation: {}", message);
    panic!("protocol violation: {}", message)
}
