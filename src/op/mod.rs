//! Facilities for safely sharing foreign operation state between the threads racing to complete, cancel and
//! release it.
//!
//! # Example
//!
//! Install the handle returned by `begin`, then let whichever party still holds a reference look at it.
//! ```
//! use callbridge::SharedHandle;
//!
//! let shared = SharedHandle::new();
//! assert!(shared.initialize(String::from("operation")));
//! assert_eq!(shared.with_handle(|h| h.len()), Some(9));
//!
//! // The owner lets go, and the handle is dropped with it.
//! shared.release();
//! assert!(shared.with_handle(|h| h.len()).is_none());
//! ```
mod once;
pub(crate) use once::TakeOnce;

mod operation;
pub use operation::{AsyncCallback, AsyncOperation, CallbackSource};

mod shared;
pub use shared::{Acquired, SharedHandle};
