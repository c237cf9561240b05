//! Best effort side channel carrying human readable diagnostics next to a failure code.
//!
//! Error codes are the authoritative result crossing the boundary. The text published here only enriches them,
//! and may be overwritten by a concurrent failure on another thread.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use lazy_static::lazy_static;

use crate::BridgeError;

/// Default maximum length, in bytes, of a published message.
pub const DEFAULT_LIMIT: usize = 4096;

lazy_static! {
    static ref GLOBAL_CHANNEL: Arc<LastErrorChannel> = Arc::new(LastErrorChannel::new(DEFAULT_LIMIT));
}

#[derive(Debug)]
pub struct LastErrorChannel {
    text: Mutex<Option<String>>,
    limit: AtomicUsize,
}

impl LastErrorChannel {
    pub fn new(limit: usize) -> Self {
        Self {
            text: Mutex::new(None),
            limit: AtomicUsize::new(limit),
        }
    }

    /// The channel shared by the whole process.
    pub fn global() -> &'static LastErrorChannel {
        &GLOBAL_CHANNEL
    }

    pub(crate) fn shared() -> Arc<LastErrorChannel> {
        Arc::clone(&GLOBAL_CHANNEL)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed)
    }

    /// Publish `message`, followed by `stack` on its own line when given. The text is cut to the limit.
    pub fn set(&self, message: &str, stack: Option<&str>) {
        let mut text = match stack {
            Some(stack) if !stack.is_empty() => format!("{}\n{}", message, stack),
            _ => message.to_owned(),
        };
        truncate(&mut text, self.limit());
        *self.text.lock().unwrap_or_else(PoisonError::into_inner) = Some(text);
    }

    /// Publish the description of `error`, including its chain of sources.
    pub fn set_error(&self, error: &BridgeError) {
        let mut chain = String::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            if !chain.is_empty() {
                chain.push('\n');
            }
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        self.set(&error.to_string(), Some(&chain));
    }

    pub fn get(&self) -> Option<String> {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Option<String> {
        self.text.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn clear(&self) {
        self.take();
    }
}

impl Default for LastErrorChannel {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

/// Publish on the process-wide channel.
pub fn set(message: &str, stack: Option<&str>) {
    LastErrorChannel::global().set(message, stack)
}

/// Read the process-wide channel without consuming it.
pub fn get() -> Option<String> {
    LastErrorChannel::global().get()
}

/// Read and clear the process-wide channel.
pub fn take() -> Option<String> {
    LastErrorChannel::global().take()
}

fn truncate(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_take() {
        let channel = LastErrorChannel::new(64);
        assert!(channel.get().is_none());

        channel.set("write quorum lost", Some("at replicate()"));
        assert_eq!(
            channel.get().as_deref(),
            Some("write quorum lost\nat replicate()")
        );
        assert_eq!(
            channel.take().as_deref(),
            Some("write quorum lost\nat replicate()")
        );
        assert!(channel.take().is_none());
    }

    #[test]
    fn test_truncated_to_limit() {
        let channel = LastErrorChannel::new(8);
        channel.set("0123456789", None);
        assert_eq!(channel.get().as_deref(), Some("01234567"));

        // Never split a multi-byte character.
        channel.set("abcdefgé", None);
        assert_eq!(channel.get().as_deref(), Some("abcdefg"));

        channel.set_limit(0);
        channel.set("gone", Some("entirely"));
        assert_eq!(channel.get().as_deref(), Some(""));
    }

    #[test]
    fn test_set_error() {
        let channel = LastErrorChannel::new(128);
        channel.set_error(&BridgeError::invalid_argument("timeout out of range"));
        assert_eq!(
            channel.get().as_deref(),
            Some("invalid argument: timeout out of range")
        );
        channel.clear();
        assert!(channel.get().is_none());
    }
}
