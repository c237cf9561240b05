//! How failures of bridged operations are reported to the log.
use log::{info, warn};

use crate::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePolicy {
    /// Failures are not logged.
    Never,
    Info,
    Warning,
    /// Warn, except for transient failures and cancellations which are expected and logged at info level.
    WarningExceptTransient,
}

impl Default for TracePolicy {
    fn default() -> Self {
        TracePolicy::Warning
    }
}

impl TracePolicy {
    /// The level `error` is logged at under this policy, if any.
    pub fn level(self, error: &BridgeError) -> Option<log::Level> {
        match self {
            TracePolicy::Never => None,
            TracePolicy::Info => Some(log::Level::Info),
            TracePolicy::Warning => Some(log::Level::Warn),
            TracePolicy::WarningExceptTransient => {
                if error.is_transient() || error.is_cancelled() {
                    Some(log::Level::Info)
                } else {
                    Some(log::Level::Warn)
                }
            }
        }
    }

    pub(crate) fn trace(self, tag: &str, error: &BridgeError) {
        match self.level(error) {
            Some(log::Level::Warn) => warn!("{} failed: {} ({})", tag, error, error.code()),
            Some(_) => info!("{} failed: {} ({})", tag, error, error.code()),
            None => {}
        }
    }
}
