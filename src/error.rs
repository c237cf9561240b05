//! Failures crossing the bridge, and the translation between foreign error codes and local errors.
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use ahash::AHashMap;
use lazy_static::lazy_static;

use crate::last_error::LastErrorChannel;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Numeric status code used by the foreign runtime. Failures have the high bit set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0);
    pub const ABORT: ErrorCode = ErrorCode(0x8000_4004_u32 as i32);
    pub const FAIL: ErrorCode = ErrorCode(0x8000_4005_u32 as i32);
    pub const INVALID_ARGUMENT: ErrorCode = ErrorCode(0x8007_0057_u32 as i32);
    pub const TIMEOUT: ErrorCode = ErrorCode(0x8007_05b4_u32 as i32);
    pub const OBJECT_CLOSED: ErrorCode = ErrorCode(0x8007_1bbe_u32 as i32);
    pub const NOT_PRIMARY: ErrorCode = ErrorCode(0x8007_1bc2_u32 as i32);
    pub const NO_WRITE_QUORUM: ErrorCode = ErrorCode(0x8007_1bc3_u32 as i32);
    pub const RECONFIGURATION_PENDING: ErrorCode = ErrorCode(0x8007_1bc4_u32 as i32);
    pub const NOT_READY: ErrorCode = ErrorCode(0x8007_1bc8_u32 as i32);
    pub const SERVICE_TOO_BUSY: ErrorCode = ErrorCode(0x8007_1bca_u32 as i32);
    pub const COMMUNICATION: ErrorCode = ErrorCode(0x8007_1bcc_u32 as i32);
    pub const ELEMENT_NOT_FOUND: ErrorCode = ErrorCode(0x8007_1bd0_u32 as i32);
    pub const ELEMENT_ALREADY_EXISTS: ErrorCode = ErrorCode(0x8007_1bd1_u32 as i32);
    pub const INVALID_OPERATION: ErrorCode = ErrorCode(0x8007_1bd4_u32 as i32);

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode({})", self)
    }
}

/// Local error kinds a foreign failure code can translate into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    ObjectClosed,
    NotPrimary,
    NoWriteQuorum,
    ReconfigurationPending,
    NotReady,
    ServiceTooBusy,
    Communication,
    ElementNotFound,
    ElementAlreadyExists,
    InvalidOperation,
}

impl ErrorKind {
    /// Transient failures are expected to go away if the operation is retried.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::NoWriteQuorum
                | ErrorKind::ReconfigurationPending
                | ErrorKind::NotReady
                | ErrorKind::ServiceTooBusy
                | ErrorKind::Communication
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "operation timed out",
            ErrorKind::ObjectClosed => "object closed",
            ErrorKind::NotPrimary => "not primary",
            ErrorKind::NoWriteQuorum => "no write quorum",
            ErrorKind::ReconfigurationPending => "reconfiguration pending",
            ErrorKind::NotReady => "not ready",
            ErrorKind::ServiceTooBusy => "service too busy",
            ErrorKind::Communication => "communication failure",
            ErrorKind::ElementNotFound => "element not found",
            ErrorKind::ElementAlreadyExists => "element already exists",
            ErrorKind::InvalidOperation => "invalid operation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// A failure reported by the foreign runtime and translated through the [`ErrorTable`].
    #[error("{kind} ({code}){}", detail(.message))]
    Foreign {
        kind: ErrorKind,
        code: ErrorCode,
        message: Option<String>,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("cancellation source disposed")]
    Disposed,
    /// A foreign failure code with no entry in the [`ErrorTable`].
    #[error("unknown failure ({code}){}", detail(.message))]
    Unknown {
        code: ErrorCode,
        message: Option<String>,
    },
}

fn detail(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(": {}", m),
        None => String::new(),
    }
}

impl BridgeError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BridgeError::InvalidArgument(message.into())
    }

    /// The code this error is reported as when it crosses back into the foreign runtime.
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Foreign { code, .. } | BridgeError::Unknown { code, .. } => *code,
            BridgeError::InvalidArgument(_) => ErrorCode::INVALID_ARGUMENT,
            BridgeError::Cancelled => ErrorCode::ABORT,
            BridgeError::Disposed => ErrorCode::OBJECT_CLOSED,
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            BridgeError::Foreign { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().map_or(false, ErrorKind::is_transient)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeError::Cancelled)
    }
}

impl From<ErrorCode> for BridgeError {
    fn from(code: ErrorCode) -> Self {
        ErrorTable::global().translate(code)
    }
}

/// Builds the local error for one foreign code, given the diagnostic text available at the time.
pub type Constructor = Arc<dyn Fn(ErrorCode, Option<String>) -> BridgeError + Send + Sync>;

/// Lookup from foreign error codes to local error constructors.
pub struct ErrorTable {
    entries: RwLock<AHashMap<ErrorCode, Constructor>>,
}

lazy_static! {
    static ref GLOBAL_TABLE: ErrorTable = ErrorTable::standard();
}

const STANDARD_KINDS: &[(ErrorCode, ErrorKind)] = &[
    (ErrorCode::TIMEOUT, ErrorKind::Timeout),
    (ErrorCode::OBJECT_CLOSED, ErrorKind::ObjectClosed),
    (ErrorCode::NOT_PRIMARY, ErrorKind::NotPrimary),
    (ErrorCode::NO_WRITE_QUORUM, ErrorKind::NoWriteQuorum),
    (
        ErrorCode::RECONFIGURATION_PENDING,
        ErrorKind::ReconfigurationPending,
    ),
    (ErrorCode::NOT_READY, ErrorKind::NotReady),
    (ErrorCode::SERVICE_TOO_BUSY, ErrorKind::ServiceTooBusy),
    (ErrorCode::COMMUNICATION, ErrorKind::Communication),
    (ErrorCode::ELEMENT_NOT_FOUND, ErrorKind::ElementNotFound),
    (
        ErrorCode::ELEMENT_ALREADY_EXISTS,
        ErrorKind::ElementAlreadyExists,
    ),
    (ErrorCode::INVALID_OPERATION, ErrorKind::InvalidOperation),
];

impl ErrorTable {
    /// A table with no entries. Every code translates to [`BridgeError::Unknown`].
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(AHashMap::new()),
        }
    }

    /// A table with the codes this crate knows about.
    pub fn standard() -> Self {
        let table = Self::new();
        table.register(ErrorCode::ABORT, |_, _| BridgeError::Cancelled);
        table.register(ErrorCode::INVALID_ARGUMENT, |_, message| {
            BridgeError::InvalidArgument(message.unwrap_or_else(|| "rejected by callee".into()))
        });
        for &(code, kind) in STANDARD_KINDS {
            table.register(code, move |code, message| BridgeError::Foreign {
                kind,
                code,
                message,
            });
        }
        table
    }

    /// The process-wide table used by `From<ErrorCode> for BridgeError`.
    pub fn global() -> &'static ErrorTable {
        &GLOBAL_TABLE
    }

    /// Add or replace the constructor for `code`.
    pub fn register<F>(&self, code: ErrorCode, constructor: F)
    where
        F: Fn(ErrorCode, Option<String>) -> BridgeError + Send + Sync + 'static,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(code, Arc::new(constructor));
    }

    /// Translate `code`, consuming the text published on the process-wide last-error channel.
    pub fn translate(&self, code: ErrorCode) -> BridgeError {
        self.translate_with(code, LastErrorChannel::global())
    }

    pub fn translate_with(&self, code: ErrorCode, channel: &LastErrorChannel) -> BridgeError {
        let message = channel.take();
        let constructor = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries.get(&code).cloned()
        };
        match constructor {
            Some(constructor) => constructor(code, message),
            None => BridgeError::Unknown { code, message },
        }
    }
}

impl Default for ErrorTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for ErrorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ErrorTable")
            .field("entries", &entries.len())
            .finish()
    }
}
