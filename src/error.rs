//! Error types and error handling strategy.
//!
//! Structural failures (bad ids, misuse of promises, resuming dead
//! coroutines) are reported as [`Error`] values at the call site. Failures
//! inside task and coroutine bodies are panics: they are caught at the
//! worker/coroutine boundary, captured as a [`PanicPayload`], and either
//! handed to the core's panic handler or re-raised on the side that resumed
//! the coroutine. A failing task never kills its worker.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A context id, worker slot, or group index was out of range.
    OutOfRange,
    /// The operation is not valid in the current state (e.g. a redundant
    /// `join`).
    InvalidArgument,
    /// The coroutine already finished or was abandoned.
    CoroutineExpired,
    /// The promise was already satisfied with a value or a panic.
    PromiseAlreadySatisfied,
    /// The future's result was already taken by another handle.
    NoFutureState,
    /// Internal failure (e.g. the OS refused to spawn a worker thread).
    Internal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::OutOfRange => "out of range",
            Self::InvalidArgument => "invalid argument",
            Self::CoroutineExpired => "coroutine expired",
            Self::PromiseAlreadySatisfied => "promise already satisfied",
            Self::NoFutureState => "no future state",
            Self::Internal => "internal error",
        }
    }
}

/// The error type for conifer operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Attaches human-readable context to the error.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attaches an underlying cause to the error.
    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns true if the coroutine behind this error is gone.
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        matches!(self.kind, ErrorKind::CoroutineExpired)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{}: {}", self.kind.as_str(), context),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// A convenient `Result` alias for conifer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A captured panic from a task or coroutine body.
///
/// Carries the best-effort string form of the panic payload; the raw payload
/// itself is kept separately where re-raising is required.
#[derive(Debug, Clone)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a new panic payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Extracts a message from a raw payload produced by `catch_unwind`.
    #[must_use]
    pub fn from_any(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "<opaque panic payload>".to_string()
        };
        Self { message }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// Handler invoked on the polling worker thread when a task body panics.
pub type PanicHandler = Arc<dyn Fn(&PanicPayload) + Send + Sync>;
