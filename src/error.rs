use thiserror::Error;

/// Generic error type for the queue processor library.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error originating from the underlying `lapin` library.
    #[error("AMQP communication error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Error while encoding or decoding a queue item.
    #[error("Failed to (de)serialize queue item: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error writing dead-letter records or other local files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the handler logic. Carries the failure kind so callers can log it.
    #[error("{kind}: {message}")]
    Handler { kind: String, message: String },

    /// A worker was declared without a queue name.
    #[error("Worker declared without a queue name: {0}")]
    WorkerDeclaration(String),

    /// Two workers claimed the same queue name.
    #[error("Queue '{0}' is already registered")]
    DuplicateQueue(String),

    /// A built-in worker kind was never registered.
    #[error("Worker for queue '{0}' is not registered")]
    MissingWorker(String),

    /// `start()` was called before `setup()`.
    #[error("Worker for queue '{0}' was started before setup")]
    NotSetUp(String),

    /// Persistence failure from a notification store.
    #[error("Notification store error: {0}")]
    Store(#[from] StoreError),
}

impl WorkerError {
    /// Builds a handler error tagged with a failure kind, e.g. `EmailNotDelivered`.
    pub fn handler(kind: impl Into<String>, message: impl Into<String>) -> Self {
        WorkerError::Handler { kind: kind.into(), message: message.into() }
    }

    /// The short failure kind used in log lines.
    pub fn kind(&self) -> &str {
        match self {
            WorkerError::Amqp(_) => "AmqpError",
            WorkerError::Serialization(_) => "SerializationError",
            WorkerError::Io(_) => "IoError",
            WorkerError::Handler { kind, .. } => kind,
            WorkerError::WorkerDeclaration(_) => "WorkerDeclarationError",
            WorkerError::DuplicateQueue(_) => "DuplicateQueue",
            WorkerError::MissingWorker(_) => "MissingWorker",
            WorkerError::NotSetUp(_) => "NotSetUp",
            WorkerError::Store(_) => "StoreError",
        }
    }
}

// Allow converting from a string-like type into a generic handler error
impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::handler("HandlerError", s)
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::handler("HandlerError", s)
    }
}

/// Errors reported by notification persistence backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The row references a missing target or violates a uniqueness constraint.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("backend error: {0}")]
    Backend(String),
}
