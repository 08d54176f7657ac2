//! Error types for the beanstalk workers library.

use thiserror::Error;

/// The main error type for the beanstalk workers library.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Transport error on the server connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No job became ready within the reserve timeout.
    #[error("Reserve timed out")]
    Timeout,

    /// A job reserved by this connection is about to exceed its time-to-run.
    #[error("Deadline soon")]
    DeadlineSoon,

    /// The job does not exist or is not reserved by this connection.
    #[error("Job not found: {0}")]
    NotFound(u64),

    /// The server ran out of memory while releasing and buried the job instead.
    #[error("Job buried: {0}")]
    Buried(u64),

    /// Error reply sent by the server.
    #[error("Server error: {0}")]
    Server(String),

    /// Reply that does not follow the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Stats snapshot with a missing or malformed field.
    #[error("Stats error: {0}")]
    Stats(String),

    /// Operation attempted on a closed connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The client is already running a reservation loop.
    #[error("Client is already running")]
    AlreadyRunning,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    /// Whether this is the expected "nothing ready" outcome of a reservation.
    pub fn is_timeout_or_deadline(&self) -> bool {
        matches!(self, WorkerError::Timeout | WorkerError::DeadlineSoon)
    }
}

/// Result type alias using WorkerError.
pub type Result<T> = std::result::Result<T, WorkerError>;
