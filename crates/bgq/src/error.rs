/// Error raised in the worker process and re-surfaced in the launcher.
///
/// Severity is capped at `ERROR` before it reaches the caller: a fatal
/// condition inside the worker must never take the launcher down with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub pid: u32,
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "worker {} failed: {}: {}",
            self.pid, self.severity, self.message
        )?;
        if let Some(detail) = &self.detail {
            write!(f, " (detail: {detail})")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    /// Rejected before any resource was allocated (bad queue size, bad
    /// timeout, empty work, ...).
    InvalidParameter(String),
    /// A configured hard limit was exceeded (work payload or queue size).
    LimitExceeded(String),
    /// Allocation or process-start failure; fatal to the call, nothing was
    /// left registered.
    ResourceExhausted(String),
    /// No worker with this pid is attached to the session.
    NotFound { pid: u32 },
    /// The pid is known but the handle cookie no longer matches it.
    StaleHandle { pid: u32 },
    /// Results for this worker were already read once.
    AlreadyConsumed { pid: u32 },
    /// The worker was launched fire-and-forget; it has no consumable result.
    ResultDisabled { pid: u32 },
    /// The caller's identity has no rights over the entry's owner.
    PermissionDenied { pid: u32 },
    /// Malformed or out-of-order message on the result queue.
    ProtocolViolation(String),
    /// The worker's result rowtype does not match the caller-declared shape.
    ShapeMismatch(String),
    /// The queue closed without a terminal ready marker: the worker died
    /// before finishing.
    ConnectionLost { pid: u32 },
    /// The worker used a protocol feature this layer refuses to relay.
    Unsupported(&'static str),
    /// The worker's unit of work failed; severity already capped.
    Remote(RemoteError),
    /// Pid collision across differing owners; fatal to the whole session.
    IntegrityViolation(String),
    /// The caller's own interrupt flag was raised during a blocking loop.
    Interrupted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Error::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            Error::ResourceExhausted(msg) => write!(f, "resource exhaustion: {msg}"),
            Error::NotFound { pid } => {
                write!(f, "worker pid {pid} is not attached to this session")
            }
            Error::StaleHandle { pid } => {
                write!(f, "stale handle: cookie does not match worker pid {pid}")
            }
            Error::AlreadyConsumed { pid } => {
                write!(f, "results for worker pid {pid} have already been consumed")
            }
            Error::ResultDisabled { pid } => {
                write!(f, "worker pid {pid} was launched without a result queue")
            }
            Error::PermissionDenied { pid } => {
                write!(f, "permission denied for worker pid {pid}")
            }
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Error::ShapeMismatch(msg) => write!(f, "result shape mismatch: {msg}"),
            Error::ConnectionLost { pid } => {
                write!(f, "lost connection to worker process with pid {pid}")
            }
            Error::Unsupported(what) => write!(f, "{what} is not supported"),
            Error::Remote(e) => write!(f, "{e}"),
            Error::IntegrityViolation(msg) => write!(f, "integrity violation: {msg}"),
            Error::Interrupted => write!(f, "interrupted by caller"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
