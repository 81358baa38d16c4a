use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Stale state: {0}")]
    StaleState(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The receiving context is already processing a session.
    #[error("Context busy: {0}")]
    Busy(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The remote side answered with an explicit failure.
    #[error("Remote failure: {0}")]
    RemoteFailure(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

impl RelayError {
    /// Prefixes the message while keeping the failure kind.
    pub fn with_context(self, context: impl std::fmt::Display) -> Self {
        let wrap = |msg: String| format!("{context}: {msg}");
        match self {
            RelayError::ResourceNotFound(m) => RelayError::ResourceNotFound(wrap(m)),
            RelayError::StaleState(m) => RelayError::StaleState(wrap(m)),
            RelayError::Timeout(m) => RelayError::Timeout(wrap(m)),
            RelayError::PermissionDenied(m) => RelayError::PermissionDenied(wrap(m)),
            RelayError::Busy(m) => RelayError::Busy(wrap(m)),
            RelayError::InvalidPayload(m) => RelayError::InvalidPayload(wrap(m)),
            RelayError::RemoteFailure(m) => RelayError::RemoteFailure(wrap(m)),
            RelayError::Unsupported(m) => RelayError::Unsupported(wrap(m)),
            RelayError::Platform(m) => RelayError::Platform(wrap(m)),
        }
    }

    /// Failures that retrying cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RelayError::PermissionDenied(_) | RelayError::InvalidPayload(_)
        )
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::InvalidPayload(e.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => RelayError::ResourceNotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => RelayError::PermissionDenied(e.to_string()),
            _ => RelayError::Platform(e.to_string()),
        }
    }
}
