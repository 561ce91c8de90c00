//! Backend error types

use crate::io::process::ProcessError;

/// Errors from health-checking, installing or starting a single backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Server binary '{program}' not found in PATH")]
    BinaryNotFound { program: String },

    #[error("Container backend '{backend}' not found in PATH")]
    ContainerBackendNotFound { backend: String },

    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("Cannot infer container working directory from {folders} workspace folders; set one explicitly")]
    AmbiguousWorkdir { folders: usize },

    #[error("Installation of {binary} failed: {reason}")]
    InstallationFailed { binary: String, reason: String },

    #[error("Connection to {endpoint} failed: {source}")]
    ConnectionFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unix sockets are not supported on this platform")]
    UnixSocketsUnsupported,

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("{0}")]
    Runtime(String),
}

impl BackendError {
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        BackendError::Runtime(message.into())
    }

    pub fn installation_failed<B: Into<String>, R: Into<String>>(binary: B, reason: R) -> Self {
        BackendError::InstallationFailed {
            binary: binary.into(),
            reason: reason.into(),
        }
    }
}

/// Every candidate backend failed; carries one error per attempt.
#[derive(Debug)]
pub struct BackendSelectionError {
    /// (backend name, failure) per candidate tried, in order
    pub attempts: Vec<(String, BackendError)>,
}

impl std::fmt::Display for BackendSelectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "All servers failed to start:")?;
        for (backend, error) in &self.attempts {
            write!(f, " [{backend}] {error};")?;
        }
        Ok(())
    }
}

impl std::error::Error for BackendSelectionError {}
