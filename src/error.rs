use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CcdError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Error in executable {program} ({status})")]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("Executable {program} not found")]
    ExecutableMissing { program: String },
    #[error("Output file already exists: {}", .0.display())]
    OutputAlreadyExists(PathBuf),
    #[error("FITS header update failed: {0}")]
    HeaderWriteFailed(String),
    #[error("A sequence is already running")]
    AlreadyRunning,
    #[error("Unknown voltage rail: {0}")]
    UnknownRail(String),
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closed failure taxonomy reported to observers of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    InvalidRequest,
    ProcessFailed,
    ExecutableMissing,
    OutputAlreadyExists,
    HeaderWriteFailed,
    AlreadyRunning,
    Io,
}

impl CcdError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CcdError::InvalidRequest(_) | CcdError::UnknownRail(_) => ErrorKind::InvalidRequest,
            CcdError::ProcessFailed { .. } => ErrorKind::ProcessFailed,
            CcdError::ExecutableMissing { .. } => ErrorKind::ExecutableMissing,
            CcdError::OutputAlreadyExists(_) => ErrorKind::OutputAlreadyExists,
            CcdError::HeaderWriteFailed(_) => ErrorKind::HeaderWriteFailed,
            CcdError::AlreadyRunning => ErrorKind::AlreadyRunning,
            CcdError::Io { .. } | CcdError::Json(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        CcdError::Io {
            source,
            context: context.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            CcdError::UnknownRail("VXX".to_string()).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            CcdError::ExecutableMissing {
                program: "exp_acq".to_string()
            }
            .kind(),
            ErrorKind::ExecutableMissing
        );
        assert_eq!(
            CcdError::io(std::io::Error::other("disk"), "writing").kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn test_process_failed_message() {
        let err = CcdError::ProcessFailed {
            program: "dark_acq".to_string(),
            status: "exit status: 2".to_string(),
            stderr: String::new(),
        };
        assert_eq!(
            err.to_string(),
            "Error in executable dark_acq (exit status: 2)"
        );
    }
}
