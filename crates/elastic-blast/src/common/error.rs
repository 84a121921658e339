use thiserror::Error;

use crate::cloud::CloudError;
use crate::config::ConfigError;
use crate::provision::ProvisionError;
use crate::split::SplitError;
use crate::status::PollError;
use crate::submit::SubmissionError;

#[derive(Debug, Error)]
pub enum ElbError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("Search failed: {0}")]
    SearchFailed(String),
    #[error("Interrupted")]
    Interrupted,
    #[error("Missing dependency: {0}")]
    Dependency(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl ElbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ElbError::Config(_) => ErrorKind::Input,
            ElbError::Split(error) => error.kind(),
            ElbError::Provision(error) => error.kind(),
            ElbError::Submission(error) => error.kind(),
            ElbError::Poll(error) => error.kind(),
            ElbError::Cloud(error) => error.kind(),
            ElbError::SearchFailed(_) => ErrorKind::SearchFailed,
            ElbError::Interrupted => ErrorKind::Interrupted,
            ElbError::Dependency(_) => ErrorKind::Dependency,
            ElbError::IoError(_) | ElbError::SerializationError(_) | ElbError::GenericError(_) => {
                ErrorKind::Unknown
            }
        }
    }
}

/// Closed classification of everything that can end a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration or query input.
    Input,
    /// Missing or broken local tooling (cloud CLIs, kubectl).
    Dependency,
    /// The cloud control plane or the cluster rejected an operation.
    Cluster,
    /// At least one search job failed.
    SearchFailed,
    TimedOut,
    Interrupted,
    Unknown,
}

/// What a caller should do after an operation failed with a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Retry,
    Abort,
}

pub const EXIT_SUCCESS: i32 = 0;

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Input => 1,
            ErrorKind::Dependency => 2,
            ErrorKind::Cluster => 3,
            ErrorKind::SearchFailed => 4,
            ErrorKind::TimedOut => 5,
            ErrorKind::Interrupted => 130,
            ErrorKind::Unknown => 255,
        }
    }

    /// Only failures of remote operations are worth repeating.
    pub fn continuation(self) -> Continuation {
        match self {
            ErrorKind::Cluster => Continuation::Retry,
            ErrorKind::Input
            | ErrorKind::Dependency
            | ErrorKind::SearchFailed
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::Unknown => Continuation::Abort,
        }
    }
}

impl From<serde_json::error::Error> for ElbError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for ElbError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::{ElbError, ErrorKind};
    use crate::cloud::CloudError;
    use crate::config::{ConfigError, ConfigViolation};

    #[test]
    fn test_config_error_is_input_error() {
        let error: ElbError = ConfigError::new(vec![ConfigViolation::new("num-nodes", "must be positive")]).into();
        assert_eq!(error.kind(), ErrorKind::Input);
        assert_eq!(error.kind().exit_code(), 1);
    }

    #[test]
    fn test_missing_tool_is_dependency_error() {
        let error: ElbError = CloudError::MissingTool {
            program: "kubectl".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
        .into();
        assert_eq!(error.kind(), ErrorKind::Dependency);
        assert_eq!(error.kind().exit_code(), 2);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::Input,
            ErrorKind::Dependency,
            ErrorKind::Cluster,
            ErrorKind::SearchFailed,
            ErrorKind::TimedOut,
            ErrorKind::Interrupted,
            ErrorKind::Unknown,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&super::EXIT_SUCCESS));
    }
}
