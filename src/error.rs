//! Error taxonomy for mirror reconciliation.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// Malformed repository name or source URL
    #[error("invalid descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("clone of {url} failed: {message}")]
    CloneFailure { url: String, message: String },

    #[error("fetch into {} failed: {message}", path.display())]
    FetchFailure { path: PathBuf, message: String },

    #[error("filesystem error at {}: {message}", path.display())]
    FilesystemFailure { path: PathBuf, message: String },

    #[error("export daemon failed to launch: {0}")]
    DaemonLaunchFailure(String),

    /// Mutual exclusion for `name` could not be obtained in time
    #[error("lease on '{name}' not acquired within {waited:?}")]
    LeaseTimeout { name: String, waited: Duration },

    #[error("mirror state store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("mirror state store task failed: {0}")]
    StoreTask(String),
}

impl MirrorError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::FilesystemFailure {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type MirrorResult<T> = Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MirrorError::invalid("../etc", "name must not contain '..'");
        assert_eq!(
            err.to_string(),
            "invalid descriptor '../etc': name must not contain '..'"
        );

        let err = MirrorError::filesystem("/srv/mirrors/demo", "permission denied");
        assert_eq!(
            err.to_string(),
            "filesystem error at /srv/mirrors/demo: permission denied"
        );

        let err = MirrorError::LeaseTimeout {
            name: "demo".to_string(),
            waited: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("'demo'"));
    }
}
