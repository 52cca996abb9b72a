//! Parrot error types

use thiserror::Error;

/// Parrot error type
#[derive(Error, Debug)]
pub enum Error {
    /// A scan is already running for this (guild, user) pair
    #[error("A scan is already running for user {user} in guild {guild}")]
    DuplicateScan { guild: u64, user: u64 },

    /// The user has not opted in to having their messages collected
    #[error("User {user} is not registered in guild {guild}")]
    NotRegistered { guild: u64, user: u64 },

    /// The requester may not act on this user's data
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Corpus fetch or model training failed
    #[error("Failed to build model: {0}")]
    BuildFailure(String),

    /// There is nothing to learn from
    #[error("No data available for user {user} in guild {guild}")]
    NoData { guild: u64, user: u64 },

    /// Some cascading deletion steps failed after others committed
    #[error("Deletion incomplete ({} step(s) failed): {}", failures.len(), failures.join("; "))]
    DeletionIncomplete { failures: Vec<String> },

    /// The platform could not confirm that a member is gone
    #[error("Could not confirm absence of user {user} from guild {guild}: {reason}")]
    AbsenceUnconfirmed { guild: u64, user: u64, reason: String },

    /// Chat platform error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for Parrot operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deletion_incomplete_message() {
        let err = Error::DeletionIncomplete {
            failures: vec!["avatar 1/2".to_string(), "avatar 3/4".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Deletion incomplete (2 step(s) failed): avatar 1/2; avatar 3/4"
        );
    }

    #[test]
    fn test_duplicate_scan_message() {
        let err = Error::DuplicateScan { guild: 1, user: 2 };
        assert!(err.to_string().contains("already running"));
    }
}
