//! Global error handling for kvbackup
//!
//! This module provides a centralized error type that can represent errors
//! from all modules in the project.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;
use crate::store::StoreError;

/// Global error type for kvbackup operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// Missing or invalid account/preference settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another instance holds the process lock
    #[error(
        "{} is locked by {}. Close the other instance, or delete {} manually if none is running",
        .path.display(),
        describe_holder(.pid),
        .path.display()
    )]
    Locked {
        /// Lock marker path
        path: PathBuf,
        /// Process id recorded in the marker, if readable
        pid: Option<u32>,
    },

    /// File system errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Ledger file could not be opened or written
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Ledger line could not be decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Object store transport errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A file's payload could not be transferred
    #[error("Transfer of {key} failed: {reason}")]
    Transfer {
        /// Remote key being written
        key: String,
        /// What went wrong
        reason: String,
    },

    /// A location resolved outside the home directory
    #[error("Path is outside the home directory: {}", .0.display())]
    PathOutsideHome(PathBuf),

    /// JSON processing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Preference file errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Regular expression errors
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl BackupError {
    /// Whether this error only affects the file being transferred.
    ///
    /// Everything else (configuration, lock, ledger) ends the invocation.
    pub fn is_file_scoped(&self) -> bool {
        matches!(
            self,
            BackupError::Transfer { .. }
                | BackupError::Store(_)
                | BackupError::Io(_)
                | BackupError::PathOutsideHome(_)
        )
    }
}

fn describe_holder(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!("process {}", pid),
        None => "an unknown process".to_string(),
    }
}

/// Specialized Result type for kvbackup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Creates a BackupError with a formatted message
#[macro_export]
macro_rules! error {
    ($error_type:ident, $($arg:tt)*) => {
        $crate::error::BackupError::$error_type(format!($($arg)*))
    };
}

/// Returns an error result with a formatted message
#[macro_export]
macro_rules! bail {
    ($error_type:ident, $($arg:tt)*) => {
        return Err($crate::error!($error_type, $($arg)*))
    };
}

/// Ensures a condition is true, otherwise returns an error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $error_type:ident, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($error_type, $($arg)*)
        }
    };
}

/// Extension trait for adding context to errors
pub trait ResultExt<T, E> {
    /// Turn any error into a ledger error with the given context
    fn ledger_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display;
}

impl<T, E: std::error::Error + 'static> ResultExt<T, E> for std::result::Result<T, E> {
    fn ledger_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display,
    {
        self.map_err(|e| {
            let context = f();
            BackupError::Ledger(format!("{}: {}", context, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_message_names_the_marker() {
        let err = BackupError::Locked {
            path: PathBuf::from("lock.pid"),
            pid: Some(42),
        };
        let msg = err.to_string();
        assert!(msg.contains("lock.pid"));
        assert!(msg.contains("process 42"));
        assert!(msg.contains("delete"));
    }

    #[test]
    fn test_file_scoped_classification() {
        let transfer = BackupError::Transfer {
            key: "abc".to_string(),
            reason: "rejected".to_string(),
        };
        assert!(transfer.is_file_scoped());
        assert!(!error!(Config, "missing {}", "email").is_file_scoped());
        assert!(!BackupError::Locked {
            path: PathBuf::from("lock.pid"),
            pid: None
        }
        .is_file_scoped());
    }

    #[test]
    fn test_ensure_macro() {
        fn check(v: u32) -> Result<u32> {
            ensure!(v > 1, InvalidArgument, "value {} too small", v);
            Ok(v)
        }
        assert!(check(2).is_ok());
        let err = check(0).unwrap_err();
        assert_eq!(err.to_string(), "Invalid argument: value 0 too small");
    }
}
