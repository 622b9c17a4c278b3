//! Common error types

use protocol::DeviceKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Whitelist persistence failed (I/O or corrupt contents)
    #[error("Whitelist storage error ({}): {reason}", .path.display())]
    Storage { path: PathBuf, reason: String },

    /// The host inventory query itself failed
    #[error("USB enumeration failed: {0}")]
    Enumeration(String),

    /// The requested action conflicts with the whitelist invariant
    #[error("Policy violation for {key}: {reason}")]
    PolicyViolation { key: DeviceKey, reason: String },

    /// The external device control mechanism failed or timed out
    #[error("Device control failed for {key}: {failure}")]
    DeviceControl {
        key: DeviceKey,
        failure: ControlFailure,
    },

    /// A referenced file does not exist
    #[error("File not found: {}", .path.display())]
    NotFound { path: PathBuf },

    /// No attached device carries the requested key
    #[error("No attached device matches {0}")]
    DeviceNotFound(DeviceKey),

    /// One or more devices failed during a bulk operation
    #[error(
        "Failed to {operation} {} device(s):\n{}",
        .failures.len(),
        describe_failures(.failures)
    )]
    Aggregate {
        operation: BulkOperation,
        failures: Vec<DeviceFailure>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a storage error for `path`
    pub fn storage(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Storage {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error was raised before any external call was made
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::PolicyViolation { .. })
    }
}

/// Why a device control invocation failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlFailure {
    /// The utility ran and exited unsuccessfully
    #[error("exit code {}\nOutput: {stdout}\nError: {stderr}", format_exit_code(.code))]
    NonZeroExit {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// The utility could not be started
    #[error("failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    /// The utility did not finish in time and was killed
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

fn format_exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none (terminated by signal)".to_string())
}

/// Bulk operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperation {
    BlockAll,
    UnblockAll,
}

impl fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockAll => write!(f, "block"),
            Self::UnblockAll => write!(f, "unblock"),
        }
    }
}

/// One device's failure inside a bulk operation
#[derive(Debug)]
pub struct DeviceFailure {
    pub instance_id: String,
    pub key: DeviceKey,
    pub description: String,
    pub error: Error,
}

impl fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (VID:{} PID:{}): {}",
            self.description,
            self.key.vid(),
            self.key.pid(),
            self.error
        )
    }
}

fn describe_failures(failures: &[DeviceFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("  - {}", failure))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DeviceKey {
        DeviceKey::new("1234", "5678").unwrap()
    }

    #[test]
    fn test_control_failure_display() {
        let err = Error::DeviceControl {
            key: key(),
            failure: ControlFailure::NonZeroExit {
                code: Some(2),
                stdout: "No matching devices found.".to_string(),
                stderr: String::new(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("1234:5678"));
        assert!(msg.contains("exit code 2"));
        assert!(msg.contains("No matching devices found."));
    }

    #[test]
    fn test_signal_exit_display() {
        let failure = ControlFailure::NonZeroExit {
            code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(failure.to_string().contains("terminated by signal"));
    }

    #[test]
    fn test_aggregate_lists_each_device() {
        let err = Error::Aggregate {
            operation: BulkOperation::BlockAll,
            failures: vec![
                DeviceFailure {
                    instance_id: "a".to_string(),
                    key: key(),
                    description: "Flash Drive".to_string(),
                    error: Error::DeviceControl {
                        key: key(),
                        failure: ControlFailure::TimedOut(Duration::from_secs(30)),
                    },
                },
                DeviceFailure {
                    instance_id: "b".to_string(),
                    key: DeviceKey::new("AAAA", "BBBB").unwrap(),
                    description: "Webcam".to_string(),
                    error: Error::Config("boom".to_string()),
                },
            ],
        };

        let msg = err.to_string();
        assert!(msg.starts_with("Failed to block 2 device(s)"));
        assert!(msg.contains("Flash Drive (VID:1234 PID:5678): Device control failed"));
        assert!(msg.contains("timed out after 30s"));
        assert!(msg.contains("Webcam (VID:AAAA PID:BBBB)"));
    }

    #[test]
    fn test_storage_helper() {
        let err = Error::storage("/tmp/whitelist.json", "permission denied");
        assert!(matches!(err, Error::Storage { .. }));
        assert!(err.to_string().contains("/tmp/whitelist.json"));
    }
}
