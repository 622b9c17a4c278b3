//! Audit logging
//!
//! Provides structured JSON-lines audit logging of policy decisions: device
//! blocks and unblocks, whitelist mutations, refused actions and scans. Entries
//! are written by a background task to a size-rotated log file.

use crate::config::AuditConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use protocol::{Classification, ControlAction, DeviceKey, DeviceRecord, WhitelistEntry};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Minimum log level for audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    /// Log everything including scans
    All,
    /// Log every action and whitelist change (default)
    #[default]
    Standard,
    /// Log only refused actions and whitelist changes
    Security,
    /// Disable audit logging
    Off,
}

impl AuditLevel {
    /// Check if an event type should be logged at this level
    pub fn should_log(&self, event_type: &AuditEventType) -> bool {
        match self {
            AuditLevel::Off => false,
            AuditLevel::Security => matches!(
                event_type,
                AuditEventType::PolicyViolation
                    | AuditEventType::WhitelistAdded
                    | AuditEventType::WhitelistRemoved
                    | AuditEventType::WhitelistCleared
                    | AuditEventType::WhitelistRestored
            ),
            AuditLevel::Standard => !matches!(event_type, AuditEventType::ScanCompleted),
            AuditLevel::All => true,
        }
    }
}

/// Types of audit events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AgentStarted,
    ScanCompleted,
    DeviceBlocked,
    DeviceUnblocked,
    WhitelistAdded,
    WhitelistRemoved,
    WhitelistCleared,
    WhitelistBackedUp,
    WhitelistRestored,
    /// An action was refused because it conflicts with the whitelist
    PolicyViolation,
}

/// Result of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
}

/// Details for different audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuditDetails {
    /// Device action details
    Device {
        description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Scan summary
    Scan {
        available: usize,
        whitelisted: usize,
        blocked: usize,
    },
    /// Agent lifecycle
    Agent { version: String, backend: String },
    /// Whitelist file or bulk change details
    Whitelist {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        entries: Option<usize>,
    },
    /// Simple message
    Message { message: String },
}

/// A structured audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// RFC 3339 timestamp
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Device key as VID:PID (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_key: Option<String>,
    /// Host device identifier (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<AuditDetails>,
}

impl AuditEntry {
    /// Create a new audit entry with the current timestamp
    pub fn new(event_type: AuditEventType, result: AuditResult) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            device_key: None,
            instance_id: None,
            result,
            details: None,
        }
    }

    pub fn with_device_key(mut self, key: &DeviceKey) -> Self {
        self.device_key = Some(key.to_string());
        self
    }

    /// Set key and instance ID from a record
    pub fn with_record(mut self, record: &DeviceRecord) -> Self {
        self.device_key = Some(record.key().to_string());
        self.instance_id = Some(record.instance_id().to_string());
        self
    }

    pub fn with_details(mut self, details: AuditDetails) -> Self {
        self.details = Some(details);
        self
    }
}

/// Message sent to the audit writer
enum AuditMessage {
    Log(AuditEntry),
    Shutdown,
}

/// Async audit logger that writes to a file in the background
pub struct AuditLogger {
    sender: mpsc::UnboundedSender<AuditMessage>,
    level: AuditLevel,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Create a new audit logger
    ///
    /// Returns None if audit logging is disabled. Must be called inside a
    /// tokio runtime.
    pub fn new(config: AuditConfig) -> Option<Self> {
        if !config.enabled || config.level == AuditLevel::Off {
            return None;
        }

        let level = config.level;
        let (sender, receiver) = mpsc::unbounded_channel();
        let writer = AuditWriter::new(config);
        let handle = tokio::spawn(writer.run(receiver));

        Some(Self {
            sender,
            level,
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Log an audit entry
    pub fn log(&self, entry: AuditEntry) {
        if !self.level.should_log(&entry.event_type) {
            return;
        }

        if let Err(e) = self.sender.send(AuditMessage::Log(entry)) {
            warn!("Failed to send audit log entry: {}", e);
        }
    }

    /// Flush pending entries and stop the writer
    pub async fn shutdown(&self) {
        let _ = self.sender.send(AuditMessage::Shutdown);
        if let Some(handle) = self.writer.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Audit writer task failed: {}", e);
            }
        }
    }

    pub fn log_agent_started(&self, version: &str, backend: &str) {
        let entry = AuditEntry::new(AuditEventType::AgentStarted, AuditResult::Success)
            .with_details(AuditDetails::Agent {
                version: version.to_string(),
                backend: backend.to_string(),
            });
        self.log(entry);
    }

    pub fn log_scan_completed(&self, classification: &Classification) {
        let entry = AuditEntry::new(AuditEventType::ScanCompleted, AuditResult::Success)
            .with_details(AuditDetails::Scan {
                available: classification.available.len(),
                whitelisted: classification.whitelisted.len(),
                blocked: classification.blocked.len(),
            });
        self.log(entry);
    }

    /// Log a block or unblock attempt
    pub fn log_device_toggled(
        &self,
        record: &DeviceRecord,
        action: ControlAction,
        error: Option<String>,
    ) {
        let event_type = match action {
            ControlAction::Disable => AuditEventType::DeviceBlocked,
            ControlAction::Enable => AuditEventType::DeviceUnblocked,
        };
        let result = if error.is_some() {
            AuditResult::Failure
        } else {
            AuditResult::Success
        };

        let entry = AuditEntry::new(event_type, result)
            .with_record(record)
            .with_details(AuditDetails::Device {
                description: record.description().to_string(),
                error,
            });
        self.log(entry);
    }

    pub fn log_policy_violation(&self, record: &DeviceRecord, reason: &str) {
        let entry = AuditEntry::new(AuditEventType::PolicyViolation, AuditResult::Denied)
            .with_record(record)
            .with_details(AuditDetails::Message {
                message: reason.to_string(),
            });
        self.log(entry);
    }

    pub fn log_whitelist_added(&self, entry: &WhitelistEntry) {
        let audit = AuditEntry::new(AuditEventType::WhitelistAdded, AuditResult::Success)
            .with_device_key(&entry.device_key)
            .with_details(AuditDetails::Device {
                description: entry.description.clone(),
                error: None,
            });
        self.log(audit);
    }

    pub fn log_whitelist_removed(&self, key: &DeviceKey, removed: usize) {
        let entry = AuditEntry::new(AuditEventType::WhitelistRemoved, AuditResult::Success)
            .with_device_key(key)
            .with_details(AuditDetails::Whitelist {
                path: None,
                entries: Some(removed),
            });
        self.log(entry);
    }

    pub fn log_whitelist_cleared(&self, removed: usize) {
        let entry = AuditEntry::new(AuditEventType::WhitelistCleared, AuditResult::Success)
            .with_details(AuditDetails::Whitelist {
                path: None,
                entries: Some(removed),
            });
        self.log(entry);
    }

    pub fn log_whitelist_backed_up(&self, path: &Path, result: AuditResult) {
        let entry = AuditEntry::new(AuditEventType::WhitelistBackedUp, result).with_details(
            AuditDetails::Whitelist {
                path: Some(path.display().to_string()),
                entries: None,
            },
        );
        self.log(entry);
    }

    pub fn log_whitelist_restored(&self, path: &Path, entries: Option<usize>, result: AuditResult) {
        let entry = AuditEntry::new(AuditEventType::WhitelistRestored, result).with_details(
            AuditDetails::Whitelist {
                path: Some(path.display().to_string()),
                entries,
            },
        );
        self.log(entry);
    }
}

/// Background writer for audit log entries
struct AuditWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: u32,
    file: Option<BufWriter<File>>,
    current_file_size: u64,
}

impl AuditWriter {
    fn new(config: AuditConfig) -> Self {
        Self {
            path: config.path,
            max_bytes: u64::from(config.max_size_mb) * 1024 * 1024,
            max_files: config.max_files,
            file: None,
            current_file_size: 0,
        }
    }

    /// Open or reopen the audit log file
    fn open_file(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit log directory: {:?}", parent))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open audit log: {:?}", self.path))?;

        self.current_file_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(BufWriter::new(file));

        debug!("Opened audit log: {:?}", self.path);
        Ok(())
    }

    /// Write an entry to the log file
    fn write_entry(&mut self, entry: &AuditEntry) -> Result<()> {
        if self.file.is_none() {
            self.open_file()?;
        }

        let mut line = serde_json::to_string(entry).context("Failed to serialize audit entry")?;
        line.push('\n');

        if let Some(ref mut writer) = self.file {
            writer
                .write_all(line.as_bytes())
                .context("Failed to write audit entry")?;
            writer.flush().context("Failed to flush audit log")?;
            self.current_file_size += line.len() as u64;
        }

        if self.should_rotate() {
            self.rotate()?;
        }

        Ok(())
    }

    fn should_rotate(&self) -> bool {
        self.max_bytes > 0 && self.current_file_size >= self.max_bytes
    }

    /// Shift `audit.log.N` files up by one and start a fresh log
    fn rotate(&mut self) -> Result<()> {
        self.file = None;

        if self.max_files == 0 {
            std::fs::remove_file(&self.path).ok();
        } else {
            std::fs::remove_file(Self::rotated_path(&self.path, self.max_files)).ok();
            for i in (1..self.max_files).rev() {
                let old_path = Self::rotated_path(&self.path, i);
                if old_path.exists() {
                    std::fs::rename(&old_path, Self::rotated_path(&self.path, i + 1)).ok();
                }
            }
            if self.path.exists() {
                std::fs::rename(&self.path, Self::rotated_path(&self.path, 1)).ok();
            }
        }

        debug!("Rotated audit log: {:?}", self.path);
        self.open_file()
    }

    /// Get the path for a rotated log file
    fn rotated_path(base: &Path, index: u32) -> PathBuf {
        let file_name = base
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("audit.log");

        base.with_file_name(format!("{}.{}", file_name, index))
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<AuditMessage>) {
        while let Some(message) = receiver.recv().await {
            match message {
                AuditMessage::Log(entry) => {
                    if let Err(e) = self.write_entry(&entry) {
                        error!("Failed to write audit log entry: {:#}", e);
                    }
                }
                AuditMessage::Shutdown => {
                    debug!("Audit logger shutting down");
                    break;
                }
            }
        }

        if let Some(ref mut writer) = self.file {
            let _ = writer.flush();
        }
    }
}

/// Shared audit logger handle
pub type SharedAuditLogger = Arc<AuditLogger>;

/// Create a shared audit logger from configuration
pub fn create_audit_logger(config: AuditConfig) -> Option<SharedAuditLogger> {
    AuditLogger::new(config).map(Arc::new)
}
