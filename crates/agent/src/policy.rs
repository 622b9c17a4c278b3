//! Device admission policy engine
//!
//! Classifies scanned devices and drives block/unblock and whitelist
//! commands. The core invariant is that a whitelisted device is never
//! blocked: block requests for whitelisted keys are refused before any
//! device control call is made.
//!
//! Bulk operations are best-effort. Every eligible device is attempted, with
//! up to `max_concurrent` control calls in flight, and per-device outcomes
//! are collected into a [`BulkOutcome`] in input order.

use crate::audit::{AuditResult, SharedAuditLogger};
use crate::store::PolicyStore;
use crate::usb::Enumerator;
use common::{BulkOperation, DeviceControl, DeviceFailure, Error, HostInventory, Result};
use protocol::{
    Classification, ControlAction, DeviceKey, DeviceRecord, PolicyState, ToggleOutcome,
    WhitelistEntry,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Default number of concurrent control calls during bulk operations
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

const WHITELISTED_REASON: &str = "cannot block a whitelisted device";
const WHITELISTED_SINCE_SCAN_REASON: &str = "device was whitelisted after the scan";

/// Partition records into available, whitelisted and blocked
///
/// Every record lands in exactly one bucket; input order is kept within
/// each bucket.
pub fn classify(records: &[DeviceRecord]) -> Classification {
    let mut classification = Classification::default();
    for record in records {
        let bucket = match PolicyState::of(record) {
            PolicyState::Available => &mut classification.available,
            PolicyState::Whitelisted => &mut classification.whitelisted,
            PolicyState::Blocked => &mut classification.blocked,
        };
        bucket.push(record.clone());
    }
    classification
}

/// Overall result of a bulk operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkStatus {
    /// Every eligible device succeeded
    Complete,
    /// Some devices succeeded, some failed
    Partial,
    /// Every eligible device failed
    Failed,
    /// No device was eligible
    NothingToDo,
}

/// Per-device results of a bulk operation, in input order
#[derive(Debug)]
pub struct BulkOutcome {
    pub operation: BulkOperation,
    pub succeeded: Vec<ToggleOutcome>,
    pub failed: Vec<DeviceFailure>,
}

impl BulkOutcome {
    fn empty(operation: BulkOperation) -> Self {
        Self {
            operation,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn status(&self) -> BulkStatus {
        match (self.succeeded.is_empty(), self.failed.is_empty()) {
            (true, true) => BulkStatus::NothingToDo,
            (_, true) => BulkStatus::Complete,
            (true, false) => BulkStatus::Failed,
            (false, false) => BulkStatus::Partial,
        }
    }

    /// Number of devices attempted
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Fold failures into [`Error::Aggregate`]
    ///
    /// Devices that succeeded stay toggled either way.
    pub fn into_result(self) -> Result<Vec<ToggleOutcome>> {
        if self.failed.is_empty() {
            Ok(self.succeeded)
        } else {
            Err(Error::Aggregate {
                operation: self.operation,
                failures: self.failed,
            })
        }
    }
}

/// Result of adding a device to the whitelist
///
/// The whitelist entry stands even when the follow-up unblock fails; the
/// device then stays blocked until the next successful unblock.
#[derive(Debug)]
pub struct WhitelistOutcome {
    pub entry: WhitelistEntry,
    /// False when the key was already whitelisted
    pub added: bool,
    /// Unblock attempt, made only when the device was blocked
    pub unblock: Option<Result<ToggleOutcome>>,
}

impl WhitelistOutcome {
    /// Whether the device is known to remain blocked
    pub fn still_blocked(&self) -> bool {
        matches!(self.unblock, Some(Err(_)))
    }
}

/// Policy enforcement engine
///
/// Owns the whitelist store behind a mutex so persisted writes never
/// interleave. Records are snapshots: callers re-scan for authoritative
/// state after a command.
pub struct PolicyEngine {
    enumerator: Enumerator,
    control: Arc<dyn DeviceControl>,
    store: Mutex<PolicyStore>,
    max_concurrent: usize,
    audit: Option<SharedAuditLogger>,
}

impl PolicyEngine {
    pub fn new(
        inventory: Arc<dyn HostInventory>,
        control: Arc<dyn DeviceControl>,
        store: PolicyStore,
    ) -> Self {
        Self {
            enumerator: Enumerator::new(inventory),
            control,
            store: Mutex::new(store),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            audit: None,
        }
    }

    /// Bound concurrent control calls in bulk operations (minimum 1)
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_audit(mut self, audit: Option<SharedAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Enumerate attached devices with whitelist membership applied
    pub async fn scan(&self) -> Result<Vec<DeviceRecord>> {
        // Membership as of the start of the scan; later changes show up next scan
        let whitelisted: HashSet<DeviceKey> = {
            let store = self.store.lock().await;
            store
                .entries()
                .iter()
                .map(|entry| entry.device_key.clone())
                .collect()
        };

        let records = self
            .enumerator
            .scan(|key| whitelisted.contains(key))
            .await?;

        debug!("Scan found {} USB devices", records.len());
        Ok(records)
    }

    pub fn classify(&self, records: &[DeviceRecord]) -> Classification {
        classify(records)
    }

    /// Scan and classify in one step
    pub async fn scan_classified(&self) -> Result<Classification> {
        let classification = classify(&self.scan().await?);
        info!(
            "Scan: {} available, {} whitelisted, {} blocked",
            classification.available.len(),
            classification.whitelisted.len(),
            classification.blocked.len()
        );

        if let Some(audit) = &self.audit {
            audit.log_scan_completed(&classification);
        }
        Ok(classification)
    }

    /// Block every unit sharing the record's key
    ///
    /// Fails with [`Error::PolicyViolation`] without touching the device if
    /// the record is whitelisted or its key was whitelisted since the scan.
    pub async fn block(&self, record: &DeviceRecord) -> Result<ToggleOutcome> {
        self.check_blockable(record).await?;
        self.toggle(record, ControlAction::Disable).await
    }

    /// Unblock every unit sharing the record's key
    pub async fn unblock(&self, record: &DeviceRecord) -> Result<ToggleOutcome> {
        self.toggle(record, ControlAction::Enable).await
    }

    /// Scan, then block the first attached device with `key`
    pub async fn block_key(&self, key: &DeviceKey) -> Result<ToggleOutcome> {
        let record = self.find_attached(key).await?;
        self.block(&record).await
    }

    /// Scan, then unblock the first attached device with `key`
    pub async fn unblock_key(&self, key: &DeviceKey) -> Result<ToggleOutcome> {
        let record = self.find_attached(key).await?;
        self.unblock(&record).await
    }

    /// Block every record that is neither whitelisted nor already blocked
    pub async fn block_all(&self, records: &[DeviceRecord]) -> BulkOutcome {
        let targets: Vec<DeviceRecord> = records
            .iter()
            .filter(|r| !r.is_whitelisted() && !r.is_blocked())
            .cloned()
            .collect();
        self.run_bulk(BulkOperation::BlockAll, targets).await
    }

    /// Unblock every blocked record
    pub async fn unblock_all(&self, records: &[DeviceRecord]) -> BulkOutcome {
        let targets: Vec<DeviceRecord> =
            records.iter().filter(|r| r.is_blocked()).cloned().collect();
        self.run_bulk(BulkOperation::UnblockAll, targets).await
    }

    /// Scan, then [`block_all`](Self::block_all)
    pub async fn block_all_attached(&self) -> Result<BulkOutcome> {
        let records = self.scan().await?;
        Ok(self.block_all(&records).await)
    }

    /// Scan, then [`unblock_all`](Self::unblock_all)
    pub async fn unblock_all_attached(&self) -> Result<BulkOutcome> {
        let records = self.scan().await?;
        Ok(self.unblock_all(&records).await)
    }

    /// Whitelist a scanned device, unblocking it if it is blocked
    pub async fn add_to_whitelist(&self, record: &DeviceRecord) -> Result<WhitelistOutcome> {
        self.whitelist_entry(WhitelistEntry::from_record(record), Some(record))
            .await
    }

    /// Whitelist a key, whether or not a device with it is attached
    ///
    /// Missing metadata is taken from the attached device when there is one.
    /// If the scan fails the key is still whitelisted, without an unblock
    /// since the device state is unknown.
    pub async fn whitelist_key(
        &self,
        key: &DeviceKey,
        description: Option<String>,
        manufacturer: Option<String>,
    ) -> Result<WhitelistOutcome> {
        let attached = match self.scan().await {
            Ok(records) => records.into_iter().find(|record| record.key() == key),
            Err(e) => {
                warn!("Whitelisting {} without a device scan: {}", key, e);
                None
            }
        };

        let entry = WhitelistEntry::new(
            key.clone(),
            description
                .or_else(|| attached.as_ref().map(|r| r.description().to_string()))
                .unwrap_or_else(|| "Unknown Device".to_string()),
            manufacturer
                .or_else(|| attached.as_ref().map(|r| r.manufacturer().to_string()))
                .unwrap_or_else(|| "Unknown Manufacturer".to_string()),
        );

        self.whitelist_entry(entry, attached.as_ref()).await
    }

    /// Remove `key` from the whitelist
    ///
    /// The device is not blocked; it becomes available again.
    pub async fn remove_from_whitelist(&self, key: &DeviceKey) -> Result<usize> {
        let removed = self.store.lock().await.remove(key)?;

        if removed > 0 {
            info!("Removed {} from whitelist", key);
            if let Some(audit) = &self.audit {
                audit.log_whitelist_removed(key, removed);
            }
        } else {
            debug!("{} was not whitelisted", key);
        }

        Ok(removed)
    }

    /// Current whitelist entries
    pub async fn whitelist(&self) -> Vec<WhitelistEntry> {
        self.store.lock().await.entries().to_vec()
    }

    /// Empty the whitelist, returning how many entries were removed
    pub async fn clear_whitelist(&self) -> Result<usize> {
        let removed = self.store.lock().await.clear()?;
        info!("Cleared whitelist ({} entries)", removed);
        if let Some(audit) = &self.audit {
            audit.log_whitelist_cleared(removed);
        }
        Ok(removed)
    }

    /// Copy the whitelist file to `destination`
    pub async fn backup_whitelist(&self, destination: &Path) -> Result<()> {
        let result = self.store.lock().await.backup(destination);
        if let Some(audit) = &self.audit {
            audit.log_whitelist_backed_up(destination, audit_result(&result));
        }
        result
    }

    /// Replace the whitelist with the file at `source`
    ///
    /// Returns the number of entries now whitelisted. On failure the current
    /// whitelist is unchanged.
    pub async fn restore_whitelist(&self, source: &Path) -> Result<usize> {
        let result = self.store.lock().await.restore(source);
        if let Some(audit) = &self.audit {
            audit.log_whitelist_restored(
                source,
                result.as_ref().ok().copied(),
                audit_result(&result),
            );
        }
        result
    }

    async fn find_attached(&self, key: &DeviceKey) -> Result<DeviceRecord> {
        self.scan()
            .await?
            .into_iter()
            .find(|record| record.key() == key)
            .ok_or_else(|| Error::DeviceNotFound(key.clone()))
    }

    async fn whitelist_entry(
        &self,
        entry: WhitelistEntry,
        record: Option<&DeviceRecord>,
    ) -> Result<WhitelistOutcome> {
        let added = self.store.lock().await.add(entry.clone())?;

        if added {
            info!("Whitelisted {} ({})", entry.device_key, entry.description);
            if let Some(audit) = &self.audit {
                audit.log_whitelist_added(&entry);
            }
        } else {
            debug!("{} already whitelisted", entry.device_key);
        }

        let unblock = match record {
            Some(record) if record.is_blocked() => {
                let result = self.unblock(record).await;
                if let Err(e) = &result {
                    warn!(
                        "{} is whitelisted but remains blocked: {}",
                        record.display_name(),
                        e
                    );
                }
                Some(result)
            }
            _ => None,
        };

        Ok(WhitelistOutcome {
            entry,
            added,
            unblock,
        })
    }

    async fn check_blockable(&self, record: &DeviceRecord) -> Result<()> {
        let reason = if record.is_whitelisted() {
            WHITELISTED_REASON
        } else if self.store.lock().await.contains(record.key()) {
            WHITELISTED_SINCE_SCAN_REASON
        } else {
            return Ok(());
        };

        Err(self.violation(record, reason))
    }

    fn violation(&self, record: &DeviceRecord, reason: &str) -> Error {
        warn!("Refusing to block {}: {}", record.display_name(), reason);
        if let Some(audit) = &self.audit {
            audit.log_policy_violation(record, reason);
        }
        Error::PolicyViolation {
            key: record.key().clone(),
            reason: reason.to_string(),
        }
    }

    async fn toggle(&self, record: &DeviceRecord, action: ControlAction) -> Result<ToggleOutcome> {
        let result = self.control.apply(action, record.key()).await;
        self.finish_toggle(record, action, result)
    }

    fn finish_toggle(
        &self,
        record: &DeviceRecord,
        action: ControlAction,
        result: std::result::Result<(), common::ControlFailure>,
    ) -> Result<ToggleOutcome> {
        match result {
            Ok(()) => {
                info!("Device {}ed: {}", action.verb(), record.display_name());
                if let Some(audit) = &self.audit {
                    audit.log_device_toggled(record, action, None);
                }
                Ok(ToggleOutcome::new(record, action))
            }
            Err(failure) => {
                error!(
                    "Failed to {} {}: {}",
                    action.verb(),
                    record.display_name(),
                    failure
                );
                if let Some(audit) = &self.audit {
                    audit.log_device_toggled(record, action, Some(failure.to_string()));
                }
                Err(Error::DeviceControl {
                    key: record.key().clone(),
                    failure,
                })
            }
        }
    }

    async fn run_bulk(&self, operation: BulkOperation, targets: Vec<DeviceRecord>) -> BulkOutcome {
        if targets.is_empty() {
            debug!("Nothing to {}", operation);
            return BulkOutcome::empty(operation);
        }

        let action = match operation {
            BulkOperation::BlockAll => ControlAction::Disable,
            BulkOperation::UnblockAll => ControlAction::Enable,
        };

        // Keys whitelisted since the scan are refused like a single block
        let refused: HashSet<DeviceKey> = if action == ControlAction::Disable {
            let store = self.store.lock().await;
            targets
                .iter()
                .filter(|record| store.contains(record.key()))
                .map(|record| record.key().clone())
                .collect()
        } else {
            HashSet::new()
        };

        let mut results: Vec<Option<Result<ToggleOutcome>>> =
            targets.iter().map(|_| None).collect();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for (index, record) in targets.iter().enumerate() {
            if refused.contains(record.key()) {
                results[index] = Some(Err(self.violation(record, WHITELISTED_SINCE_SCAN_REASON)));
                continue;
            }

            let control = Arc::clone(&self.control);
            let semaphore = Arc::clone(&semaphore);
            let key = record.key().clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (index, control.apply(action, &key).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    results[index] = Some(self.finish_toggle(&targets[index], action, result));
                }
                Err(e) => error!("{} task did not complete: {}", operation, e),
            }
        }

        let mut outcome = BulkOutcome::empty(operation);
        for (record, result) in targets.iter().zip(results) {
            let result = result.unwrap_or_else(|| {
                Err(Error::DeviceControl {
                    key: record.key().clone(),
                    failure: common::ControlFailure::Launch {
                        program: "control task".to_string(),
                        reason: "task aborted before completion".to_string(),
                    },
                })
            });

            match result {
                Ok(toggled) => outcome.succeeded.push(toggled),
                Err(error) => outcome.failed.push(DeviceFailure {
                    instance_id: record.instance_id().to_string(),
                    key: record.key().clone(),
                    description: record.description().to_string(),
                    error,
                }),
            }
        }

        info!(
            "{} finished: {} succeeded, {} failed",
            operation,
            outcome.succeeded.len(),
            outcome.failed.len()
        );
        outcome
    }
}

fn audit_result<T>(result: &Result<T>) -> AuditResult {
    if result.is_ok() {
        AuditResult::Success
    } else {
        AuditResult::Failure
    }
}
