//! Device enumeration
//!
//! Turns raw host inventory entries into [`DeviceRecord`]s: duplicates and
//! devices without a USB identity are dropped, the blocked flag comes from
//! the host status and whitelist membership from the policy store.

use chrono::{DateTime, Utc};
use common::{HostInventory, Result};
use protocol::{DeviceKey, DeviceRecord, InventoryEntry};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Produces per-scan device snapshots from a [`HostInventory`]
#[derive(Clone)]
pub struct Enumerator {
    inventory: Arc<dyn HostInventory>,
}

impl Enumerator {
    pub fn new(inventory: Arc<dyn HostInventory>) -> Self {
        Self { inventory }
    }

    /// Query the host inventory
    ///
    /// A failure of the query itself is an `Error::Enumeration`.
    pub async fn query(&self) -> Result<Vec<InventoryEntry>> {
        let entries = self.inventory.query().await?;
        debug!(
            "{} inventory returned {} entries",
            self.inventory.name(),
            entries.len()
        );
        Ok(entries)
    }

    /// Query the host and build records, using `is_whitelisted` for membership
    pub async fn scan<F>(&self, is_whitelisted: F) -> Result<Vec<DeviceRecord>>
    where
        F: Fn(&DeviceKey) -> bool,
    {
        let entries = self.query().await?;
        Ok(reconcile(entries, is_whitelisted, Utc::now()))
    }
}

/// Build records from raw inventory entries, preserving host order
///
/// The first entry wins when the host reports an identifier twice. Entries
/// without an identifier or without a VID/PID are skipped.
pub fn reconcile<F>(
    entries: Vec<InventoryEntry>,
    is_whitelisted: F,
    observed_at: DateTime<Utc>,
) -> Vec<DeviceRecord>
where
    F: Fn(&DeviceKey) -> bool,
{
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(entries.len());

    for entry in entries {
        let Some(instance_id) = entry.device_id.as_deref().filter(|id| !id.trim().is_empty())
        else {
            warn!("Skipping inventory entry without a device identifier");
            continue;
        };

        let Some(key) = DeviceKey::from_instance_id(instance_id) else {
            debug!("Skipping {}: no VID/PID", instance_id);
            continue;
        };

        if !seen.insert(instance_id.to_string()) {
            debug!("Skipping duplicate entry for {}", instance_id);
            continue;
        }

        let whitelisted = is_whitelisted(&key);
        records.push(
            DeviceRecord::new(
                instance_id,
                key,
                entry.display_description(),
                entry.display_manufacturer(),
            )
            .with_whitelisted(whitelisted)
            .with_blocked(entry.is_disabled())
            .with_last_seen(observed_at),
        );
    }

    records
}
