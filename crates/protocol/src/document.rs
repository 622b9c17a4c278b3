//! Whitelist file and host inventory document codecs
//!
//! The whitelist is stored as a pretty-printed JSON array of
//! [`WhitelistEntry`] objects so it stays readable for audits:
//!
//! ```json
//! [
//!   {
//!     "deviceKey": { "vid": "046D", "pid": "C52B" },
//!     "description": "USB Receiver",
//!     "manufacturer": "Logitech"
//!   }
//! ]
//! ```
//!
//! Files written by the earlier desktop tool used a flat layout
//! (`{"VID": "046D", "PID": "C52B", "Description": ..}`); those decode too.

use crate::error::{ProtocolError, Result};
use crate::types::{DeviceKey, InventoryEntry, WhitelistEntry};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::warn;

/// Flat entry layout of the earlier desktop tool
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(rename = "VID")]
    vid: String,
    #[serde(rename = "PID")]
    pid: String,
    #[serde(rename = "Description", default)]
    description: Option<String>,
    #[serde(rename = "Manufacturer", default)]
    manufacturer: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Current(WhitelistEntry),
    Legacy(LegacyEntry),
}

impl StoredEntry {
    fn into_entry(self) -> Result<WhitelistEntry> {
        match self {
            StoredEntry::Current(entry) => Ok(entry),
            StoredEntry::Legacy(legacy) => Ok(WhitelistEntry::new(
                DeviceKey::new(&legacy.vid, &legacy.pid)?,
                legacy.description.unwrap_or_default(),
                legacy.manufacturer.unwrap_or_default(),
            )),
        }
    }
}

/// Encode whitelist entries as pretty-printed JSON
pub fn encode_whitelist(entries: &[WhitelistEntry]) -> Result<String> {
    let mut json = serde_json::to_string_pretty(entries)?;
    json.push('\n');
    Ok(json)
}

/// Decode a whitelist document
///
/// A literal `null` decodes as an empty whitelist. Entries that repeat an
/// earlier key are dropped so keys stay unique.
pub fn decode_whitelist(content: &str) -> Result<Vec<WhitelistEntry>> {
    let stored: Option<Vec<StoredEntry>> = serde_json::from_str(content)?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for item in stored.unwrap_or_default() {
        let entry = item.into_entry()?;
        if seen.insert(entry.device_key.clone()) {
            entries.push(entry);
        } else {
            warn!(
                "Dropping duplicate whitelist entry for {}",
                entry.device_key
            );
        }
    }

    Ok(entries)
}

/// Decode PowerShell `ConvertTo-Json` inventory output
///
/// Empty output means no devices and a single object means one device.
/// Array elements are decoded one by one; an element that does not fit
/// [`InventoryEntry`] is logged and skipped.
pub fn decode_inventory(output: &str) -> Result<Vec<InventoryEntry>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(_) => vec![value],
        serde_json::Value::Null => Vec::new(),
        other => {
            return Err(ProtocolError::UnexpectedInventory(
                kind_of(&other).to_string(),
            ));
        }
    };

    let mut entries = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<InventoryEntry>(item) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Skipping malformed inventory entry #{}: {}", index, e),
        }
    }

    Ok(entries)
}

fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
