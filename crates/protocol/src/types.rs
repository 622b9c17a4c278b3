//! USB policy type definitions
//!
//! This module defines the device identity key, the per-scan device record,
//! the persisted whitelist entry and the raw host inventory entry shared by the
//! enumerator, the policy engine and front-ends.

use crate::error::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value substituted for a VID or PID that is absent from a raw identifier
pub const SENTINEL_ID: &str = "0000";

/// Canonical (VID, PID) identity of a USB device model
///
/// Both fields are exactly four hex digits, normalized to uppercase at
/// construction, so derived equality and hashing are case-insensitive.
/// All physical units of the same model share one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "KeyParts", into = "KeyParts")]
pub struct DeviceKey {
    vid: String,
    pid: String,
}

/// Serialized shape of a [`DeviceKey`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyParts {
    vid: String,
    pid: String,
}

impl TryFrom<KeyParts> for DeviceKey {
    type Error = ProtocolError;

    fn try_from(parts: KeyParts) -> Result<Self> {
        DeviceKey::new(&parts.vid, &parts.pid)
    }
}

impl From<DeviceKey> for KeyParts {
    fn from(key: DeviceKey) -> Self {
        KeyParts {
            vid: key.vid,
            pid: key.pid,
        }
    }
}

impl DeviceKey {
    /// Create a key from VID and PID strings
    ///
    /// Each field must be exactly four hex digits (any case).
    pub fn new(vid: &str, pid: &str) -> Result<Self> {
        Ok(Self {
            vid: normalize_field("VID", vid)?,
            pid: normalize_field("PID", pid)?,
        })
    }

    /// Extract a key from a raw host device identifier
    ///
    /// Searches for `VID_XXXX` and `PID_XXXX` anywhere in the identifier,
    /// case-insensitively. A missing field becomes `"0000"`. Returns `None`
    /// when both fields are missing, since such a device cannot be identified
    /// as a USB device.
    pub fn from_instance_id(raw: &str) -> Option<Self> {
        let upper = raw.to_ascii_uppercase();
        let vid = find_tagged_hex(&upper, "VID_").unwrap_or_else(|| SENTINEL_ID.to_string());
        let pid = find_tagged_hex(&upper, "PID_").unwrap_or_else(|| SENTINEL_ID.to_string());

        if vid == SENTINEL_ID && pid == SENTINEL_ID {
            return None;
        }

        Some(Self { vid, pid })
    }

    /// Parse user input such as `046D:C52B`, `0x046d:0xc52b` or a raw
    /// `VID_046D&PID_C52B` identifier
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();

        if let Some((vid, pid)) = trimmed.split_once(':') {
            return Self::new(strip_hex_prefix(vid.trim()), strip_hex_prefix(pid.trim()));
        }

        Self::from_instance_id(trimmed).ok_or_else(|| ProtocolError::InvalidKey(input.to_string()))
    }

    /// Vendor ID as four uppercase hex digits
    pub fn vid(&self) -> &str {
        &self.vid
    }

    /// Product ID as four uppercase hex digits
    pub fn pid(&self) -> &str {
        &self.pid
    }

    /// Device-tree match expression covering every unit with this key
    pub fn match_pattern(&self) -> String {
        format!("*VID_{}&PID_{}*", self.vid, self.pid)
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vid, self.pid)
    }
}

impl std::str::FromStr for DeviceKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn normalize_field(field: &'static str, value: &str) -> Result<String> {
    if value.len() == 4 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(value.to_ascii_uppercase())
    } else {
        Err(ProtocolError::InvalidKeyField {
            field,
            value: value.to_string(),
        })
    }
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

/// First occurrence of `tag` followed by four hex digits in an
/// already-uppercased identifier
fn find_tagged_hex(upper: &str, tag: &str) -> Option<String> {
    upper.match_indices(tag).find_map(|(idx, _)| {
        let start = idx + tag.len();
        let digits = upper.get(start..start + 4)?;
        digits
            .chars()
            .all(|c| c.is_ascii_hexdigit())
            .then(|| digits.to_string())
    })
}

/// One physical device instance observed by a single scan
///
/// Records are immutable snapshots. Actions on a device are reported through
/// [`ToggleOutcome`]; authoritative state comes from the next scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    instance_id: String,
    key: DeviceKey,
    description: String,
    manufacturer: String,
    is_whitelisted: bool,
    is_blocked: bool,
    last_seen: DateTime<Utc>,
}

impl DeviceRecord {
    /// Create a record observed now, neither whitelisted nor blocked
    pub fn new(
        instance_id: impl Into<String>,
        key: DeviceKey,
        description: impl Into<String>,
        manufacturer: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            key,
            description: description.into(),
            manufacturer: manufacturer.into(),
            is_whitelisted: false,
            is_blocked: false,
            last_seen: Utc::now(),
        }
    }

    /// Set whitelist membership
    pub fn with_whitelisted(mut self, whitelisted: bool) -> Self {
        self.is_whitelisted = whitelisted;
        self
    }

    /// Set the host-reported blocked flag
    pub fn with_blocked(mut self, blocked: bool) -> Self {
        self.is_blocked = blocked;
        self
    }

    /// Set the observation timestamp
    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn is_whitelisted(&self) -> bool {
        self.is_whitelisted
    }

    pub fn is_blocked(&self) -> bool {
        self.is_blocked
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Human-readable name, e.g. `USB Receiver (VID:046D PID:C52B)`
    pub fn display_name(&self) -> String {
        format!(
            "{} (VID:{} PID:{})",
            self.description, self.key.vid, self.key.pid
        )
    }

    /// Classification of this record
    pub fn policy_state(&self) -> PolicyState {
        PolicyState::of(self)
    }
}

/// Persisted whitelist record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhitelistEntry {
    pub device_key: DeviceKey,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub manufacturer: String,
}

impl WhitelistEntry {
    pub fn new(
        device_key: DeviceKey,
        description: impl Into<String>,
        manufacturer: impl Into<String>,
    ) -> Self {
        Self {
            device_key,
            description: description.into(),
            manufacturer: manufacturer.into(),
        }
    }

    /// Capture a record's key and metadata at the time of whitelisting
    pub fn from_record(record: &DeviceRecord) -> Self {
        Self::new(
            record.key().clone(),
            record.description(),
            record.manufacturer(),
        )
    }
}

/// Classification of a device within one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyState {
    /// Not whitelisted and not blocked
    Available,
    /// Whitelisted, regardless of the host-reported blocked flag
    Whitelisted,
    /// Not whitelisted and blocked
    Blocked,
}

impl PolicyState {
    pub fn of(record: &DeviceRecord) -> Self {
        if record.is_whitelisted() {
            Self::Whitelisted
        } else if record.is_blocked() {
            Self::Blocked
        } else {
            Self::Available
        }
    }
}

impl fmt::Display for PolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Whitelisted => write!(f, "whitelisted"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// A scan partitioned into disjoint buckets, input order preserved
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub available: Vec<DeviceRecord>,
    pub whitelisted: Vec<DeviceRecord>,
    pub blocked: Vec<DeviceRecord>,
}

impl Classification {
    /// Total number of classified records
    pub fn len(&self) -> usize {
        self.available.len() + self.whitelisted.len() + self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bucket for a given state
    pub fn bucket(&self, state: PolicyState) -> &[DeviceRecord] {
        match state {
            PolicyState::Available => &self.available,
            PolicyState::Whitelisted => &self.whitelisted,
            PolicyState::Blocked => &self.blocked,
        }
    }
}

/// Enable/disable action sent to the device control collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Enable,
    Disable,
}

impl ControlAction {
    /// Verb used in logs and messages ("block" / "unblock")
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Enable => "unblock",
            Self::Disable => "block",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enable => write!(f, "enable"),
            Self::Disable => write!(f, "disable"),
        }
    }
}

/// Report of a successful block or unblock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleOutcome {
    pub instance_id: String,
    pub key: DeviceKey,
    pub description: String,
    pub action: ControlAction,
}

impl ToggleOutcome {
    pub fn new(record: &DeviceRecord, action: ControlAction) -> Self {
        Self {
            instance_id: record.instance_id().to_string(),
            key: record.key().clone(),
            description: record.description().to_string(),
            action,
        }
    }

    /// Whether the device is expected to be blocked after this action
    pub fn is_blocked(&self) -> bool {
        self.action == ControlAction::Disable
    }
}

/// Raw entry from the host device inventory
///
/// Field names follow the Win32_PnPEntity properties so PowerShell JSON output
/// deserializes directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    #[serde(rename = "DeviceID", default)]
    pub device_id: Option<String>,
    #[serde(rename = "Description", default)]
    pub description: Option<String>,
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Manufacturer", default)]
    pub manufacturer: Option<String>,
    #[serde(rename = "Status", default)]
    pub status: Option<String>,
}

impl InventoryEntry {
    /// Whether the host reports this device as disabled ("Error" or "Disabled")
    pub fn is_disabled(&self) -> bool {
        self.status.as_deref().is_some_and(|status| {
            status.eq_ignore_ascii_case("error") || status.eq_ignore_ascii_case("disabled")
        })
    }

    /// Description, falling back to the name, then "Unknown Device"
    pub fn display_description(&self) -> &str {
        non_empty(&self.description)
            .or_else(|| non_empty(&self.name))
            .unwrap_or("Unknown Device")
    }

    /// Manufacturer, falling back to "Unknown Manufacturer"
    pub fn display_manufacturer(&self) -> &str {
        non_empty(&self.manufacturer).unwrap_or("Unknown Manufacturer")
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_new_normalizes_case() {
        let key = DeviceKey::new("046d", "c52b").unwrap();
        assert_eq!(key.vid(), "046D");
        assert_eq!(key.pid(), "C52B");
        assert_eq!(key, DeviceKey::new("046D", "C52B").unwrap());
    }

    #[test]
    fn test_key_new_rejects_bad_fields() {
        assert!(DeviceKey::new("46D", "C52B").is_err());
        assert!(DeviceKey::new("046D", "C52BX").is_err());
        assert!(DeviceKey::new("04GD", "C52B").is_err());
    }

    #[test]
    fn test_from_instance_id() {
        let key = DeviceKey::from_instance_id(r"USB\VID_046D&PID_C52B\5&2F3A1B&0&2").unwrap();
        assert_eq!(key.to_string(), "046D:C52B");

        let lower = DeviceKey::from_instance_id(r"usb\vid_046d&pid_c52b\abc").unwrap();
        assert_eq!(lower, key);
    }

    #[test]
    fn test_from_instance_id_partial() {
        let key = DeviceKey::from_instance_id(r"USB\VID_1234\XYZ").unwrap();
        assert_eq!(key.vid(), "1234");
        assert_eq!(key.pid(), SENTINEL_ID);

        let key = DeviceKey::from_instance_id(r"USB\PID_5678").unwrap();
        assert_eq!(key.vid(), SENTINEL_ID);
        assert_eq!(key.pid(), "5678");
    }

    #[test]
    fn test_from_instance_id_rejects_unidentifiable() {
        assert!(DeviceKey::from_instance_id(r"USB\ROOT_HUB30\4&1A2B").is_none());
        assert!(DeviceKey::from_instance_id("").is_none());
        assert!(DeviceKey::from_instance_id(r"USB\VID_0000&PID_0000\1").is_none());
    }

    #[test]
    fn test_from_instance_id_skips_non_hex_occurrence() {
        let key = DeviceKey::from_instance_id(r"VID_ZZZZ&VID_ABCD&PID_12").unwrap();
        assert_eq!(key.vid(), "ABCD");
        assert_eq!(key.pid(), SENTINEL_ID);
    }

    #[test]
    fn test_parse_user_input() {
        let expected = DeviceKey::new("046D", "C52B").unwrap();
        assert_eq!(DeviceKey::parse("046D:C52B").unwrap(), expected);
        assert_eq!(DeviceKey::parse(" 0x046d:0xc52b ").unwrap(), expected);
        assert_eq!(DeviceKey::parse("VID_046D&PID_C52B").unwrap(), expected);
        assert!(DeviceKey::parse("garbage").is_err());
        assert!(DeviceKey::parse("046D:").is_err());
    }

    #[test]
    fn test_match_pattern() {
        let key = DeviceKey::new("046d", "c52b").unwrap();
        assert_eq!(key.match_pattern(), "*VID_046D&PID_C52B*");
    }

    #[test]
    fn test_key_serde_validates() {
        let key: DeviceKey = serde_json::from_str(r#"{"vid":"046d","pid":"c52b"}"#).unwrap();
        assert_eq!(key.to_string(), "046D:C52B");
        assert!(serde_json::from_str::<DeviceKey>(r#"{"vid":"xyz","pid":"c52b"}"#).is_err());
    }

    #[test]
    fn test_policy_state() {
        let key = DeviceKey::new("1234", "5678").unwrap();
        let base = DeviceRecord::new("id", key, "Dev", "Acme");

        assert_eq!(base.policy_state(), PolicyState::Available);
        assert_eq!(
            base.clone().with_blocked(true).policy_state(),
            PolicyState::Blocked
        );
        assert_eq!(
            base.clone()
                .with_blocked(true)
                .with_whitelisted(true)
                .policy_state(),
            PolicyState::Whitelisted
        );
    }

    #[test]
    fn test_display_name() {
        let key = DeviceKey::new("046D", "C52B").unwrap();
        let record = DeviceRecord::new("id", key, "USB Receiver", "Logitech");
        assert_eq!(record.display_name(), "USB Receiver (VID:046D PID:C52B)");
    }

    #[test]
    fn test_inventory_entry_status() {
        let mut entry = InventoryEntry {
            status: Some("OK".to_string()),
            ..Default::default()
        };
        assert!(!entry.is_disabled());

        entry.status = Some("Error".to_string());
        assert!(entry.is_disabled());

        entry.status = Some("DISABLED".to_string());
        assert!(entry.is_disabled());

        entry.status = Some("Degraded".to_string());
        assert!(!entry.is_disabled());

        entry.status = None;
        assert!(!entry.is_disabled());
    }

    #[test]
    fn test_inventory_entry_fallbacks() {
        let entry = InventoryEntry {
            name: Some("Fallback Name".to_string()),
            ..Default::default()
        };
        assert_eq!(entry.display_description(), "Fallback Name");
        assert_eq!(entry.display_manufacturer(), "Unknown Manufacturer");

        let bare = InventoryEntry::default();
        assert_eq!(bare.display_description(), "Unknown Device");
    }
}
