//! Data model for usb-gatekeeper
//!
//! This crate defines the types shared by the policy engine and its
//! front-ends: the canonical device identity key, per-scan device records,
//! persisted whitelist entries and raw host inventory entries, plus the codecs
//! for the whitelist file and the host inventory output.
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceKey, PolicyState, DeviceRecord};
//!
//! let key = DeviceKey::from_instance_id(r"USB\VID_046d&PID_c52b\5&2F3A1B&0&2").unwrap();
//! assert_eq!(key.to_string(), "046D:C52B");
//! assert_eq!(key.match_pattern(), "*VID_046D&PID_C52B*");
//!
//! let record = DeviceRecord::new("USB\\VID_046D&PID_C52B\\1", key, "USB Receiver", "Logitech")
//!     .with_whitelisted(true);
//! assert_eq!(record.policy_state(), PolicyState::Whitelisted);
//! ```
//!
//! # Whitelist Documents
//!
//! ```
//! use protocol::{DeviceKey, WhitelistEntry, decode_whitelist, encode_whitelist};
//!
//! let entries = vec![WhitelistEntry::new(
//!     DeviceKey::new("046D", "C52B").unwrap(),
//!     "USB Receiver",
//!     "Logitech",
//! )];
//!
//! let json = encode_whitelist(&entries).unwrap();
//! assert_eq!(decode_whitelist(&json).unwrap(), entries);
//! ```

pub mod document;
pub mod error;
pub mod types;

pub use document::{decode_inventory, decode_whitelist, encode_whitelist};
pub use error::{ProtocolError, Result};
pub use types::{
    Classification, ControlAction, DeviceKey, DeviceRecord, InventoryEntry, PolicyState,
    SENTINEL_ID, ToggleOutcome, WhitelistEntry,
};
