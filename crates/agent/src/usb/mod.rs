//! USB subsystem
//!
//! Host-facing side of the agent:
//! - Device inventory backends (WMI, sysfs)
//! - Enumeration of inventory entries into device records
//! - Device enable/disable through an external utility

pub mod control;
pub mod enumerator;
pub mod inventory;
pub mod process;

pub use control::{CommandControl, locate_program};
pub use enumerator::{Enumerator, reconcile};
pub use inventory::{SysfsInventory, WmiInventory, inventory_from_settings};
