//! Host collaborator seams
//!
//! The policy engine never talks to the operating system directly. It reads
//! the device inventory through [`HostInventory`] and toggles devices through
//! [`DeviceControl`], so front-ends can plug in real backends and tests can
//! plug in [`crate::test_utils::SimulatedHost`].

use crate::error::{ControlFailure, Result};
use async_trait::async_trait;
use protocol::{ControlAction, DeviceKey, InventoryEntry};

/// Source of the host's USB device inventory
#[async_trait]
pub trait HostInventory: Send + Sync {
    /// Query every device of the USB class currently known to the host
    ///
    /// Fails with `Error::Enumeration` when the query itself fails. Entries
    /// that could not be read individually are omitted, not reported as
    /// errors.
    async fn query(&self) -> Result<Vec<InventoryEntry>>;

    /// Short backend name for logs
    fn name(&self) -> &str;
}

/// External mechanism that enables or disables devices
///
/// Both operations act on every attached unit matching the key.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn enable(&self, key: &DeviceKey) -> std::result::Result<(), ControlFailure>;

    async fn disable(&self, key: &DeviceKey) -> std::result::Result<(), ControlFailure>;

    /// Dispatch an action to [`enable`](Self::enable) or [`disable`](Self::disable)
    async fn apply(
        &self,
        action: ControlAction,
        key: &DeviceKey,
    ) -> std::result::Result<(), ControlFailure> {
        match action {
            ControlAction::Enable => self.enable(key).await,
            ControlAction::Disable => self.disable(key).await,
        }
    }
}
