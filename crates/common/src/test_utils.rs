//! Test utilities for usb-gatekeeper
//!
//! Provides mock records, inventory entries and an in-memory simulated host
//! for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_record, mock_instance_id};
//!
//! # fn main() {
//! let record = create_mock_record("046D", "C52B", "USB Receiver");
//! assert_eq!(record.key().to_string(), "046D:C52B");
//! assert_eq!(record.instance_id(), mock_instance_id("046D", "C52B", 1));
//! # }
//! ```

use crate::error::{ControlFailure, Error, Result};
use crate::host::{DeviceControl, HostInventory};
use async_trait::async_trait;
use protocol::{DeviceKey, DeviceRecord, InventoryEntry};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a Windows-style instance ID such as `USB\VID_046D&PID_C52B\SN000001`
pub fn mock_instance_id(vid: &str, pid: &str, serial: u32) -> String {
    format!(r"USB\VID_{}&PID_{}\SN{:06}", vid, pid, serial)
}

/// Create a mock DeviceRecord (not whitelisted, not blocked)
///
/// # Arguments
/// * `vid` - USB Vendor ID (4 hex digits)
/// * `pid` - USB Product ID (4 hex digits)
/// * `description` - Human-readable description
pub fn create_mock_record(vid: &str, pid: &str, description: &str) -> DeviceRecord {
    let key = DeviceKey::new(vid, pid).expect("mock VID/PID must be 4 hex digits");
    DeviceRecord::new(
        mock_instance_id(vid, pid, 1),
        key,
        description,
        "Test Manufacturer",
    )
}

/// Create a mock inventory entry as the host would report it
pub fn create_mock_inventory_entry(
    device_id: &str,
    description: &str,
    status: &str,
) -> InventoryEntry {
    InventoryEntry {
        device_id: Some(device_id.to_string()),
        description: Some(description.to_string()),
        name: Some(description.to_string()),
        manufacturer: Some("Test Manufacturer".to_string()),
        status: Some(status.to_string()),
    }
}

/// In-memory host implementing both [`HostInventory`] and [`DeviceControl`]
///
/// Successful control calls flip the status of every simulated device whose
/// instance ID carries the key, so a follow-up query observes the change.
/// Clones share state.
#[derive(Clone, Default)]
pub struct SimulatedHost {
    state: Arc<Mutex<SimulatedState>>,
}

#[derive(Default)]
struct SimulatedState {
    entries: Vec<InventoryEntry>,
    control_failures: HashMap<DeviceKey, ControlFailure>,
    enable_calls: HashMap<DeviceKey, usize>,
    disable_calls: HashMap<DeviceKey, usize>,
    inventory_failure: Option<String>,
    control_delay: Option<Duration>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a device; `blocked` devices report status "Error"
    pub fn with_device(self, vid: &str, pid: &str, description: &str, blocked: bool) -> Self {
        let serial = self.state().entries.len() as u32 + 1;
        self.add_entry(create_mock_inventory_entry(
            &mock_instance_id(vid, pid, serial),
            description,
            if blocked { "Error" } else { "OK" },
        ));
        self
    }

    /// Attach a raw inventory entry as-is
    pub fn add_entry(&self, entry: InventoryEntry) {
        self.state().entries.push(entry);
    }

    /// Make every control call for `key` fail with `failure`
    pub fn fail_control_for(&self, key: &DeviceKey, failure: ControlFailure) {
        self.state().control_failures.insert(key.clone(), failure);
    }

    /// Make the next inventory queries fail as a whole
    pub fn fail_inventory(&self, reason: &str) {
        self.state().inventory_failure = Some(reason.to_string());
    }

    /// Delay every control call, to exercise concurrency
    pub fn set_control_delay(&self, delay: Duration) {
        self.state().control_delay = Some(delay);
    }

    /// Number of `enable` calls issued for `key`
    pub fn enable_calls(&self, key: &DeviceKey) -> usize {
        self.state().enable_calls.get(key).copied().unwrap_or(0)
    }

    /// Number of `disable` calls issued for `key`
    pub fn disable_calls(&self, key: &DeviceKey) -> usize {
        self.state().disable_calls.get(key).copied().unwrap_or(0)
    }

    /// Total number of control calls of either kind
    pub fn total_control_calls(&self) -> usize {
        let state = self.state();
        state.enable_calls.values().sum::<usize>() + state.disable_calls.values().sum::<usize>()
    }

    /// Current simulated status of a device, if attached
    pub fn status_of(&self, device_id: &str) -> Option<String> {
        self.state()
            .entries
            .iter()
            .find(|e| e.device_id.as_deref() == Some(device_id))
            .and_then(|e| e.status.clone())
    }

    async fn toggle(
        &self,
        key: &DeviceKey,
        enable: bool,
    ) -> std::result::Result<(), ControlFailure> {
        let delay = {
            let mut state = self.state();
            let calls = if enable {
                &mut state.enable_calls
            } else {
                &mut state.disable_calls
            };
            *calls.entry(key.clone()).or_insert(0) += 1;
            state.control_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(failure) = state.control_failures.get(key) {
            return Err(failure.clone());
        }

        let status = if enable { "OK" } else { "Error" };
        for entry in state.entries.iter_mut() {
            let matches = entry
                .device_id
                .as_deref()
                .and_then(DeviceKey::from_instance_id)
                .is_some_and(|k| &k == key);
            if matches {
                entry.status = Some(status.to_string());
            }
        }

        Ok(())
    }
}

#[async_trait]
impl HostInventory for SimulatedHost {
    async fn query(&self) -> Result<Vec<InventoryEntry>> {
        let state = self.state();
        if let Some(reason) = &state.inventory_failure {
            return Err(Error::Enumeration(reason.clone()));
        }
        Ok(state.entries.clone())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[async_trait]
impl DeviceControl for SimulatedHost {
    async fn enable(&self, key: &DeviceKey) -> std::result::Result<(), ControlFailure> {
        self.toggle(key, true).await
    }

    async fn disable(&self, key: &DeviceKey) -> std::result::Result<(), ControlFailure> {
        self.toggle(key, false).await
    }
}

/// Run an async operation with a timeout
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(
    duration: Duration,
    future: F,
) -> std::result::Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
