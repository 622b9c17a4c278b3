//! Host device inventory backends
//!
//! - [`WmiInventory`] queries `Win32_PnPEntity` for the USB device class
//!   through PowerShell and decodes its JSON output.
//! - [`SysfsInventory`] walks the Linux sysfs USB device tree and reports
//!   entries in the same shape, so the enumerator treats both alike.

use crate::config::{InventoryBackend, InventorySettings};
use crate::usb::process::run_captured;
use async_trait::async_trait;
use common::{Error, HostInventory, Result};
use protocol::{InventoryEntry, decode_inventory};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Device setup class GUID of USB devices
pub const USB_CLASS_GUID: &str = "{36FC9E60-C465-11CF-8056-444553540000}";

/// Vendor ID reported by Linux for its virtual root hubs
const LINUX_ROOT_HUB_VID: &str = "1d6b";

/// Build the inventory backend selected in configuration
pub fn inventory_from_settings(settings: &InventorySettings) -> Arc<dyn HostInventory> {
    match settings.backend {
        InventoryBackend::Wmi => Arc::new(WmiInventory::new(settings.timeout)),
        InventoryBackend::Sysfs => Arc::new(SysfsInventory::new(&settings.sysfs_root)),
    }
}

/// Inventory read from WMI via PowerShell
#[derive(Debug, Clone)]
pub struct WmiInventory {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl WmiInventory {
    pub fn new(timeout: Duration) -> Self {
        let script = format!(
            "Get-CimInstance -ClassName Win32_PnPEntity -Filter \"ClassGuid='{}'\" \
             | Select-Object DeviceID, Description, Name, Manufacturer, Status \
             | ConvertTo-Json -Compress",
            USB_CLASS_GUID
        );

        Self::with_command(
            "powershell",
            vec![
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-Command".to_string(),
                script,
            ],
            timeout,
        )
    }

    /// Use a different command producing the same JSON output
    pub fn with_command(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl HostInventory for WmiInventory {
    async fn query(&self) -> Result<Vec<InventoryEntry>> {
        let output = run_captured(&self.program, &self.args, self.timeout)
            .await
            .and_then(|output| output.into_result())
            .map_err(|failure| Error::Enumeration(format!("WMI query failed: {}", failure)))?;

        let entries = decode_inventory(&output.stdout)
            .map_err(|e| Error::Enumeration(format!("Unreadable WMI output: {}", e)))?;

        debug!("WMI reported {} USB entries", entries.len());
        Ok(entries)
    }

    fn name(&self) -> &str {
        "wmi"
    }
}

/// Inventory read from `/sys/bus/usb/devices`
///
/// Each device node yields an identifier `USB\VID_xxxx&PID_xxxx\<node>`.
/// Devices whose `authorized` attribute is `0` report status `Disabled`.
#[derive(Debug, Clone)]
pub struct SysfsInventory {
    root: PathBuf,
}

impl SysfsInventory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl HostInventory for SysfsInventory {
    async fn query(&self) -> Result<Vec<InventoryEntry>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || read_sysfs(&root))
            .await
            .map_err(|e| Error::Enumeration(format!("sysfs scan task failed: {}", e)))?
    }

    fn name(&self) -> &str {
        "sysfs"
    }
}

fn read_sysfs(root: &Path) -> Result<Vec<InventoryEntry>> {
    let dir = fs::read_dir(root)
        .map_err(|e| Error::Enumeration(format!("Cannot read {}: {}", root.display(), e)))?;

    let mut nodes: Vec<(String, PathBuf)> = dir
        .filter_map(|entry| match entry {
            Ok(entry) => Some((entry.file_name().to_string_lossy().into_owned(), entry.path())),
            Err(e) => {
                warn!("Skipping unreadable sysfs entry: {}", e);
                None
            }
        })
        // Interface nodes ("1-1:1.0") are not devices
        .filter(|(name, _)| !name.contains(':'))
        .collect();
    nodes.sort();

    let mut entries = Vec::with_capacity(nodes.len());
    for (name, path) in nodes {
        match read_sysfs_device(&name, &path) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(e) => warn!("Skipping sysfs device {}: {}", name, e),
        }
    }

    debug!("sysfs reported {} USB devices", entries.len());
    Ok(entries)
}

fn read_sysfs_device(name: &str, path: &Path) -> std::io::Result<Option<InventoryEntry>> {
    let vid = read_attr(path, "idVendor")?;
    let pid = read_attr(path, "idProduct")?;

    if vid.eq_ignore_ascii_case(LINUX_ROOT_HUB_VID) && name.starts_with("usb") {
        debug!("Skipping root hub {}", name);
        return Ok(None);
    }

    let status = match read_attr(path, "authorized") {
        Ok(value) if value == "0" => "Disabled",
        _ => "OK",
    };

    let product = read_attr(path, "product").ok();
    Ok(Some(InventoryEntry {
        device_id: Some(format!(
            r"USB\VID_{}&PID_{}\{}",
            vid.to_ascii_uppercase(),
            pid.to_ascii_uppercase(),
            name
        )),
        description: product.clone(),
        name: product,
        manufacturer: read_attr(path, "manufacturer").ok(),
        status: Some(status.to_string()),
    }))
}

fn read_attr(device: &Path, attr: &str) -> std::io::Result<String> {
    fs::read_to_string(device.join(attr)).map(|value| value.trim().to_string())
}
