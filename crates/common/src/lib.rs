//! Common utilities for usb-gatekeeper
//!
//! This crate provides functionality shared by the policy agent and its
//! front-ends: the error taxonomy, logging setup, the host collaborator
//! traits (device inventory and device control), and test utilities.

pub mod error;
pub mod host;
pub mod logging;
pub mod test_utils;

pub use error::{BulkOperation, ControlFailure, DeviceFailure, Error, Result};
pub use host::{DeviceControl, HostInventory};
pub use logging::setup_logging;
