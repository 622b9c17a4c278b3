//! usb-gatekeeper agent
//!
//! Enforces a USB device admission policy on the local host: attached
//! devices are enumerated, classified against a persisted whitelist and
//! blocked or unblocked through an external device control utility.
//!
//! # Example
//!
//! ```no_run
//! use agent::{AgentConfig, engine_from_config};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AgentConfig::load_or_default()?;
//! let engine = engine_from_config(&config, None)?;
//!
//! let classification = engine.scan_classified().await?;
//! for record in &classification.available {
//!     println!("{}", record.display_name());
//! }
//!
//! let outcome = engine.block_all(&classification.available).await;
//! outcome.into_result()?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod policy;
pub mod store;
pub mod usb;
pub mod watch;

pub use audit::{AuditLogger, SharedAuditLogger, create_audit_logger};
pub use config::AgentConfig;
pub use policy::{BulkOutcome, BulkStatus, PolicyEngine, WhitelistOutcome, classify};
pub use store::PolicyStore;

use std::sync::Arc;
use usb::{CommandControl, inventory_from_settings};

/// Build a policy engine from configuration
///
/// Loads (or creates) the whitelist file and wires the configured inventory
/// backend and control utility.
pub fn engine_from_config(
    config: &AgentConfig,
    audit: Option<SharedAuditLogger>,
) -> common::Result<PolicyEngine> {
    let store = PolicyStore::load(config.storage.resolved_whitelist_path())?;
    let inventory = inventory_from_settings(&config.inventory);
    let control = Arc::new(CommandControl::from_settings(&config.control));

    Ok(PolicyEngine::new(inventory, control, store)
        .with_max_concurrent(config.control.max_concurrent)
        .with_audit(audit))
}
