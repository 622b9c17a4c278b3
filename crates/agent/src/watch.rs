//! Periodic scan mode
//!
//! Re-scans on a fixed interval and logs devices that appear, disappear or
//! change classification between passes. With enforcement enabled every
//! pass also blocks all devices that are neither whitelisted nor blocked.

use crate::policy::PolicyEngine;
use protocol::{DeviceRecord, PolicyState};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Difference between two consecutive scans
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Attached(DeviceRecord),
    Detached(DeviceRecord),
    StateChanged {
        record: DeviceRecord,
        from: PolicyState,
        to: PolicyState,
    },
}

/// Compare two scans by instance ID
///
/// Attached and changed devices follow the order of `current`, detached ones
/// the order of `previous`.
pub fn diff(previous: &[DeviceRecord], current: &[DeviceRecord]) -> Vec<Change> {
    let before: HashMap<&str, &DeviceRecord> = previous
        .iter()
        .map(|record| (record.instance_id(), record))
        .collect();
    let after: HashMap<&str, &DeviceRecord> = current
        .iter()
        .map(|record| (record.instance_id(), record))
        .collect();

    let mut changes = Vec::new();
    for record in current {
        match before.get(record.instance_id()) {
            None => changes.push(Change::Attached(record.clone())),
            Some(old) if old.policy_state() != record.policy_state() => {
                changes.push(Change::StateChanged {
                    record: record.clone(),
                    from: old.policy_state(),
                    to: record.policy_state(),
                });
            }
            Some(_) => {}
        }
    }

    for record in previous {
        if !after.contains_key(record.instance_id()) {
            changes.push(Change::Detached(record.clone()));
        }
    }

    changes
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub interval: Duration,
    pub enforce: bool,
}

/// Counters for a finished watch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    /// Passes attempted, including failed scans
    pub passes: u64,
    /// Devices blocked by enforcement
    pub blocked: usize,
}

/// Scan every `options.interval` until `shutdown` completes
///
/// A failed pass is logged and the loop carries on.
pub async fn run<F>(engine: &PolicyEngine, options: WatchOptions, shutdown: F) -> WatchSummary
where
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(
        "Watching USB devices every {:?} (enforce: {})",
        options.interval, options.enforce
    );

    let mut summary = WatchSummary::default();
    let mut previous: Option<Vec<DeviceRecord>> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Watch stopped after {} passes", summary.passes);
                break;
            }
            _ = ticker.tick() => {}
        }

        summary.passes += 1;
        let classification = match engine.scan_classified().await {
            Ok(classification) => classification,
            Err(e) => {
                error!("Scan failed: {}", e);
                continue;
            }
        };

        let records = [
            classification.available,
            classification.whitelisted,
            classification.blocked,
        ]
        .concat();

        if let Some(previous) = &previous {
            for change in diff(previous, &records) {
                log_change(&change);
            }
        }

        if options.enforce {
            let outcome = engine.block_all(&records).await;
            summary.blocked += outcome.succeeded.len();
            for failure in &outcome.failed {
                warn!("Enforcement failed for {}", failure);
            }
        }

        previous = Some(records);
    }

    summary
}

fn log_change(change: &Change) {
    match change {
        Change::Attached(record) => {
            info!(
                "Device attached: {} [{}]",
                record.display_name(),
                record.policy_state()
            );
        }
        Change::Detached(record) => info!("Device detached: {}", record.display_name()),
        Change::StateChanged { record, from, to } => {
            info!("Device {}: {} -> {}", record.display_name(), from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mock_record;

    fn with_id(record: DeviceRecord, id: &str) -> DeviceRecord {
        DeviceRecord::new(
            id,
            record.key().clone(),
            record.description(),
            record.manufacturer(),
        )
        .with_whitelisted(record.is_whitelisted())
        .with_blocked(record.is_blocked())
    }

    #[test]
    fn test_diff_reports_changes() {
        let stick = with_id(create_mock_record("1234", "5678", "Stick"), "a");
        let cam = with_id(create_mock_record("AAAA", "BBBB", "Cam"), "b");
        let mouse = with_id(create_mock_record("046D", "C077", "Mouse"), "c");

        let previous = vec![stick.clone(), cam.clone()];
        let current = vec![stick.clone().with_blocked(true), mouse.clone()];

        let changes = diff(&previous, &current);
        assert_eq!(
            changes,
            vec![
                Change::StateChanged {
                    record: stick.with_blocked(true),
                    from: PolicyState::Available,
                    to: PolicyState::Blocked,
                },
                Change::Attached(mouse),
                Change::Detached(cam),
            ]
        );
    }

    #[test]
    fn test_diff_identical_scans() {
        let records = vec![create_mock_record("1234", "5678", "Stick")];
        assert!(diff(&records, &records).is_empty());
    }
}
