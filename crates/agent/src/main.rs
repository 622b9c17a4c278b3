//! usb-gatekeeper
//!
//! Command-line front-end of the USB device admission policy agent.
//! Lists attached USB devices by policy state, blocks and unblocks them and
//! manages the device whitelist.

use agent::config::duration_serde::parse_duration;
use agent::watch::{self, WatchOptions};
use agent::{AgentConfig, BulkOutcome, PolicyEngine, create_audit_logger, engine_from_config};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use protocol::{
    Classification, DeviceKey, DeviceRecord, PolicyState, ToggleOutcome, WhitelistEntry,
};
use serde::Serialize;
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usb-gatekeeper")]
#[command(author, version, about = "USB device admission policy agent")]
#[command(long_about = "
Enforces a USB device admission policy on this host. Attached devices are
classified as available, whitelisted or blocked; whitelisted devices are never
blocked. Blocking and unblocking require administrator privileges.

EXAMPLES:
    # List attached devices by policy state
    usb-gatekeeper scan

    # Approve a device model (also unblocks it if attached and blocked)
    usb-gatekeeper whitelist add 046D:C52B

    # Block everything that is not whitelisted
    usb-gatekeeper block-all --yes

    # Re-scan every 30 seconds and block new devices
    usb-gatekeeper watch --interval 30s --enforce

CONFIGURATION:
    The agent looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-gatekeeper/agent.toml
    3. /etc/usb-gatekeeper/agent.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached USB devices by policy state
    Scan,

    /// Block every attached unit of a device model
    Block {
        /// Device key as VID:PID (e.g. 0781:5581)
        key: DeviceKey,
    },

    /// Unblock every attached unit of a device model
    Unblock {
        /// Device key as VID:PID
        key: DeviceKey,
    },

    /// Block all attached devices that are not whitelisted
    BlockAll {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Unblock all blocked devices
    UnblockAll {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage the device whitelist
    Whitelist {
        #[command(subcommand)]
        action: WhitelistCommand,
    },

    /// Re-scan periodically until Ctrl+C
    Watch {
        /// Delay between scans (e.g. "30s", "5m")
        #[arg(long, value_parser = parse_duration)]
        interval: Option<Duration>,

        /// Block non-whitelisted devices on every pass
        #[arg(long)]
        enforce: bool,
    },

    /// Save default configuration to the default location and exit
    SaveConfig,
}

#[derive(Subcommand, Debug)]
enum WhitelistCommand {
    /// Show whitelisted device models
    List,

    /// Whitelist a device model, attached or not
    Add {
        /// Device key as VID:PID
        key: DeviceKey,

        /// Description stored with the entry
        #[arg(short, long)]
        description: Option<String>,

        /// Manufacturer stored with the entry
        #[arg(short, long)]
        manufacturer: Option<String>,
    },

    /// Remove a device model from the whitelist
    Remove {
        /// Device key as VID:PID
        key: DeviceKey,
    },

    /// Remove every whitelist entry
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Copy the whitelist file to PATH
    Backup { path: PathBuf },

    /// Replace the whitelist with the file at PATH
    Restore { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::SaveConfig = args.command {
        let config = AgentConfig::default();
        let path = AgentConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        AgentConfig::load(Some(path.clone()))
    } else {
        AgentConfig::load_or_default()
    }
    .context("Failed to load configuration")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-gatekeeper v{}", env!("CARGO_PKG_VERSION"));

    let audit = create_audit_logger(config.audit.clone());
    let engine =
        engine_from_config(&config, audit.clone()).context("Failed to initialize policy engine")?;

    if let Some(ref audit) = audit {
        audit.log_agent_started(env!("CARGO_PKG_VERSION"), config.inventory.backend.name());
    }

    let output = Output { json: args.json };
    let result = execute(&engine, &config, args.command, output).await;

    if let Some(ref audit) = audit {
        audit.shutdown().await;
    }

    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) if output.json => {
            output.print(&json!({ "ok": false, "error": format!("{:#}", e) }))?;
            std::process::exit(1);
        }
        Err(e) => Err(e),
    }
}

/// Run one command; `Ok(false)` means a failure was already reported
async fn execute(
    engine: &PolicyEngine,
    config: &AgentConfig,
    command: Command,
    output: Output,
) -> Result<bool> {
    match command {
        Command::Scan => {
            let classification = engine.scan_classified().await.context("Scan failed")?;
            output.classification(&classification)?;
            Ok(true)
        }

        Command::Block { key } => {
            let outcome = engine
                .block_key(&key)
                .await
                .with_context(|| format!("Failed to block {}", key))?;
            output.toggled(&outcome)?;
            Ok(true)
        }

        Command::Unblock { key } => {
            let outcome = engine
                .unblock_key(&key)
                .await
                .with_context(|| format!("Failed to unblock {}", key))?;
            output.toggled(&outcome)?;
            Ok(true)
        }

        Command::BlockAll { yes } => {
            let records = engine.scan().await.context("Scan failed")?;
            let eligible = count(&records, |r| !r.is_whitelisted() && !r.is_blocked());
            let prompt = format!("Block {} non-whitelisted device(s)?", eligible);
            if eligible > 0 && !yes && !confirm(&prompt)? {
                output.message("Aborted")?;
                return Ok(true);
            }

            let outcome = engine.block_all(&records).await;
            output.bulk(outcome)
        }

        Command::UnblockAll { yes } => {
            let records = engine.scan().await.context("Scan failed")?;
            let eligible = count(&records, DeviceRecord::is_blocked);
            let prompt = format!("Unblock {} blocked device(s)?", eligible);
            if eligible > 0 && !yes && !confirm(&prompt)? {
                output.message("Aborted")?;
                return Ok(true);
            }

            let outcome = engine.unblock_all(&records).await;
            output.bulk(outcome)
        }

        Command::Whitelist { action } => execute_whitelist(engine, action, output).await,

        Command::Watch { interval, enforce } => {
            let options = WatchOptions {
                interval: interval.unwrap_or(config.watch.interval),
                enforce: enforce || config.watch.enforce,
            };

            info!("Press Ctrl+C to stop");
            let shutdown = async {
                if let Err(e) = signal::ctrl_c().await {
                    error!("Error waiting for Ctrl+C: {}", e);
                }
            };

            let summary = watch::run(engine, options, shutdown).await;
            if output.json {
                output.data(&json!({ "passes": summary.passes, "blocked": summary.blocked }))?;
            } else {
                println!(
                    "Watched {} pass(es), blocked {} device(s)",
                    summary.passes, summary.blocked
                );
            }
            Ok(true)
        }

        Command::SaveConfig => Ok(true),
    }
}

async fn execute_whitelist(
    engine: &PolicyEngine,
    action: WhitelistCommand,
    output: Output,
) -> Result<bool> {
    match action {
        WhitelistCommand::List => {
            output.entries(&engine.whitelist().await)?;
            Ok(true)
        }

        WhitelistCommand::Add {
            key,
            description,
            manufacturer,
        } => {
            let outcome = engine
                .whitelist_key(&key, description, manufacturer)
                .await
                .with_context(|| format!("Failed to whitelist {}", key))?;

            let unblock_error = match &outcome.unblock {
                Some(Err(e)) => Some(e.to_string()),
                _ => None,
            };

            if output.json {
                output.data(&json!({
                    "entry": outcome.entry,
                    "added": outcome.added,
                    "unblocked": matches!(outcome.unblock, Some(Ok(_))),
                    "unblockError": unblock_error,
                }))?;
            } else {
                if outcome.added {
                    println!("Whitelisted {} ({})", key, outcome.entry.description);
                } else {
                    println!("{} is already whitelisted", key);
                }
                if let Some(Ok(toggled)) = &outcome.unblock {
                    println!("Unblocked {}", toggled.description);
                }
                if let Some(e) = &unblock_error {
                    eprintln!("Warning: {} is whitelisted but remains blocked: {}", key, e);
                }
            }

            Ok(!outcome.still_blocked())
        }

        WhitelistCommand::Remove { key } => {
            let removed = engine
                .remove_from_whitelist(&key)
                .await
                .with_context(|| format!("Failed to remove {} from whitelist", key))?;
            if output.json {
                output.data(&json!({ "key": key, "removed": removed }))?;
            } else if removed > 0 {
                println!("Removed {} from whitelist", key);
            } else {
                println!("{} was not whitelisted", key);
            }
            Ok(true)
        }

        WhitelistCommand::Clear { yes } => {
            let entries = engine.whitelist().await.len();
            let prompt = format!("Remove all {} whitelist entries?", entries);
            if entries > 0 && !yes && !confirm(&prompt)? {
                output.message("Aborted")?;
                return Ok(true);
            }

            let removed = engine
                .clear_whitelist()
                .await
                .context("Failed to clear whitelist")?;
            output.message(&format!("Removed {} whitelist entries", removed))?;
            Ok(true)
        }

        WhitelistCommand::Backup { path } => {
            engine
                .backup_whitelist(&path)
                .await
                .with_context(|| format!("Failed to back up whitelist to {}", path.display()))?;
            output.message(&format!("Whitelist backed up to {}", path.display()))?;
            Ok(true)
        }

        WhitelistCommand::Restore { path } => {
            let entries = engine
                .restore_whitelist(&path)
                .await
                .with_context(|| format!("Failed to restore whitelist from {}", path.display()))?;
            output.message(&format!(
                "Restored {} whitelist entries from {}",
                entries,
                path.display()
            ))?;
            Ok(true)
        }
    }
}

fn count(records: &[DeviceRecord], predicate: impl Fn(&DeviceRecord) -> bool) -> usize {
    records.iter().filter(|r| predicate(r)).count()
}

/// Ask a yes/no question on stderr; anything but "y"/"yes" declines
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{} [y/N] ", prompt);
    io::stderr().flush().context("Failed to write prompt")?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;

    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

/// Human-readable or JSON rendering of command results
#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn print(&self, value: &serde_json::Value) -> Result<()> {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("Failed to encode output")?
        );
        Ok(())
    }

    fn data<T: Serialize>(&self, data: &T) -> Result<()> {
        self.print(&json!({ "ok": true, "data": data }))
    }

    fn message(&self, message: &str) -> Result<()> {
        if self.json {
            self.data(&json!({ "message": message }))
        } else {
            println!("{}", message);
            Ok(())
        }
    }

    fn classification(&self, classification: &Classification) -> Result<()> {
        if self.json {
            return self.data(classification);
        }

        for state in [
            PolicyState::Available,
            PolicyState::Whitelisted,
            PolicyState::Blocked,
        ] {
            let records = classification.bucket(state);
            println!("{} ({}):", capitalize(&state.to_string()), records.len());
            if records.is_empty() {
                println!("  (none)");
            }
            for record in records {
                println!(
                    "  {}  {}  {}",
                    record.display_name(),
                    record.manufacturer(),
                    record.instance_id()
                );
            }
            println!();
        }
        Ok(())
    }

    fn toggled(&self, outcome: &ToggleOutcome) -> Result<()> {
        if self.json {
            return self.data(outcome);
        }

        let verb = if outcome.is_blocked() { "Blocked" } else { "Unblocked" };
        println!(
            "{} {} (VID:{} PID:{})",
            verb,
            outcome.description,
            outcome.key.vid(),
            outcome.key.pid()
        );
        Ok(())
    }

    fn entries(&self, entries: &[WhitelistEntry]) -> Result<()> {
        if self.json {
            return self.data(&entries);
        }

        if entries.is_empty() {
            println!("Whitelist is empty");
        }
        for entry in entries {
            println!(
                "  {}  {}  {}",
                entry.device_key, entry.description, entry.manufacturer
            );
        }
        Ok(())
    }

    /// Print a bulk result; returns false when any device failed
    fn bulk(&self, outcome: BulkOutcome) -> Result<bool> {
        let status = outcome.status();

        if self.json {
            let failed: Vec<_> = outcome
                .failed
                .iter()
                .map(|failure| {
                    json!({
                        "instanceId": failure.instance_id,
                        "key": failure.key,
                        "description": failure.description,
                        "error": failure.error.to_string(),
                    })
                })
                .collect();

            self.print(&json!({
                "ok": outcome.failed.is_empty(),
                "data": {
                    "operation": outcome.operation,
                    "status": status,
                    "succeeded": outcome.succeeded,
                    "failed": failed,
                },
            }))?;
            return Ok(outcome.failed.is_empty());
        }

        let operation = outcome.operation;
        for toggled in &outcome.succeeded {
            println!("  {}ed {}", operation, toggled.description);
        }

        match outcome.into_result() {
            Ok(succeeded) if succeeded.is_empty() => {
                println!("Nothing to {}", operation);
                Ok(true)
            }
            Ok(succeeded) => {
                println!("{}ed {} device(s)", capitalize(&operation.to_string()), succeeded.len());
                Ok(true)
            }
            Err(e) => {
                eprintln!("{}", e);
                Ok(false)
            }
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
