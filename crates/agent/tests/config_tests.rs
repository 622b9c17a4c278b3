//! Integration tests for configuration parsing
//!
//! Tests agent configuration parsing, including:
//! - Minimal and full TOML documents
//! - Duration strings
//! - Invalid configuration handling
//! - Save/load through a file

use agent::AgentConfig;
use agent::audit::AuditLevel;
use agent::config::InventoryBackend;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

mod parsing {
    use super::*;

    const FULL_CONFIG: &str = r#"
[general]
log_level = "debug"

[storage]
whitelist_path = "/var/lib/usb-gatekeeper/whitelist.json"

[inventory]
backend = "sysfs"
sysfs_root = "/sys/bus/usb/devices"
timeout = "10s"

[control]
program = "C:\\Tools\\devcon.exe"
search_paths = []
enable_args = ["enable", "{pattern}"]
disable_args = ["disable", "*VID_{vid}&PID_{pid}*"]
timeout = "1m30s"
max_concurrent = 2

[audit]
enabled = true
path = "/var/log/usb-gatekeeper/audit.log"
level = "security"
max_size_mb = 20
max_files = 3

[watch]
interval = "5m"
enforce = true
"#;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = AgentConfig::from_toml_str("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.control.program, "devcon");
        assert_eq!(config.control.max_concurrent, 4);
        assert_eq!(config.control.timeout, Duration::from_secs(30));
        assert_eq!(config.watch.interval, Duration::from_secs(60));
        assert!(!config.watch.enforce);
        assert!(!config.audit.enabled);
        assert!(config.storage.whitelist_path.ends_with("whitelist.json"));
    }

    #[test]
    fn test_full_document() {
        let config = AgentConfig::from_toml_str(FULL_CONFIG).unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(
            config.storage.whitelist_path,
            PathBuf::from("/var/lib/usb-gatekeeper/whitelist.json")
        );
        assert_eq!(config.inventory.backend, InventoryBackend::Sysfs);
        assert_eq!(config.inventory.timeout, Duration::from_secs(10));
        assert_eq!(config.control.program, r"C:\Tools\devcon.exe");
        assert!(config.control.search_paths.is_empty());
        assert_eq!(config.control.disable_args[1], "*VID_{vid}&PID_{pid}*");
        assert_eq!(config.control.timeout, Duration::from_secs(90));
        assert_eq!(config.control.max_concurrent, 2);
        assert!(config.audit.enabled);
        assert_eq!(config.audit.level, AuditLevel::Security);
        assert_eq!(config.audit.max_files, 3);
        assert_eq!(config.watch.interval, Duration::from_secs(300));
        assert!(config.watch.enforce);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = AgentConfig::from_toml_str(
            r#"
[control]
max_concurrent = 1
"#,
        )
        .unwrap();

        assert_eq!(config.control.max_concurrent, 1);
        assert_eq!(config.control.program, "devcon");
        assert_eq!(config.control.enable_args, vec!["enable", "{pattern}"]);
    }
}

mod invalid {
    use super::*;

    #[test]
    fn test_rejects_unknown_log_level() {
        let result = AgentConfig::from_toml_str("[general]\nlog_level = \"loud\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let result = AgentConfig::from_toml_str("[control]\nmax_concurrent = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_template_without_placeholder() {
        let result = AgentConfig::from_toml_str("[control]\ndisable_args = [\"disable\", \"*\"]\n");
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("control.disable_args"), "{}", message);
    }

    #[test]
    fn test_rejects_bad_duration() {
        assert!(AgentConfig::from_toml_str("[watch]\ninterval = \"soon\"\n").is_err());
        assert!(AgentConfig::from_toml_str("[control]\ntimeout = \"0s\"\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(AgentConfig::from_toml_str("[inventory]\nbackend = \"libusb\"\n").is_err());
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = TempDir::new().unwrap();
        assert!(AgentConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}

mod files {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("agent.toml");

        let mut config = AgentConfig::default();
        config.control.max_concurrent = 3;
        config.watch.interval = Duration::from_secs(5400);
        config.audit.level = AuditLevel::All;
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.control.max_concurrent, 3);
        assert_eq!(loaded.watch.interval, Duration::from_secs(5400));
        assert_eq!(loaded.audit.level, AuditLevel::All);
    }
}
