//! Integration tests for whitelist persistence
//!
//! Covers the on-disk format seen by other tools, backups and restores,
//! and round-tripping through a fresh load.

use agent::PolicyStore;
use common::Error;
use protocol::{DeviceKey, WhitelistEntry};
use std::fs;
use tempfile::TempDir;

fn entry(vid: &str, pid: &str, description: &str) -> WhitelistEntry {
    WhitelistEntry::new(DeviceKey::new(vid, pid).unwrap(), description, "Vendor")
}

mod persistence {
    use super::*;

    #[test]
    fn test_load_creates_missing_file_and_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state").join("whitelist.json");

        let store = PolicyStore::load(&path).unwrap();
        assert!(store.is_empty());
        assert!(path.exists());
        assert_eq!(store.path(), path.as_path());
    }

    #[test]
    fn test_reads_legacy_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whitelist.json");
        fs::write(
            &path,
            r#"[
                {
                    "VID": "046d",
                    "PID": "c52b",
                    "Description": "USB Receiver",
                    "Manufacturer": "Logitech"
                }
            ]"#,
        )
        .unwrap();

        let store = PolicyStore::load(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.entries()[0].manufacturer, "Logitech");
        assert!(store.contains(&DeviceKey::new("046d", "c52b").unwrap()));
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whitelist.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(PolicyStore::load(&path), Err(Error::Storage { .. })));
    }

    #[test]
    fn test_mutations_are_visible_to_a_fresh_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whitelist.json");

        let mut store = PolicyStore::load(&path).unwrap();
        assert!(store.add(entry("046D", "C52B", "USB Receiver")).unwrap());
        assert!(store.add(entry("0781", "5581", "Ultra")).unwrap());
        assert!(!store.add(entry("046D", "C52B", "Renamed")).unwrap());
        assert_eq!(store.remove(&DeviceKey::new("0781", "5581").unwrap()).unwrap(), 1);

        let reloaded = PolicyStore::load(&path).unwrap();
        assert_eq!(reloaded.entries(), store.entries());
        assert_eq!(reloaded.entries()[0].description, "USB Receiver");
    }
}

mod backup_restore {
    use super::*;

    #[test]
    fn test_backup_then_restore_replaces_entries() {
        let dir = TempDir::new().unwrap();
        let mut store = PolicyStore::load(dir.path().join("whitelist.json")).unwrap();
        store.add(entry("046D", "C52B", "USB Receiver")).unwrap();

        let backup = dir.path().join("whitelist.backup.json");
        store.backup(&backup).unwrap();

        store.clear().unwrap();
        store.add(entry("0781", "5581", "Ultra")).unwrap();

        assert_eq!(store.restore(&backup).unwrap(), 1);
        assert!(store.contains(&DeviceKey::new("046D", "C52B").unwrap()));
        assert!(!store.contains(&DeviceKey::new("0781", "5581").unwrap()));

        let reloaded = PolicyStore::load(store.path()).unwrap();
        assert_eq!(reloaded.entries(), store.entries());
    }

    #[test]
    fn test_restore_missing_source_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut store = PolicyStore::load(dir.path().join("whitelist.json")).unwrap();
        store.add(entry("046D", "C52B", "USB Receiver")).unwrap();

        let result = store.restore(&dir.path().join("nope.json"));
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_restore_corrupt_source_keeps_live_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whitelist.json");
        let mut store = PolicyStore::load(&path).unwrap();
        store.add(entry("046D", "C52B", "USB Receiver")).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, "[{\"DeviceKey\": 12}]").unwrap();

        assert!(matches!(store.restore(&corrupt), Err(Error::Storage { .. })));
        assert_eq!(store.len(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }
}

mod properties {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn save_load_keeps_deduplicated_set(pids in prop::collection::vec(0u16..8, 0..20)) {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("whitelist.json");

            let mut store = PolicyStore::load(&path).unwrap();
            for pid in &pids {
                store.add(entry("ABCD", &format!("{:04X}", pid), "Device")).unwrap();
            }

            let expected: HashSet<DeviceKey> = pids
                .iter()
                .map(|pid| DeviceKey::new("ABCD", &format!("{:04X}", pid)).unwrap())
                .collect();

            let reloaded = PolicyStore::load(&path).unwrap();
            let keys: HashSet<DeviceKey> = reloaded
                .entries()
                .iter()
                .map(|e| e.device_key.clone())
                .collect();

            prop_assert_eq!(reloaded.len(), expected.len());
            prop_assert_eq!(keys, expected);
        }
    }
}
