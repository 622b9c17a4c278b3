//! Persistent whitelist store
//!
//! Holds the set of approved device keys in memory and mirrors every
//! mutation to a JSON file. Writes go through a temporary file in the target
//! directory which is then renamed over the target, so a crash never leaves
//! a half-written whitelist behind.

use common::{Error, Result};
use protocol::{DeviceKey, WhitelistEntry, decode_whitelist, encode_whitelist};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Whitelist backed by a file
///
/// Keys are unique within the store. If a mutation cannot be persisted the
/// in-memory state is rolled back so it always matches the file.
#[derive(Debug)]
pub struct PolicyStore {
    path: PathBuf,
    entries: Vec<WhitelistEntry>,
}

impl PolicyStore {
    /// Load the whitelist from `path`
    ///
    /// A missing file is created empty (parent directories included). An
    /// unreadable or malformed file fails with [`Error::Storage`].
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if !path.exists() {
            let store = Self {
                path,
                entries: Vec::new(),
            };
            store.save()?;
            info!("Created empty whitelist at {}", store.path.display());
            return Ok(store);
        }

        let entries = read_entries(&path)?;
        debug!(
            "Loaded {} whitelist entries from {}",
            entries.len(),
            path.display()
        );

        Ok(Self { path, entries })
    }

    /// Write the full whitelist, replacing the previous file
    pub fn save(&self) -> Result<()> {
        let content = encode_whitelist(&self.entries).map_err(|e| Error::storage(&self.path, e))?;
        write_atomic(&self.path, content.as_bytes())
    }

    /// Insert an entry unless its key is already present
    ///
    /// Returns whether the entry was inserted.
    pub fn add(&mut self, entry: WhitelistEntry) -> Result<bool> {
        if self.contains(&entry.device_key) {
            return Ok(false);
        }

        self.entries.push(entry);
        if let Err(e) = self.save() {
            self.entries.pop();
            return Err(e);
        }

        Ok(true)
    }

    /// Remove every entry with `key`, returning how many were removed
    pub fn remove(&mut self, key: &DeviceKey) -> Result<usize> {
        let previous = self.entries.clone();
        self.entries.retain(|entry| &entry.device_key != key);

        let removed = previous.len() - self.entries.len();
        if removed == 0 {
            return Ok(0);
        }

        if let Err(e) = self.save() {
            self.entries = previous;
            return Err(e);
        }

        Ok(removed)
    }

    /// Whitelist membership test
    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.entries.iter().any(|entry| &entry.device_key == key)
    }

    /// Empty the whitelist, returning how many entries were removed
    pub fn clear(&mut self) -> Result<usize> {
        let previous = std::mem::take(&mut self.entries);
        if let Err(e) = self.save() {
            self.entries = previous;
            return Err(e);
        }

        Ok(previous.len())
    }

    /// Copy the whitelist file to `destination`
    pub fn backup(&self, destination: &Path) -> Result<()> {
        let content = fs::read(&self.path).map_err(|e| Error::storage(&self.path, e))?;
        write_atomic(destination, &content)?;

        info!(
            "Backed up whitelist ({} entries) to {}",
            self.entries.len(),
            destination.display()
        );
        Ok(())
    }

    /// Replace the whitelist with the contents of `source`
    ///
    /// The source is validated before the live file is touched: a missing
    /// source fails with [`Error::NotFound`], a corrupt one with
    /// [`Error::Storage`], and either way the current whitelist is unchanged.
    /// Returns the number of entries now in the store.
    pub fn restore(&mut self, source: &Path) -> Result<usize> {
        if !source.exists() {
            return Err(Error::NotFound {
                path: source.to_path_buf(),
            });
        }

        let content = fs::read_to_string(source).map_err(|e| Error::storage(source, e))?;
        let entries = decode_whitelist(&content).map_err(|e| Error::storage(source, e))?;

        write_atomic(&self.path, content.as_bytes())?;
        self.entries = entries;

        info!(
            "Restored whitelist ({} entries) from {}",
            self.entries.len(),
            source.display()
        );
        Ok(self.entries.len())
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[WhitelistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_entries(path: &Path) -> Result<Vec<WhitelistEntry>> {
    let content = fs::read_to_string(path).map_err(|e| Error::storage(path, e))?;
    decode_whitelist(&content).map_err(|e| Error::storage(path, e))
}

/// Write `content` to `path` via a sibling temporary file and a rename
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    fs::create_dir_all(dir).map_err(|e| Error::storage(path, e))?;

    let mut file = NamedTempFile::new_in(dir).map_err(|e| Error::storage(path, e))?;
    file.write_all(content)
        .and_then(|()| file.as_file().sync_all())
        .map_err(|e| Error::storage(path, e))?;
    file.persist(path).map_err(|e| Error::storage(path, e.error))?;

    Ok(())
}
