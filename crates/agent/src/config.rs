//! Agent configuration management

use crate::audit::AuditLevel;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholders understood in control argument templates
pub const TEMPLATE_PLACEHOLDERS: [&str; 3] = ["{pattern}", "{vid}", "{pid}"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    /// Whitelist persistence
    #[serde(default)]
    pub storage: StorageSettings,
    /// Host device inventory backend
    #[serde(default)]
    pub inventory: InventorySettings,
    /// External device control utility
    #[serde(default)]
    pub control: ControlSettings,
    /// Audit logging configuration
    #[serde(default)]
    pub audit: AuditConfig,
    /// Periodic scan mode
    #[serde(default)]
    pub watch: WatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    #[serde(default = "GeneralSettings::default_log_level")]
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl GeneralSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Whitelist file; `~` is expanded
    #[serde(default = "StorageSettings::default_whitelist_path")]
    pub whitelist_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            whitelist_path: Self::default_whitelist_path(),
        }
    }
}

impl StorageSettings {
    fn default_whitelist_path() -> PathBuf {
        if let Some(data_dir) = dirs::data_dir() {
            data_dir.join("usb-gatekeeper").join("whitelist.json")
        } else {
            PathBuf::from(".local/share/usb-gatekeeper/whitelist.json")
        }
    }

    /// Whitelist path with a leading `~` expanded
    pub fn resolved_whitelist_path(&self) -> PathBuf {
        expand_path(&self.whitelist_path)
    }
}

/// Host inventory backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventoryBackend {
    /// PowerShell / CIM query of Win32_PnPEntity
    Wmi,
    /// Linux sysfs device tree
    Sysfs,
}

impl Default for InventoryBackend {
    fn default() -> Self {
        if cfg!(windows) { Self::Wmi } else { Self::Sysfs }
    }
}

impl InventoryBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Wmi => "wmi",
            Self::Sysfs => "sysfs",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventorySettings {
    #[serde(default)]
    pub backend: InventoryBackend,
    /// Root of the sysfs USB device tree
    #[serde(default = "InventorySettings::default_sysfs_root")]
    pub sysfs_root: PathBuf,
    /// Inventory query timeout (e.g. "30s")
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for InventorySettings {
    fn default() -> Self {
        Self {
            backend: InventoryBackend::default(),
            sysfs_root: Self::default_sysfs_root(),
            timeout: default_timeout(),
        }
    }
}

impl InventorySettings {
    fn default_sysfs_root() -> PathBuf {
        PathBuf::from("/sys/bus/usb/devices")
    }
}

/// External device control utility settings
///
/// # Example Configuration
/// ```toml
/// [control]
/// program = "C:\\Tools\\devcon.exe"
/// disable_args = ["disable", "{pattern}"]
/// enable_args = ["enable", "{pattern}"]
/// timeout = "45s"
/// max_concurrent = 2
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlSettings {
    /// Program name or explicit path
    #[serde(default = "ControlSettings::default_program")]
    pub program: String,
    /// Directories searched for the program when it is not an explicit path
    #[serde(default = "ControlSettings::default_search_paths")]
    pub search_paths: Vec<PathBuf>,
    #[serde(default = "ControlSettings::default_enable_args")]
    pub enable_args: Vec<String>,
    #[serde(default = "ControlSettings::default_disable_args")]
    pub disable_args: Vec<String>,
    /// Per-invocation timeout; the process is killed on expiry
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
    /// Concurrent invocations during bulk operations (1 = sequential)
    #[serde(default = "ControlSettings::default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            search_paths: Self::default_search_paths(),
            enable_args: Self::default_enable_args(),
            disable_args: Self::default_disable_args(),
            timeout: default_timeout(),
            max_concurrent: Self::default_max_concurrent(),
        }
    }
}

impl ControlSettings {
    fn default_program() -> String {
        "devcon".to_string()
    }

    fn default_search_paths() -> Vec<PathBuf> {
        let kits = r"C:\Program Files (x86)\Windows Kits\10\Tools\10.0.26100.0";
        vec![
            PathBuf::from(format!(r"{}\x64", kits)),
            PathBuf::from(format!(r"{}\arm64", kits)),
        ]
    }

    fn default_enable_args() -> Vec<String> {
        vec!["enable".to_string(), "{pattern}".to_string()]
    }

    fn default_disable_args() -> Vec<String> {
        vec!["disable".to_string(), "{pattern}".to_string()]
    }

    fn default_max_concurrent() -> usize {
        4
    }
}

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable audit logging
    #[serde(default)]
    pub enabled: bool,
    /// Path to audit log file
    #[serde(default = "AuditConfig::default_path")]
    pub path: PathBuf,
    /// Audit level (all, standard, security, off)
    #[serde(default)]
    pub level: AuditLevel,
    /// Maximum log file size in MB before rotation
    #[serde(default = "AuditConfig::default_max_size_mb")]
    pub max_size_mb: u32,
    /// Maximum number of rotated files to keep
    #[serde(default = "AuditConfig::default_max_files")]
    pub max_files: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: Self::default_path(),
            level: AuditLevel::default(),
            max_size_mb: Self::default_max_size_mb(),
            max_files: Self::default_max_files(),
        }
    }
}

impl AuditConfig {
    fn default_path() -> PathBuf {
        if let Some(data_dir) = dirs::data_local_dir() {
            data_dir.join("usb-gatekeeper").join("audit.log")
        } else {
            PathBuf::from("/var/log/usb-gatekeeper/audit.log")
        }
    }

    fn default_max_size_mb() -> u32 {
        10
    }

    fn default_max_files() -> u32 {
        5
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Delay between scans
    #[serde(default = "WatchSettings::default_interval", with = "duration_serde")]
    pub interval: Duration,
    /// Block every non-whitelisted device on each pass
    #[serde(default)]
    pub enforce: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
            enforce: false,
        }
    }
}

impl WatchSettings {
    fn default_interval() -> Duration {
        Duration::from_secs(60)
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

/// Serde helpers for durations written as "1h30m", "45s" or bare seconds
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "1h", "30m", "1h30m"
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        let mut total_secs: u64 = 0;
        let mut current_num = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                current_num.push(c);
                continue;
            }

            if current_num.is_empty() {
                return Err(format!("Invalid duration format: {}", s));
            }
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            current_num.clear();

            let unit = match c {
                'h' => 3600,
                'm' => 60,
                's' => 1,
                _ => return Err(format!("Invalid duration unit: {}", c)),
            };
            total_secs = num
                .checked_mul(unit)
                .and_then(|secs| total_secs.checked_add(secs))
                .ok_or_else(|| "Duration too large".to_string())?;
        }

        // Trailing number without a unit counts as seconds
        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total_secs = total_secs
                .checked_add(num)
                .ok_or_else(|| "Duration too large".to_string())?;
        }

        if total_secs == 0 {
            return Err("Duration must be greater than 0".to_string());
        }

        Ok(Duration::from_secs(total_secs))
    }

    pub fn format_duration(d: Duration) -> String {
        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{}s", secs));
        }
        result
    }
}

impl AgentConfig {
    /// Load configuration from the specified path
    ///
    /// Without an explicit path the user config directory is tried first,
    /// then `/etc/usb-gatekeeper/agent.toml`. Fails if no file exists.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand_path(&p),
            None => Self::search_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?,
        };

        Self::load_file(&config_path)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the first existing file on the search path, or defaults if none
    ///
    /// A file that exists but cannot be read, parsed or validated is an
    /// error, never a silent fallback to the default whitelist location.
    pub fn load_or_default() -> Result<Self> {
        Self::load_first(&Self::search_paths())
    }

    /// Load the first of `candidates` that exists, or defaults if none does
    pub fn load_first(candidates: &[PathBuf]) -> Result<Self> {
        match candidates.iter().find(|p| p.exists()) {
            Some(path) => Self::load_file(path),
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Configuration files tried in order when no path is given
    pub fn search_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc/usb-gatekeeper/agent.toml"),
        ]
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-gatekeeper").join("agent.toml")
        } else {
            PathBuf::from(".config/usb-gatekeeper/agent.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.storage.whitelist_path.as_os_str().is_empty() {
            return Err(anyhow!("storage.whitelist_path must not be empty"));
        }

        if self.control.program.trim().is_empty() {
            return Err(anyhow!("control.program must not be empty"));
        }

        Self::validate_template("control.enable_args", &self.control.enable_args)?;
        Self::validate_template("control.disable_args", &self.control.disable_args)?;

        if self.control.max_concurrent == 0 {
            return Err(anyhow!("control.max_concurrent must be at least 1"));
        }

        for (name, timeout) in [
            ("control.timeout", self.control.timeout),
            ("inventory.timeout", self.inventory.timeout),
            ("watch.interval", self.watch.interval),
        ] {
            if timeout.is_zero() {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }

        Ok(())
    }

    /// An argument template must name the device somewhere
    fn validate_template(name: &str, args: &[String]) -> Result<()> {
        if args.is_empty() {
            return Err(anyhow!("{} must not be empty", name));
        }

        let has_placeholder = args
            .iter()
            .any(|arg| TEMPLATE_PLACEHOLDERS.iter().any(|p| arg.contains(p)));
        if !has_placeholder {
            return Err(anyhow!(
                "{} must contain one of: {}",
                name,
                TEMPLATE_PLACEHOLDERS.join(", ")
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::duration_serde::{format_duration, parse_duration};
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.control.program, "devcon");
        assert_eq!(config.control.max_concurrent, 4);
        assert_eq!(config.control.timeout, Duration::from_secs(30));
        assert!(!config.audit.enabled);
        assert!(!config.watch.enforce);
        assert!(
            config
                .storage
                .whitelist_path
                .ends_with("usb-gatekeeper/whitelist.json")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = AgentConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: AgentConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.general.log_level, parsed.general.log_level);
        assert_eq!(config.control.enable_args, parsed.control.enable_args);
        assert_eq!(config.control.timeout, parsed.control.timeout);
        assert_eq!(config.inventory.backend, parsed.inventory.backend);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = AgentConfig::default();
        assert!(config.validate().is_ok());

        config.general.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.general.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_templates() {
        let mut config = AgentConfig::default();
        config.control.disable_args = vec![];
        assert!(config.validate().is_err());

        config.control.disable_args = vec!["disable".to_string(), "*".to_string()];
        assert!(config.validate().is_err());

        config.control.disable_args = vec!["--vid={vid}".to_string(), "--pid={pid}".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_concurrent() {
        let mut config = AgentConfig::default();
        config.control.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("m").is_err());
        assert_eq!(
            parse_duration("9999999999999999h").unwrap_err(),
            "Duration too large"
        );
        assert!(parse_duration("5124095576030431h16s").is_err());
        assert!(parse_duration("18446744073709551615m").is_err());
    }

    #[test]
    fn test_load_first_without_files_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_first(&[dir.path().join("agent.toml")]).unwrap();
        assert_eq!(config.control.program, "devcon");
    }

    #[test]
    fn test_load_first_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("agent.toml");
        fs::write(
            &bad,
            r#"
[general]
log_level = "verbose"

[storage]
whitelist_path = "/srv/approved/whitelist.json"
"#,
        )
        .unwrap();
        let fallback = dir.path().join("fallback.toml");
        fs::write(&fallback, "").unwrap();

        let err = AgentConfig::load_first(&[bad.clone(), fallback]).unwrap_err();
        assert!(format!("{:#}", err).contains(&bad.display().to_string()));
    }

    #[test]
    fn test_load_first_picks_first_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(
            &path,
            "[storage]\nwhitelist_path = \"/srv/approved/whitelist.json\"\n",
        )
        .unwrap();

        let config = AgentConfig::load_first(&[dir.path().join("missing.toml"), path]).unwrap();
        assert_eq!(
            config.storage.whitelist_path,
            PathBuf::from("/srv/approved/whitelist.json")
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
    }

    #[test]
    fn test_tilde_expansion() {
        let storage = StorageSettings {
            whitelist_path: PathBuf::from("~/gatekeeper/whitelist.json"),
        };
        let resolved = storage.resolved_whitelist_path();
        assert!(!resolved.to_string_lossy().starts_with('~'));
        assert!(resolved.ends_with("gatekeeper/whitelist.json"));
    }
}
