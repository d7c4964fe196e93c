//! lockscan configuration persistence (htoprc-style key=value format)
//!
//! Saves/loads settings to `%APPDATA%/lockscan/lockscanrc` on Windows and
//! `$XDG_CONFIG_HOME/lockscan/lockscanrc` (or `~/.config/...`) elsewhere.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;

const MIB: usize = 1024 * 1024;

/// Get the config file path: %APPDATA%/lockscan/lockscanrc
pub fn config_path() -> Option<PathBuf> {
    let base = std::env::var_os("APPDATA")
        .or_else(|| std::env::var_os("XDG_CONFIG_HOME"))
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("lockscan").join("lockscanrc"))
}

/// What a cancelled pass hands back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelPolicy {
    /// Drop everything collected so far and fail with `ScanError::Cancelled`.
    Discard,
    /// Correlate what was resolved before cancellation and flag the report partial.
    ReturnPartial,
}

impl CancelPolicy {
    fn key(&self) -> &'static str {
        match self {
            Self::Discard => "discard",
            Self::ReturnPartial => "partial",
        }
    }

    fn from_key(value: &str) -> Option<Self> {
        match value {
            "discard" => Some(Self::Discard),
            "partial" => Some(Self::ReturnPartial),
            _ => None,
        }
    }
}

/// Tunables for a lock scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Upper bound on a single object-name query.
    pub handle_timeout: Duration,

    // Buffer growth for the system table queries
    pub initial_buffer_bytes: usize,
    pub max_buffer_bytes: usize,
    pub max_attempts: u32,
    pub growth_margin_bytes: usize,

    /// Object type names treated as file handles.
    pub file_type_names: Vec<String>,

    pub cancel_policy: CancelPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            handle_timeout: Duration::from_millis(250),
            initial_buffer_bytes: 0,
            max_buffer_bytes: 512 * MIB,
            max_attempts: 16,
            growth_margin_bytes: 64 * 1024,
            file_type_names: vec!["File".to_string()],
            cancel_policy: CancelPolicy::Discard,
        }
    }
}

impl ScanConfig {
    /// Load config from file, returning defaults if file doesn't exist
    pub fn load() -> Self {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    /// Parse `key=value` lines on top of the defaults.
    pub fn parse(content: &str) -> Self {
        let mut cfg = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("ignoring malformed config line: {line}");
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let applied = match key {
                "handle_timeout_ms" => value
                    .parse::<u64>()
                    .ok()
                    .map(|ms| cfg.handle_timeout = Duration::from_millis(ms.clamp(10, 60_000))),
                "initial_buffer_bytes" => {
                    value.parse().ok().map(|v| cfg.initial_buffer_bytes = v)
                }
                "max_buffer_mib" => value
                    .parse::<usize>()
                    .ok()
                    .filter(|&v| v > 0)
                    .map(|v| cfg.max_buffer_bytes = v.saturating_mul(MIB)),
                "max_attempts" => value
                    .parse::<u32>()
                    .ok()
                    .filter(|&v| v > 0)
                    .map(|v| cfg.max_attempts = v),
                "growth_margin_bytes" => {
                    value.parse().ok().map(|v| cfg.growth_margin_bytes = v)
                }
                "file_type_names" => {
                    let names: Vec<String> = value
                        .split(',')
                        .map(|s| s.trim())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                    (!names.is_empty()).then(|| cfg.file_type_names = names)
                }
                "cancel_policy" => {
                    CancelPolicy::from_key(value).map(|p| cfg.cancel_policy = p)
                }
                _ => {
                    warn!("ignoring unknown config key: {key}");
                    Some(())
                }
            };
            if applied.is_none() {
                warn!("ignoring invalid value for {key}: {value}");
            }
        }

        cfg
    }

    /// Render the config in the same format `parse` reads.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        lines.push("# lockscan configuration file".to_string());
        lines.push(String::new());
        lines.push(format!("handle_timeout_ms={}", self.handle_timeout.as_millis()));
        lines.push(format!("initial_buffer_bytes={}", self.initial_buffer_bytes));
        lines.push(format!("max_buffer_mib={}", (self.max_buffer_bytes / MIB).max(1)));
        lines.push(format!("max_attempts={}", self.max_attempts));
        lines.push(format!("growth_margin_bytes={}", self.growth_margin_bytes));
        lines.push(format!("file_type_names={}", self.file_type_names.join(",")));
        lines.push(format!("cancel_policy={}", self.cancel_policy.key()));
        lines.join("\n") + "\n"
    }

    /// Save config to the default location
    pub fn save(&self) -> io::Result<PathBuf> {
        let path = config_path().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "could not determine config path")
        })?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(self.render().as_bytes())
    }
}
