// src/config/mod.rs
// Milestone settings: mtime-cached JSON file, plus the path-exclusion rule
// that gates which sessions the pipeline will touch at all — spec §4.1.

pub mod exclude;

pub use exclude::is_excluded;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

const DATA_DIRNAME: &str = "milestones";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase2Model {
    Haiku,
    Sonnet,
    Opus,
}

impl Default for Phase2Model {
    fn default() -> Self {
        Self::Haiku
    }
}

/// Milestone settings record, persisted as a single JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_knowledge: bool,
    /// `None` means unlimited (scan-range filter always passes).
    #[serde(default)]
    pub scan_range_days: Option<u32>,
    #[serde(default)]
    pub phase2_model: Phase2Model,
    #[serde(default)]
    pub architecture_model: Phase2Model,
    #[serde(default)]
    pub excluded_paths: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_knowledge: false,
            scan_range_days: None,
            phase2_model: Phase2Model::Haiku,
            architecture_model: Phase2Model::Sonnet,
            excluded_paths: Vec::new(),
        }
    }
}

impl Settings {
    /// Whether `end_timestamp` falls within `scanRangeDays` of now. Null
    /// range always passes; unparseable timestamps are handled upstream by
    /// simply never being constructed (chrono always gives a valid value),
    /// so this function only implements the day-window arithmetic.
    pub fn within_scan_range(&self, end_timestamp: chrono::DateTime<chrono::Utc>) -> bool {
        match self.scan_range_days {
            None => true,
            Some(days) => {
                let cutoff = chrono::Utc::now() - chrono::Duration::days(days as i64);
                end_timestamp >= cutoff
            }
        }
    }
}

/// The milestone data directory lives under the user's home and is always
/// present in `excludedPaths`, whether or not the settings file lists it.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mira")
        .join(DATA_DIRNAME)
}

fn settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mira")
        .join("settings.json")
}

/// mtime-cached settings reader. A fresh `SettingsStore` re-reads the file
/// only when its mtime has moved since the last read; construction does one
/// read so the cache starts warm.
pub struct SettingsStore {
    path: PathBuf,
    cached: std::sync::Mutex<CacheEntry>,
}

struct CacheEntry {
    settings: Settings,
    mtime: Option<SystemTime>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::at_path(settings_path())
    }

    pub fn at_path(path: PathBuf) -> Self {
        let (settings, mtime) = Self::load(&path);
        Self {
            path,
            cached: std::sync::Mutex::new(CacheEntry { settings, mtime }),
        }
    }

    /// Current settings, re-reading from disk only if the file's mtime has
    /// changed since the last read. Malformed JSON falls back to defaults
    /// silently (spec §7 "Settings malformed").
    pub fn current(&self) -> Settings {
        let current_mtime = fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());

        let mut cache = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if current_mtime != cache.mtime {
            let (settings, mtime) = Self::load(&self.path);
            cache.settings = settings;
            cache.mtime = mtime;
        }

        let mut settings = cache.settings.clone();
        ensure_builtin_exclusion(&mut settings);
        settings
    }

    fn load(path: &Path) -> (Settings, Option<SystemTime>) {
        let mtime = fs::metadata(path).ok().and_then(|m| m.modified().ok());
        let settings = match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(error = %err, path = %path.display(), "malformed settings file, using defaults");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        };
        (settings, mtime)
    }

    /// Persist the given settings, creating parent directories as needed.
    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), "settings saved");
        let mut cache = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        cache.settings = settings.clone();
        cache.mtime = fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());
        Ok(())
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Operational configuration read from the environment rather than the
/// persisted settings record — the LLM agent-execution endpoint and its
/// optional bearer token. Mirrors the reference server's single
/// `from_env()` constructor per config struct.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub agent_endpoint_url: String,
    pub agent_endpoint_token: Option<String>,
}

impl EnvConfig {
    /// Loads `.env` (if present) then reads `MILESTONE_AGENT_ENDPOINT_URL`
    /// (required) and `MILESTONE_AGENT_ENDPOINT_TOKEN` (optional).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            agent_endpoint_url: std::env::var("MILESTONE_AGENT_ENDPOINT_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8787/agent".to_string()),
            agent_endpoint_token: std::env::var("MILESTONE_AGENT_ENDPOINT_TOKEN").ok(),
        }
    }
}

/// The built-in milestone data directory can never be removed from the
/// exclusion list, even if the on-disk settings omit it.
fn ensure_builtin_exclusion(settings: &mut Settings) {
    let builtin = exclude::path_to_key(&data_dir());
    let already_present = settings
        .excluded_paths
        .iter()
        .any(|p| exclude::path_to_key(Path::new(p)) == builtin);
    if !already_present {
        settings.excluded_paths.push(data_dir().to_string_lossy().to_string());
    }
}
