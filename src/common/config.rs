use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub fn config_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("strata")
        .join("config.toml")
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct OrganizerSettings {
    /// How long a temporary activity token issued for a cross-process reparent
    /// stays valid, in milliseconds.
    #[serde(default = "default_token_timeout_ms")]
    pub temporary_token_timeout_ms: u64,
    /// Upper bound on queued sync sets before new sync transactions are
    /// rejected.
    #[serde(default = "default_max_queued_syncs")]
    pub max_queued_syncs: usize,
    /// Upper bound on undelivered pending events per organizer.
    #[serde(default = "default_max_pending_events")]
    pub max_pending_events: usize,
}

fn default_token_timeout_ms() -> u64 { 5000 }
fn default_max_queued_syncs() -> usize { 64 }
fn default_max_pending_events() -> usize { 1024 }

impl Default for OrganizerSettings {
    fn default() -> Self {
        OrganizerSettings {
            temporary_token_timeout_ms: default_token_timeout_ms(),
            max_queued_syncs: default_max_queued_syncs(),
            max_pending_events: default_max_pending_events(),
        }
    }
}

impl OrganizerSettings {
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.temporary_token_timeout_ms == 0 {
            issues.push("temporary_token_timeout_ms must be non-zero".to_string());
        }
        if self.max_queued_syncs == 0 {
            issues.push("max_queued_syncs must be at least 1".to_string());
        }
        if self.max_pending_events == 0 {
            issues.push("max_pending_events must be at least 1".to_string());
        }
        issues
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub organizer: OrganizerSettings,
}

impl Config {
    pub fn read(path: &Path) -> anyhow::Result<Config> {
        let buf = std::fs::read_to_string(path)?;
        Self::parse(&buf)
    }

    pub fn parse(buf: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(buf)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, toml_string.as_bytes())?;
        Ok(())
    }

    /// Validates the entire configuration and returns a list of issues found.
    pub fn validate(&self) -> Vec<String> {
        self.organizer.validate()
    }
}
