use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::PLACEHOLDER_REPORTER;

/// Directory under the desk root that holds the store and config.
pub const SITREP_DIR: &str = ".sitrep";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub view: ViewConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Delay between a confirmed RESOLVED and the automatic COMPLETED.
    #[serde(default = "default_archive_delay_ms")]
    pub delay_ms: u64,
    /// Also schedule archival when the feed (not this desk) resolves a record.
    #[serde(default = "default_true")]
    pub follow_feed: bool,
}

impl ArchiveConfig {
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_archive_delay_ms(),
            follow_feed: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u8,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            critical_threshold: default_critical_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default = "default_placeholder_name")]
    pub placeholder_name: String,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            placeholder_name: default_placeholder_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub engine: EngineConfig,
    pub user: UserConfig,
    pub resolved_output: String,
}

/// Path of the desk-level config file under `root`.
#[must_use]
pub fn config_path(root: &Path) -> PathBuf {
    root.join(SITREP_DIR).join("config.toml")
}

pub fn load_engine_config(root: &Path) -> Result<EngineConfig> {
    let path = config_path(root);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<EngineConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };

    let path = config_dir.join("sitrep/config.toml");
    if !path.exists() {
        return Ok(UserConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<UserConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn resolve_config(root: &Path, cli_json: bool) -> Result<EffectiveConfig> {
    let engine = load_engine_config(root)?;
    let user = load_user_config()?;

    let env_format = env::var("FORMAT").ok();
    let resolved_output = resolve_output(cli_json, user.output.as_deref(), env_format.as_deref());

    Ok(EffectiveConfig {
        engine,
        user,
        resolved_output,
    })
}

fn resolve_output(cli_json: bool, user_output: Option<&str>, env_format: Option<&str>) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some("pretty"),
            "text" | "table" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if let Some(mode) = user_output.and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if std::io::stdout().is_terminal() {
        "pretty".to_string()
    } else {
        "text".to_string()
    }
}

const fn default_true() -> bool {
    true
}

const fn default_page_size() -> u32 {
    8
}

const fn default_archive_delay_ms() -> u64 {
    2_000
}

const fn default_critical_threshold() -> u8 {
    4
}

fn default_placeholder_name() -> String {
    PLACEHOLDER_REPORTER.to_string()
}
