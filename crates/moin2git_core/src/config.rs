use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = "moin2git.toml";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Moin2GitConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub export: ExportSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub data_dir: Option<PathBuf>,
    pub user_map: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ExportSection {
    pub url_prefix: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub branch: Option<String>,
    pub home_page: Option<bool>,
}

/// Load and parse a config from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<Moin2GitConfig> {
    if !config_path.exists() {
        return Ok(Moin2GitConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: Moin2GitConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
