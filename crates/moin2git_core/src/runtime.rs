use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use crate::config::{DEFAULT_CONFIG_FILENAME, Moin2GitConfig, load_config};
use crate::fast_import::DEFAULT_BRANCH;
use crate::fetch_cache::DEFAULT_CACHE_DIR;
use crate::filesystem::WikiLayout;
use crate::translate::DEFAULT_URL_PREFIX;

pub const ENV_DATA_DIR: &str = "MOIN2GIT_DATA";
pub const ENV_USER_MAP: &str = "MOIN2GIT_USERS";
pub const ENV_CACHE_DIR: &str = "MOIN2GIT_CACHE";
pub const ENV_URL_PREFIX: &str = "MOIN2GIT_PREFIX";
pub const ENV_BRANCH: &str = "MOIN2GIT_BRANCH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ValueSource,
}

impl<T> Resolved<T> {
    fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct SettingOverrides {
    pub config: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub user_map: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub url_prefix: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub config_path: PathBuf,
    pub data_dir: Resolved<PathBuf>,
    pub user_map: Option<Resolved<PathBuf>>,
    pub cache_dir: Resolved<PathBuf>,
    pub url_prefix: Resolved<String>,
    pub branch: Resolved<String>,
    pub home_page: bool,
}

impl ResolvedSettings {
    pub fn layout(&self) -> WikiLayout {
        WikiLayout::new(self.data_dir.value.clone())
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "config_path={}\ndata_dir={} ({})\nuser_map={}\ncache_dir={} ({})\nurl_prefix={} ({})\nbranch={} ({})\nhome_page={}",
            normalize_for_display(&self.config_path),
            normalize_for_display(&self.data_dir.value),
            self.data_dir.source.as_str(),
            match &self.user_map {
                Some(map) => format!(
                    "{} ({})",
                    normalize_for_display(&map.value),
                    map.source.as_str()
                ),
                None => "<wiki user dir>".to_string(),
            },
            normalize_for_display(&self.cache_dir.value),
            self.cache_dir.source.as_str(),
            self.url_prefix.value,
            self.url_prefix.source.as_str(),
            self.branch.value,
            self.branch.source.as_str(),
            self.home_page
        )
    }
}

/// Resolve settings from flags, the process environment and the config file.
pub fn resolve_settings(overrides: &SettingOverrides) -> Result<ResolvedSettings> {
    let config_path = overrides
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
    let config = load_config(&config_path)?;
    resolve_settings_with(overrides, config_path, &config, |key| env::var(key).ok())
}

/// Precedence per value: flag > env > config > default.
pub fn resolve_settings_with(
    overrides: &SettingOverrides,
    config_path: PathBuf,
    config: &Moin2GitConfig,
    lookup_env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedSettings> {
    let env_value = |key: &str| {
        lookup_env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let data_dir = match pick(
        overrides.data_dir.clone(),
        env_value(ENV_DATA_DIR).map(PathBuf::from),
        config.source.data_dir.clone(),
    ) {
        Some(resolved) => resolved,
        None => bail!(
            "no wiki data directory given.\nUse --data-dir, set {ENV_DATA_DIR}, or add [source] data_dir to {}",
            normalize_for_display(&config_path)
        ),
    };
    if !data_dir.value.is_dir() {
        bail!(
            "wiki data directory does not exist: {} ({})",
            normalize_for_display(&data_dir.value),
            data_dir.source.as_str()
        );
    }

    let user_map = pick(
        overrides.user_map.clone(),
        env_value(ENV_USER_MAP).map(PathBuf::from),
        config.source.user_map.clone(),
    );
    let cache_dir = pick(
        overrides.cache_dir.clone(),
        env_value(ENV_CACHE_DIR).map(PathBuf::from),
        config.export.cache_dir.clone(),
    )
    .unwrap_or_else(|| Resolved::new(PathBuf::from(DEFAULT_CACHE_DIR), ValueSource::Default));
    let url_prefix = pick(
        overrides.url_prefix.clone(),
        env_value(ENV_URL_PREFIX),
        config.export.url_prefix.clone(),
    )
    .unwrap_or_else(|| Resolved::new(DEFAULT_URL_PREFIX.to_string(), ValueSource::Default));
    let branch = pick(
        overrides.branch.clone(),
        env_value(ENV_BRANCH),
        config.export.branch.clone(),
    )
    .unwrap_or_else(|| Resolved::new(DEFAULT_BRANCH.to_string(), ValueSource::Default));

    Ok(ResolvedSettings {
        config_path,
        data_dir,
        user_map,
        cache_dir,
        url_prefix,
        branch,
        home_page: config.export.home_page.unwrap_or(true),
    })
}

fn pick<T>(flag: Option<T>, env: Option<T>, config: Option<T>) -> Option<Resolved<T>> {
    flag.map(|value| Resolved::new(value, ValueSource::Flag))
        .or_else(|| env.map(|value| Resolved::new(value, ValueSource::Env)))
        .or_else(|| config.map(|value| Resolved::new(value, ValueSource::Config)))
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
