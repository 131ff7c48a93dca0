use crate::log::{LOG_ROTATION_KEEP, LOG_ROTATION_SIZE};
use crate::process::DEFAULT_KILL_TIMEOUT_MS;
use crate::site::{MirrorSite, ScheduleKind};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MainConfig {
    pub country: String,
    #[serde(default)]
    pub location: String,
    pub log_file_size: Option<u64>,
    pub log_file_count: Option<u32>,
    pub kill_timeout: Option<u64>,
}

impl MainConfig {
    pub fn log_file_size(&self) -> u64 {
        self.log_file_size.unwrap_or(LOG_ROTATION_SIZE)
    }

    pub fn log_file_count(&self) -> u32 {
        self.log_file_count.unwrap_or(LOG_ROTATION_KEEP)
    }

    pub fn kill_timeout_ms(&self) -> u64 {
        self.kill_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT_MS)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSiteConfig {
    master_dir: PathBuf,
    initializer: Option<PathBuf>,
    updater: Option<PathBuf>,
    maintainer: Option<PathBuf>,
    sched_type: ScheduleKind,
    sched_expr: String,
    #[serde(default)]
    config: Option<serde_json::Value>,
    #[serde(default)]
    storage: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    main: MainConfig,
    #[serde(default)]
    site: BTreeMap<String, RawSiteConfig>,
}

/// Loaded daemon configuration. Sites keep the file's key order (sorted by
/// id), which is also the order their scheduler jobs are registered in.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub main: MainConfig,
    pub sites: Vec<MirrorSite>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("config file is empty")]
    Empty,
    #[error("TOML parse error: {0}")]
    TomlParse(String),
    #[error("site `{0}`: id must be non-empty and contain only [A-Za-z0-9._-]")]
    InvalidSiteId(String),
    #[error("site `{site}`: {reason}")]
    InvalidSite { site: String, reason: String },
    #[error("{0}")]
    IoError(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Err(ConfigError::Empty);
    }

    let raw: RawConfig = toml::from_str(content).map_err(|e| ConfigError::TomlParse(e.to_string()))?;

    let mut sites = Vec::with_capacity(raw.site.len());
    for (id, site) in raw.site {
        if !valid_site_id(&id) {
            return Err(ConfigError::InvalidSiteId(id));
        }
        if site.initializer.is_none() && site.updater.is_none() && site.maintainer.is_none() {
            return Err(ConfigError::InvalidSite {
                site: id,
                reason: "no initializer, updater or maintainer configured".to_string(),
            });
        }
        if !site.master_dir.is_absolute() {
            return Err(ConfigError::InvalidSite {
                site: id,
                reason: format!("master_dir `{}` is not absolute", site.master_dir.display()),
            });
        }
        sites.push(MirrorSite {
            id,
            master_dir: site.master_dir,
            initializer: site.initializer,
            updater: site.updater,
            maintainer: site.maintainer,
            sched_type: site.sched_type,
            sched_expr: site.sched_expr,
            config: site
                .config
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            storage: site.storage,
        });
    }

    Ok(Config {
        main: raw.main,
        sites,
    })
}

// Ids become file names (logs, state dirs), so keep them path-safe.
fn valid_site_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
