use std::fmt;
use std::path::{Path, PathBuf};

use super::types::EngineConfig;
use crate::error::{DdbError, Result};

/// How `ddbctl` found its configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    Flag,
    Env,
    /// One of [`default_config_search_paths`]; carries its scope label.
    Search(&'static str),
}

/// A located configuration file.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
    pub origin: ConfigOrigin,
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let how = match self.origin {
            ConfigOrigin::Flag => "--config",
            ConfigOrigin::Env => CONFIG_ENV,
            ConfigOrigin::Search(scope) => scope,
        };
        write!(f, "{} ({how})", self.path.display())
    }
}

const CONFIG_ENV: &str = "DDB_CONFIG";

/// Candidate config files, most specific first.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let mut candidates = vec![(PathBuf::from("ddb.yaml"), "working directory")];
    if cfg!(unix) {
        candidates.push((PathBuf::from("/etc/ddb/config.yaml"), "system"));
    }
    candidates
}

/// `--config` wins over `$DDB_CONFIG`, which wins over the search list.
pub fn resolve_config_path(flag: Option<&str>) -> Option<ConfigSource> {
    let explicit = flag
        .map(|p| (p.to_string(), ConfigOrigin::Flag))
        .or_else(|| {
            std::env::var(CONFIG_ENV)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (v, ConfigOrigin::Env))
        });
    if let Some((path, origin)) = explicit {
        return Some(ConfigSource {
            path: PathBuf::from(path),
            origin,
        });
    }

    default_config_search_paths()
        .into_iter()
        .find(|(path, _)| path.exists())
        .map(|(path, scope)| ConfigSource {
            path,
            origin: ConfigOrigin::Search(scope),
        })
}

/// Load, validate, and anchor a YAML config file.
///
/// Relative paths inside the file are resolved against the directory that
/// contains it, so the engine behaves the same regardless of the caller's cwd.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        DdbError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    let mut config = parse_config(&raw)?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    anchor(&mut config.paths.index_root, base);
    anchor(&mut config.paths.backup_dir, base);
    if let Some(ledger) = config.paths.ledger.as_mut() {
        anchor(ledger, base);
    }

    Ok(config)
}

pub(crate) fn parse_config(raw: &str) -> Result<EngineConfig> {
    let config: EngineConfig = if raw.trim().is_empty() {
        EngineConfig::default()
    } else {
        serde_yaml::from_str(raw)
            .map_err(|e| DdbError::Config(format!("invalid config: {e}")))?
    };
    config.validate()?;
    Ok(config)
}

fn anchor(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}
