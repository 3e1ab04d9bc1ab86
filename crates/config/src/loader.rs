use std::path::{Path, PathBuf};

use tracing::{debug, warn};

#[cfg(feature = "metrics")]
use conveyor_metrics::{config as config_metrics, counter, labels};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::ConveyorConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "conveyor.toml",
    "conveyor.yaml",
    "conveyor.yml",
    "conveyor.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<ConveyorConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    let result = parse_config(&raw, path);

    #[cfg(feature = "metrics")]
    counter!(config_metrics::LOADS_TOTAL, labels::SUCCESS => result.is_ok().to_string())
        .increment(1);

    result
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./conveyor.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/conveyor/conveyor.{toml,yaml,yml,json}` (user-global)
///
/// Returns `ConveyorConfig::default()` if no config file is found.
pub fn discover_and_load() -> ConveyorConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    ConveyorConfig::default()
}

/// Find the first config file in standard locations.
pub(crate) fn find_config_file() -> Option<PathBuf> {
    find_in(Path::new(".")).or_else(|| config_dir().and_then(|dir| find_in(&dir)))
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Returns the user-global config directory (`~/.config/conveyor/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "conveyor").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<ConveyorConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => Err(Error::UnsupportedFormat {
            extension: ext.to_string(),
        }),
    }
}
