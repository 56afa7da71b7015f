//! Configuration loading and saving utilities.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::warn;

use crate::config::schema::Config;
use crate::utils::helpers::get_data_path;

/// Environment variable that points at an alternative config file.
pub const CONFIG_ENV: &str = "LEADBOT_CONFIG";

/// Get the configuration file path: `$LEADBOT_CONFIG`, else
/// `~/.leadbot/config.json`.
pub fn get_config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(p) if !p.is_empty() => PathBuf::from(p),
        _ => get_data_path().join("config.json"),
    }
}

/// Load configuration from a file, or return a default [`Config`] if the file
/// does not exist or cannot be parsed.
///
/// If `config_path` is `None`, [`get_config_path`] is used.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path(),
    };

    if path.exists() {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Config>(&contents) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        "Failed to parse config from {}: {}. Using default configuration.",
                        path.display(),
                        e
                    );
                }
            },
            Err(e) => {
                warn!(
                    "Failed to read config from {}: {}. Using default configuration.",
                    path.display(),
                    e
                );
            }
        }
    }

    Config::default()
}

/// Save configuration to a JSON file, creating parent directories.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> anyhow::Result<PathBuf> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path(),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(&path, json).with_context(|| format!("writing config to {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(Some(&dir.path().join("missing.json")));
        assert_eq!(cfg.funnel.batch_wait_secs, 60);
    }

    #[test]
    fn test_load_invalid_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let cfg = load_config(Some(&path));
        assert_eq!(cfg.agents.defaults.model, "gemini-flash-latest");
    }

    #[test]
    fn test_load_and_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_path = dir.path().join("nested").join("config.json");

        let mut cfg = Config::default();
        cfg.funnel.confidence_threshold = 0.85;
        cfg.providers.gemini.api_key = "test-key".into();
        let written = save_config(&cfg, Some(&tmp_path)).unwrap();
        assert_eq!(written, tmp_path);

        let loaded = load_config(Some(&tmp_path));
        assert_eq!(loaded.funnel.confidence_threshold, 0.85);
        assert_eq!(loaded.providers.gemini.api_key, "test-key");
    }
}
