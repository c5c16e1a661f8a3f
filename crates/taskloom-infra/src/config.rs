//! Worker configuration loader.
//!
//! Reads `taskloom.toml` and deserializes it into [`WorkerConfig`]. Falls back
//! to defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use taskloom_types::config::WorkerConfig;

/// File name looked up in the data directory.
pub const CONFIG_FILE_NAME: &str = "taskloom.toml";

/// The data directory: `TASKLOOM_DATA_DIR`, else `~/.taskloom`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var("TASKLOOM_DATA_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".taskloom")
        }
    }
}

/// `{data_dir}/taskloom.toml`.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join(CONFIG_FILE_NAME)
}

/// Load worker configuration from `path`.
///
/// - Missing file: [`WorkerConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
/// - `slots` is raised to at least 1.
pub async fn load_worker_config(path: &Path) -> WorkerConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return WorkerConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return WorkerConfig::default();
        }
    };

    let mut config = match toml::from_str::<WorkerConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            return WorkerConfig::default();
        }
    };
    if config.slots == 0 {
        tracing::warn!("slots = 0 in {}, using 1", path.display());
        config.slots = 1;
    }
    config
}
