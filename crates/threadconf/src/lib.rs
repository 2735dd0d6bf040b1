//! Configuration loading for threadtiles.
//!
//! Configuration is split into two groups:
//!
//! - **Infrastructure** (`paths`, `bind`, `telemetry`): where things live and
//!   where the server listens.
//! - **Processing** (`sessions`, `stitch`, `pyramid`, `jobs`): limits and
//!   tuning for capture sessions and the stitch pipeline.
//!
//! # Usage
//!
//! ```rust,no_run
//! use threadconf::ThreadConfig;
//!
//! let config = ThreadConfig::load().expect("Failed to load config");
//! println!("tiles at {}", config.paths.tile_dir().display());
//! println!("listening on {}", config.bind.addr());
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, key by key):
//! 1. `/etc/threadtiles/config.toml` (system)
//! 2. `~/.config/threadtiles/config.toml` (user)
//! 3. `./threadtiles.toml` (local override, replaced by `--config`)
//! 4. Environment variables (`THREADTILES_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! data_dir = "~/.local/share/threadtiles"
//!
//! [bind]
//! host = "0.0.0.0"
//! http_port = 8090
//!
//! [telemetry]
//! otlp_endpoint = "127.0.0.1:4317"
//! log_level = "info,threadtiles=debug"
//!
//! [sessions]
//! idle_timeout_secs = 600
//!
//! [pyramid]
//! tile_size = 512
//! format = "jpeg"
//! ```

pub mod infra;
pub mod loader;
pub mod processing;

pub use infra::{BindConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};
pub use processing::{JobsConfig, PyramidConfig, SessionsConfig, StitchConfig, TileFormat};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to render configuration: {0}")]
    Render(String),
}

/// Complete threadtiles configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThreadConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub stitch: StitchConfig,

    #[serde(default)]
    pub pyramid: PyramidConfig,

    #[serde(default)]
    pub jobs: JobsConfig,
}

impl ThreadConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/threadtiles/config.toml`
    /// 3. `~/.config/threadtiles/config.toml`
    /// 4. `./threadtiles.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Like [`ThreadConfig::load`], with `config_path` replacing the local
    /// `./threadtiles.toml` override.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report where it came from.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged, Path::new("<merged>"))?;
        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pyramid.validate().map_err(ConfigError::Invalid)?;

        if self.sessions.max_frames == 0 {
            return Err(ConfigError::Invalid("sessions.max_frames must be positive".into()));
        }
        if self.stitch.row_step == 0 || self.stitch.col_step == 0 {
            return Err(ConfigError::Invalid(
                "stitch.row_step and stitch.col_step must be positive".into(),
            ));
        }
        if self.sessions.max_request_bytes < self.sessions.max_frame_bytes {
            return Err(ConfigError::Invalid(
                "sessions.max_request_bytes must be at least sessions.max_frame_bytes".into(),
            ));
        }
        Ok(())
    }

    /// Serialize the effective config to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let body = toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))?;
        Ok(format!("# threadtiles configuration\n\n{body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ThreadConfig::default();
        assert_eq!(config.bind.http_port, 8090);
        assert_eq!(config.pyramid.tile_size, 256);
        assert_eq!(config.pyramid.overlap, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml() {
        let config = ThreadConfig::default();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("[stitch]"));
        assert!(toml.contains("format = \"png\""));
    }

    #[test]
    fn test_validate_rejects_small_request_limit() {
        let mut config = ThreadConfig::default();
        config.sessions.max_request_bytes = 1024;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
