//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, ThreadConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/threadtiles/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("threadtiles/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("threadtiles.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a config file as a raw TOML table.
///
/// The table is also deserialized on its own so type errors are reported
/// against the file that contains them.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    from_table(table.clone(), path)?;
    Ok(table)
}

/// Deserialize a (possibly merged) table, filling gaps with defaults and
/// expanding `~` in paths.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<ThreadConfig, ConfigError> {
    let mut config: ThreadConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    config.paths.data_dir = expand_path(&config.paths.data_dir.to_string_lossy());
    if let Some(tile_dir) = config.paths.tile_dir.take() {
        config.paths.tile_dir = Some(expand_path(&tile_dir.to_string_lossy()));
    }
    Ok(config)
}

/// Merge `overlay` into `base` key by key. Nested tables merge recursively;
/// any other value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(overlay_section) => {
                if let Some(toml::Value::Table(base_section)) = base.get_mut(&key) {
                    merge_tables(base_section, overlay_section);
                    continue;
                }
                base.insert(key, toml::Value::Table(overlay_section));
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(
    name: &str,
    sources: &mut ConfigSources,
    apply: impl FnOnce(T),
) {
    if let Ok(v) = env::var(name) {
        if let Ok(parsed) = v.trim().parse() {
            apply(parsed);
            sources.env_overrides.push(name.to_string());
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut ThreadConfig, sources: &mut ConfigSources) {
    // Paths
    if let Ok(v) = env::var("THREADTILES_DATA_DIR") {
        config.paths.data_dir = expand_path(&v);
        sources.env_overrides.push("THREADTILES_DATA_DIR".to_string());
    }
    if let Ok(v) = env::var("THREADTILES_TILE_DIR") {
        config.paths.tile_dir = Some(expand_path(&v));
        sources.env_overrides.push("THREADTILES_TILE_DIR".to_string());
    }

    // Bind
    if let Ok(v) = env::var("THREADTILES_HTTP_HOST") {
        config.bind.host = v;
        sources.env_overrides.push("THREADTILES_HTTP_HOST".to_string());
    }
    env_parse("THREADTILES_HTTP_PORT", sources, |port| {
        config.bind.http_port = port
    });

    // Telemetry
    if let Ok(v) = env::var("THREADTILES_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = v;
        sources.env_overrides.push("THREADTILES_OTLP_ENDPOINT".to_string());
    }
    // Also support standard OTEL env var
    if let Ok(v) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = v;
        sources.env_overrides.push("OTEL_EXPORTER_OTLP_ENDPOINT".to_string());
    }
    if let Ok(v) = env::var("THREADTILES_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("THREADTILES_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    // Processing
    env_parse("THREADTILES_IDLE_TIMEOUT_SECS", sources, |secs| {
        config.sessions.idle_timeout_secs = secs
    });
    env_parse("THREADTILES_JOB_TIMEOUT_SECS", sources, |secs| {
        config.jobs.timeout_secs = secs
    });
    env_parse("THREADTILES_TILE_SIZE", sources, |size| {
        config.pyramid.tile_size = size
    });
    env_parse("THREADTILES_TILE_FORMAT", sources, |format| {
        config.pyramid.format = format
    });
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
