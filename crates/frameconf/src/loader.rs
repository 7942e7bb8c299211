//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, FrameConfig};
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns existing paths in load order (system, user, local). If `cli_path`
/// is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/framepipe/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("framepipe/config.toml");
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

    let local = PathBuf::from("framepipe.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load and layer the given files on top of compiled defaults.
///
/// Tables merge key by key, so a later file only needs the values it changes.
pub fn load_files(files: &[PathBuf]) -> Result<(FrameConfig, ConfigSources), ConfigError> {
    let mut sources = ConfigSources::default();
    let mut merged = toml::Table::new();
    let mut config = FrameConfig::default();

    for path in files {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        let table = parse_table(&contents, path)?;
        merge_tables(&mut merged, table);
        config = from_table(merged.clone(), path)?;
        sources.files.push(path.clone());
    }

    expand_config_paths(&mut config);
    Ok((config, sources))
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn from_table(table: toml::Table, path: &Path) -> Result<FrameConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`; nested tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn expand_config_paths(config: &mut FrameConfig) {
    config.paths.runtime_dir = expand_path(&config.paths.runtime_dir.to_string_lossy());
    if let Some(path) = config.paths.socket_path.take() {
        config.paths.socket_path = Some(expand_path(&path.to_string_lossy()));
    }
}

/// Apply environment variable overrides to config.
///
/// `lookup` is normally `std::env::var(..).ok()`; tests pass a map.
pub fn apply_env_overrides<F>(config: &mut FrameConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("FRAMEPIPE_RUNTIME_DIR") {
        config.paths.runtime_dir = expand_path(&v);
        sources.env_overrides.push("FRAMEPIPE_RUNTIME_DIR".to_string());
    } else if let Some(v) = lookup("XDG_RUNTIME_DIR") {
        // the default runtime dir already comes from here
        if config.paths.runtime_dir == Path::new(&v) {
            sources.env_overrides.push("XDG_RUNTIME_DIR".to_string());
        }
    }
    if let Some(v) = lookup("FRAMEPIPE_SOCKET_PATH") {
        config.paths.socket_path = Some(expand_path(&v));
        sources.env_overrides.push("FRAMEPIPE_SOCKET_PATH".to_string());
    }

    if let Some(v) = lookup("FRAMEPIPE_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("FRAMEPIPE_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Some(v) = lookup("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Some(v) = lookup("FRAMEPIPE_KEYFRAME_INTERVAL_MS") {
        if let Ok(ms) = v.parse() {
            config.pipeline.keyframe_interval_ms = ms;
            sources.env_overrides.push("FRAMEPIPE_KEYFRAME_INTERVAL_MS".to_string());
        }
    }
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
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = std::env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            std::env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
