use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application config, loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server store file. Defaults to `<data dir>/prm/servers.json`.
    pub data_file: Option<PathBuf>,
    /// Preferences file. Defaults to `<config dir>/prm/preferences.toml`.
    pub preferences_file: Option<PathBuf>,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
}

impl AppConfig {
    /// Read the config at `path`, or `None` if there is no such file.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ConfigError::Read(path.to_path_buf(), e)),
        };
        check_config_permissions(path);
        toml::from_str(&contents)
            .map(Some)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    /// Like [`AppConfig::load`], with every setting defaulted when the file
    /// is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    pub fn data_file(&self) -> PathBuf {
        self.data_file
            .clone()
            .unwrap_or_else(|| app_dir(dirs::data_dir()).join("servers.json"))
    }

    pub fn preferences_file(&self) -> PathBuf {
        self.preferences_file
            .clone()
            .unwrap_or_else(|| app_dir(dirs::config_dir()).join("preferences.toml"))
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or("prm=info")
    }
}

fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.unwrap_or_else(|| PathBuf::from(".")).join("prm")
}

/// Default location of the config file: `<config dir>/prm/config.toml`.
pub fn default_config_path() -> PathBuf {
    app_dir(dirs::config_dir()).join("config.toml")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("invalid config {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
}

/// Warn if a config file is world-readable.
///
/// The config points at the server store, whose connection fields are only
/// sealed, not encrypted.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}); consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// True if `mode` has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
