use dirs::{cache_dir, config_dir, home_dir};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_DIR: &str = "devlog";
const SESSION_STATE_FILE: &str = "active-session.json";
const WRAPPERS_DIR: &str = "wrappers";

pub const CACHE_DIR_ENV: &str = "DEVLOG_CACHE_DIR";
pub const HOST_BINARY_ENV: &str = "DEVLOG_HOST_BINARY";
pub const HOST_BINARY_NAME: &str = "devlog-host";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to get executable path: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("devlog-host binary not found in {dir} (searched for: {names})")]
    HostBinaryNotFound { dir: PathBuf, names: String },
}

/// Filesystem roots everything else is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Per-user application config root; browsers keep their
    /// native-messaging directories underneath it.
    pub config_dir: PathBuf,
    /// Where devlog keeps its own state (session record, wrappers).
    pub cache_dir: PathBuf,
    pub host_binary: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        // 1. Explicit override
        let cache = env::var_os(CACHE_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            // 2. Platform cache dir
            .or_else(|| cache_dir().map(|dir| dir.join(APP_DIR)))
            // 3. Temp dir as a last resort
            .unwrap_or_else(|| env::temp_dir().join(APP_DIR));

        let config = config_dir()
            .or_else(|| home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("/"));

        let host_binary = env::var_os(HOST_BINARY_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Config {
            config_dir: config,
            cache_dir: cache,
            host_binary,
        }
    }

    pub fn with_roots(config_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Config {
            config_dir: config_dir.into(),
            cache_dir: cache_dir.into(),
            host_binary: None,
        }
    }

    pub fn session_state_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_STATE_FILE)
    }

    pub fn wrappers_dir(&self) -> PathBuf {
        self.cache_dir.join(WRAPPERS_DIR)
    }

    /// The stable host binary: the override if set, otherwise `devlog-host`
    /// sitting next to the running executable.
    pub fn host_binary(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.host_binary {
            return Ok(path.clone());
        }

        let exe = env::current_exe().map_err(ConfigError::CurrentExe)?;
        let dir = exe.parent().unwrap_or_else(|| Path::new("."));
        find_host_binary_in(dir)
    }
}

pub fn find_host_binary_in(dir: &Path) -> Result<PathBuf, ConfigError> {
    let mut names = vec![HOST_BINARY_NAME.to_string()];
    if cfg!(windows) {
        names.push(format!("{}.exe", HOST_BINARY_NAME));
    }

    names
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| ConfigError::HostBinaryNotFound {
            dir: dir.to_path_buf(),
            names: names.join(", "),
        })
}
