use offline_sync::EngineConfig;
use std::path::{Path, PathBuf};

/// Daemon configuration assembled from an optional JSON file and the environment.
///
/// Command-line arguments are applied on top by the binary.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Directory holding the durable queue
    pub data_dir: PathBuf,
    /// WebSocket endpoint of the remote authority
    pub server_url: Option<String>,
    pub engine: EngineConfig,
}

impl DaemonConfig {
    /// Load configuration.
    ///
    /// Environment variables:
    /// - `OFFLINE_SYNC_DATA_DIR`: queue directory (default `./offline-sync`, supports `~`)
    /// - `OFFLINE_SYNC_WORKSPACE`: workspace the queue drains into
    /// - `OFFLINE_SYNC_SERVER`: WebSocket URL of the remote
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let text = match config_file {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?),
            None => None,
        };
        Self::from_sources(text.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build from file contents and an environment lookup.
    pub fn from_sources(
        file: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut engine = match file {
            Some(text) => EngineConfig::from_json(text)?,
            None => EngineConfig::default(),
        };

        if let Some(workspace) = env("OFFLINE_SYNC_WORKSPACE").filter(|w| !w.trim().is_empty()) {
            engine.sync.workspace_id = Some(workspace.trim().to_string());
        }

        let data_dir = env("OFFLINE_SYNC_DATA_DIR")
            .map(|dir| expand_tilde(&dir))
            .unwrap_or_else(|| PathBuf::from("offline-sync"));

        Ok(Self {
            data_dir,
            server_url: env("OFFLINE_SYNC_SERVER").filter(|s| !s.trim().is_empty()),
            engine,
        })
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    /// Lower-capacity store written while the queue directory is unusable.
    pub fn fallback_dir(&self) -> PathBuf {
        self.data_dir.join("fallback")
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Engine(#[from] offline_sync::ConfigError),
}
