use crate::config::types::{Config, DEFAULT_CONFIG_PATH};
use crate::ipc;
use crate::utils::path::corrupted_backup_path;
use crate::utils::validation::is_empty_or_whitespace;
use anyhow::Result;
use log::{debug, error, trace, warn};
use std::path::Path;

impl Config {
    /// Resolve the config path from a command line argument or running instance
    pub async fn resolve_config_path(arg: Option<String>) -> String {
        #[allow(clippy::collapsible_if)]
        if let Some(s) = arg {
            if !is_empty_or_whitespace(&s) {
                return s;
            }
        }
        if let Some(instance) = ipc::get_running_instance().await {
            return instance.config_path;
        }
        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load configuration from a file, writing a default one if it is missing or corrupted
    pub async fn try_load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from: {}", path.display());
        let config = match Self::read(path).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!("Config file not found, using default config");
                Self::save_default(path).await?;
                Self::default_at(path)
            }
            Err(e) => {
                error!("Failed to parse config file: {}", e);
                // Move the corrupted config file to a backup
                let backup_path = corrupted_backup_path(path);
                std::fs::rename(path, &backup_path)?;
                warn!("Config file corrupted, moved to {} and using default config", backup_path.display());
                Self::save_default(path).await?;
                Self::default_at(path)
            }
        };
        trace!("Loaded config: {:#?}", config);
        Ok(config)
    }

    /// Read and parse a config file. `Ok(None)` when the file does not exist.
    pub async fn read(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(path).await?;
        let mut config = serde_json::from_str::<Config>(&content)?;
        config.path = path.to_owned();
        Ok(Some(config))
    }

    /// Save the current configuration to its file
    pub async fn save(&self) -> Result<()> {
        debug!("Saving config to: {}", self.path.display());
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    /// Blocking variant of [`Config::save`] for callers that cannot await
    pub fn save_blocking(&self) -> Result<()> {
        debug!("Saving config to: {}", self.path.display());
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    /// Save a default configuration to the specified path
    pub async fn save_default(path: impl AsRef<Path>) -> Result<()> {
        debug!("Saving default config to: {}", path.as_ref().display());
        Self::default_at(path.as_ref()).save().await?;
        Ok(())
    }

    // Default settings bound to exactly `path`, without forcing the .json extension
    fn default_at(path: &Path) -> Self {
        let mut config = Self::new(path);
        config.path = path.to_owned();
        config
    }
}
