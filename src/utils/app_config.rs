/// Application configuration management
/// Stores user preferences in ~/.config/ncops-cli/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding docker-compose.yml and .env
    pub deployment_dir: Option<String>,
}

impl AppConfig {
    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine the user config directory")?
            .join("ncops-cli");

        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Set and save the deployment directory
    pub fn set_deployment_dir(&mut self, dir: PathBuf) -> Result<()> {
        self.deployment_dir = Some(dir.to_string_lossy().to_string());
        self.save()
    }
}

/// Locate the deployment directory (where docker-compose.yml lives).
///
/// Checks the current directory and its parents first, then the saved
/// configuration. A hit found by searching is remembered for next time.
pub fn find_deployment_dir() -> Result<PathBuf> {
    let current = std::env::current_dir().context("Failed to get current directory")?;

    let mut dir = current.as_path();
    loop {
        if dir.join(super::constants::DEFAULT_COMPOSE_FILE).exists() {
            if let Ok(mut config) = AppConfig::load() {
                let _ = config.set_deployment_dir(dir.to_path_buf());
            }
            return Ok(dir.to_path_buf());
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }

    if let Ok(config) = AppConfig::load() {
        if let Some(saved) = config.deployment_dir {
            let path = PathBuf::from(&saved);
            if path.join(super::constants::DEFAULT_COMPOSE_FILE).exists() {
                return Ok(path);
            }
        }
    }

    anyhow::bail!(
        "Could not find a docker-compose.yml in {} or any parent directory.\n\
         Run ncops-cli from the deployment directory once so it can be remembered.",
        current.display()
    )
}
