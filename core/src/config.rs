//! Configuration loading and management.
//! Uses injected `AppPaths` so platform shells control where files live.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::platform::AppPaths;
use crate::runner::SystemCommandRunner;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between scheduled polls.
    pub refresh_time: u64,
    pub command: String,
    pub args: Vec<String>,
    /// Seconds a single status query may take.
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Config {
    /// Load configuration from the provided paths. Creates a default file if missing.
    pub fn load_with(paths: &dyn AppPaths) -> Result<Self> {
        let config_path = paths.config_path();

        if !config_path.exists() {
            info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let default_config = Self::default();
            default_config.save_with(paths)?;
            return Ok(default_config);
        }

        debug!("Loading config from {:?}", config_path);
        let content = fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        info!(
            "Loaded config: `{}` every {}s",
            config.argv().join(" "),
            config.refresh_time
        );
        Ok(config)
    }

    /// Save configuration to the provided paths.
    pub fn save_with(&self, paths: &dyn AppPaths) -> Result<()> {
        let config_path = paths.config_path();

        // Create the directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.refresh_time == 0 {
            return Err(Error::Config("refresh_time must be positive".to_string()));
        }
        if self.timeout == 0 {
            return Err(Error::Config("timeout must be positive".to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(Error::Config("command must not be empty".to_string()));
        }
        Ok(())
    }

    /// Full command line of the status query.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Runner that spawns with the configured PATH prefix.
    pub fn runner(&self) -> SystemCommandRunner {
        SystemCommandRunner::with_path(self.path.clone())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_time: 10,
            command: "mullvad".to_string(),
            args: vec!["status".to_string()],
            timeout: 5,
            path: None,
        }
    }
}
