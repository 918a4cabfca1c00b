use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use tyk_migrate::MigrateConfig;

pub const CONFIG_FILE_NAME: &str = "tyk-migrate.toml";

/// Resolved configuration for one invocation
pub struct RunContext {
    /// Config file the settings were read from, if any
    pub config_path: Option<PathBuf>,
    pub config: MigrateConfig,
}

impl RunContext {
    /// Load `explicit` if given, otherwise search the current directory and its ancestors
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let current_dir = std::env::current_dir().context("Failed to get current directory")?;
                Self::find_from(&current_dir)
            }
        }
    }

    /// Use the nearest config file at or above `start`, or defaults when there is none
    pub fn find_from(start: &Path) -> Result<Self> {
        match Self::find_config_file(start) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self {
                config_path: None,
                config: MigrateConfig::default(),
            }),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config = MigrateConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        Ok(Self {
            config_path: Some(path.to_path_buf()),
            config,
        })
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut current = start.to_path_buf();
        loop {
            let candidate = current.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !current.pop() {
                return None;
            }
        }
    }

    pub fn describe_source(&self) -> String {
        match &self.config_path {
            Some(path) => path.display().to_string(),
            None => "defaults".to_string(),
        }
    }
}
