use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::log::LogLevel;
use crate::orchestration::{AgentLoopConfig, PlannerConfig, SwarmConfig};
use crate::{tlog_debug, Error, Result};

/// On-disk configuration, read from `~/.taskforge/taskforge.toml`.
///
/// Every section and field is optional; missing values take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Log level name ("error" through "trace"). `--debug` overrides it.
    pub log_level: Option<String>,
    pub planner: PlannerConfig,
    pub agent_loop: AgentLoopConfig,
    pub swarm: SwarmConfig,
}

impl Config {
    pub fn taskforge_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".taskforge"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::taskforge_dir()?.join("taskforge.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path()?)
    }

    /// Load from an explicit path. A missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            tlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tlog_debug!(
            "Config loaded: max_nodes={}, max_turns={}, max_concurrency={}",
            config.planner.max_nodes,
            config.agent_loop.max_turns,
            config.swarm.max_concurrency
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Write the config as pretty TOML, creating parent directories.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tlog_debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// The configured log level, if one is set and recognised.
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level.as_deref().and_then(LogLevel::parse)
    }

    fn validate(&self) -> Result<()> {
        if let Some(name) = &self.log_level {
            if LogLevel::parse(name).is_none() {
                return Err(Error::Validation(format!("unknown log level: {}", name)));
            }
        }
        if !(0.0..=1.0).contains(&self.agent_loop.confidence_threshold) {
            return Err(Error::Validation(format!(
                "agent_loop.confidence_threshold must be within 0..=1, got {}",
                self.agent_loop.confidence_threshold
            )));
        }
        if self.agent_loop.max_turns == 0 {
            return Err(Error::Validation("agent_loop.max_turns must be at least 1".to_string()));
        }
        if self.swarm.max_concurrency == 0 {
            return Err(Error::Validation(
                "swarm.max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
