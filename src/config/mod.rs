//! Configuration types and default locations.
//!
//! Settings are provided by an external loader (or the thin JSON reader
//! here); the engine only consumes the resulting [`Settings`] value.

mod settings;

pub use settings::{
    DeliverySettings, EngineSettings, FeedSettings, ImapAuthKind, Settings, TargetSettings,
};

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file {path} unreadable: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {path} invalid: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("delivery '{delivery}' references unknown {kind} '{name}'")]
    DanglingReference {
        delivery: String,
        kind: &'static str,
        name: String,
    },

    #[error("no usable data directory on this system")]
    NoDataDir,

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },
}

/// Default data directory (`~/.local/share/loreferry` or platform
/// equivalent).
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("", "", "loreferry")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(ConfigError::NoDataDir)
}

/// Default config directory (`~/.config/loreferry` or platform equivalent).
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("", "", "loreferry")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or(ConfigError::NoDataDir)
}

impl Settings {
    /// Reads a settings document from a JSON file. A missing file yields
    /// default (empty) settings, so a fresh installation starts clean.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks cross-references: every delivery must name a configured feed
    /// and target.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, delivery) in &self.deliveries {
            if !self.feeds.contains_key(&delivery.feed) {
                return Err(ConfigError::DanglingReference {
                    delivery: name.clone(),
                    kind: "feed",
                    name: delivery.feed.clone(),
                });
            }
            if !self.targets.contains_key(&delivery.target) {
                return Err(ConfigError::DanglingReference {
                    delivery: name.clone(),
                    kind: "target",
                    name: delivery.target.clone(),
                });
            }
        }
        Ok(())
    }

    /// Resolves the effective data directory.
    pub fn resolve_data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }
}
