// ABOUTME: Configuration loading and validation for the statekeep CLI.
// ABOUTME: Reads environment variables, which command-line flags may then override.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("STATEKEEP_BACKEND must be 'file' or 'sqlite', got: {0}")]
    InvalidBackend(String),

    #[error("STATEKEEP_MAX_AGE_MS is not a whole number of milliseconds: {0}")]
    InvalidMaxAge(String),
}

/// Which storage backend the CLI opens under the home directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// One file per key under `<home>/state`
    File,
    /// A single database at `<home>/state.db`
    Sqlite,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(ConfigError::InvalidBackend(s.to_string())),
        }
    }
}

/// CLI configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct StatekeepConfig {
    pub home: PathBuf,
    pub backend: Backend,
    pub buster: Option<String>,
    pub max_age: Option<Duration>,
}

impl StatekeepConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - STATEKEEP_HOME: data directory (default: ~/.statekeep)
    /// - STATEKEEP_BACKEND: `file` or `sqlite` (default: file)
    /// - STATEKEEP_BUSTER: version tag for written and accepted records (optional)
    /// - STATEKEEP_MAX_AGE_MS: expiry in milliseconds, 0 never expires (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("STATEKEEP_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".statekeep")
            });

        let backend = match std::env::var("STATEKEEP_BACKEND") {
            Ok(value) if !value.is_empty() => value.parse()?,
            _ => Backend::File,
        };

        let buster = std::env::var("STATEKEEP_BUSTER").ok().filter(|b| !b.is_empty());

        let max_age = match std::env::var("STATEKEEP_MAX_AGE_MS") {
            Ok(value) if !value.is_empty() => {
                let millis: u64 = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidMaxAge(value.clone()))?;
                Some(Duration::from_millis(millis))
            }
            _ => None,
        };

        Ok(Self {
            home,
            backend,
            buster,
            max_age,
        })
    }

    /// Where the file backend keeps its values.
    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }

    /// Where the SQLite backend keeps its database.
    pub fn database_path(&self) -> PathBuf {
        self.home.join("state.db")
    }
}
