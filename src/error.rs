//! Error types shared across the proxy core and its collaborators.
//!
//! Mirrors the teacher crate's style: plain enums with manual `Display`/`Error`
//! impls rather than a derive-macro crate, since no part of this codebase
//! needs more than a handful of error variants.

use std::fmt;
use std::path::PathBuf;

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidSeedUser(String),
    InvalidListenAddr(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidSeedUser(s) => {
                write!(f, "invalid --seed-user value '{s}', expected user:pass[:role]")
            }
            ConfigError::InvalidListenAddr(s) => write!(f, "invalid listen address '{s}'"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Fatal errors that abort the process during startup.
///
/// Returned from setup code and reported with exit code 1.
#[derive(Debug)]
pub enum SetupError {
    Io(std::io::Error),
    Config(ConfigError),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Io(e) => write!(f, "setup error: {e}"),
            SetupError::Config(e) => write!(f, "setup error: {e}"),
        }
    }
}

impl std::error::Error for SetupError {}

impl From<std::io::Error> for SetupError {
    fn from(e: std::io::Error) -> Self {
        SetupError::Io(e)
    }
}

impl From<ConfigError> for SetupError {
    fn from(e: ConfigError) -> Self {
        SetupError::Config(e)
    }
}
