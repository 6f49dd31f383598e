//! Application configuration.
//!
//! `Config` aggregates the logger, network link and cloud session settings.
//! It is read once from a TOML file at startup, validated, and treated as
//! immutable afterwards. The file location is taken from `CLOUDLINK_CONFIG`
//! or falls back to `/etc/cloudlink/config.toml`.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use validator::Validate;

use self::{logger::LoggerConfig, network::NetworkConfig, session::SessionConfig};

pub mod logger;
pub mod network;
pub mod session;

pub const CONFIG_ENV: &str = "CLOUDLINK_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cloudlink/config.toml";

#[doc(hidden)]
#[derive(Debug, Clone, Copy)]
pub enum EarlyLevel {
    Info,
    Warn,
    Error,
}

/// Writes a timestamped line to stdout. Used before the tracing subscriber exists.
#[doc(hidden)]
pub fn print_early(level: EarlyLevel, args: fmt::Arguments<'_>) {
    let ts = time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    let tag = match level {
        EarlyLevel::Info => console::style("INFO").green(),
        EarlyLevel::Warn => console::style("WARN").yellow(),
        EarlyLevel::Error => console::style("ERROR").red(),
    };
    println!("{}  {} {}", console::style(ts).dim(), tag, args);
}

#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        $crate::config::print_early($crate::config::EarlyLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        $crate::config::print_early($crate::config::EarlyLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        $crate::config::print_early($crate::config::EarlyLevel::Error, format_args!($($arg)*))
    };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Station link the device joins before any cloud traffic.
    #[validate(nested)]
    pub network: NetworkConfig,

    #[validate(nested)]
    pub session: SessionConfig,
}

impl Config {
    /// Locates and loads the configuration file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if no file is found or it cannot be read,
    /// parsed or validated.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load(&path)
    }

    fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(from_env) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(from_env);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found (set {} or create {})",
            CONFIG_ENV, DEFAULT_CONFIG_PATH
        )))
    }

    /// Loads and validates configuration from `path`.
    ///
    /// # Errors
    ///
    /// Propagates IO, parse and validation failures as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let raw = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }
}
