//! Executor configuration using Figment
//!
//! This module provides strongly-typed configuration loading for the composition executor.
//! Configuration is loaded from:
//! 1. composer.toml file (base configuration, optional)
//! 2. Environment variables (prefixed with COMPOSER_, nested keys split on `__`)
//!
//! Every field has a default, so an empty or missing file yields a runnable setup.
//!
//! # Example
//!
//! ```no_run
//! use shot_composer::config::ExecutorConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ExecutorConfig::load()?;
//!     println!("Application: {}", config.application.name);
//!     println!("Compiler: {}", config.compiler.command);
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level executor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Script sandbox settings
    pub sandbox: SandboxConfig,
    /// Compilation service settings
    pub compiler: CompilerConfig,
    /// Shot file settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Process name used in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty or json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Script sandbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Maximum Rhai operations per run (0 = unlimited)
    #[serde(default)]
    pub max_operations: u64,
    /// Directories searched by `import` statements, watched for hot-reload
    #[serde(default)]
    pub module_dirs: Vec<PathBuf>,
}

/// Compilation service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Executable of the compilation service
    #[serde(default = "default_compiler_command")]
    pub command: String,
    /// Extra arguments passed to the compilation service
    #[serde(default)]
    pub args: Vec<String>,
}

/// Shot file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Extension used for prepared shots when the template file has none
    #[serde(default = "default_extension")]
    pub default_extension: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            command: default_compiler_command(),
            args: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_extension: default_extension(),
        }
    }
}

fn default_name() -> String {
    "composition_executor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_compiler_command() -> String {
    "batch_compiler".to_string()
}

fn default_extension() -> String {
    "h5".to_string()
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ExecutorConfig {
    /// Load configuration from config/composer.toml and environment variables
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the sources cannot be merged or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/composer.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("COMPOSER_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Log format is valid (pretty, json)
    /// - Compiler command is not empty
    /// - Default extension is not empty and has no leading dot
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.compiler.command.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Compiler 'command' cannot be empty".to_string(),
            ));
        }

        let ext = &self.storage.default_extension;
        if ext.is_empty() || ext.starts_with('.') {
            return Err(ConfigError::ValidationError(format!(
                "Invalid default_extension '{}'. Use a bare extension such as 'h5'",
                ext
            )));
        }

        Ok(())
    }
}
