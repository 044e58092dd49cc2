//! Executor Configuration System
//!
//! This module provides configuration management for the composition executor using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `COMPOSER_`
//! 2. TOML configuration file (default: `config/composer.toml`)
//!
//! # Environment Variables
//!
//! Nested keys are separated by a double underscore so that key names may keep
//! their own underscores:
//!
//! ```text
//! # Set log level
//! COMPOSER_APPLICATION__LOG_LEVEL=debug
//!
//! # Point at a different compilation service
//! COMPOSER_COMPILER__COMMAND=/opt/lab/bin/batch-compiler
//! ```

pub mod executor_config;

pub use executor_config::{
    ApplicationConfig, CompilerConfig, ConfigError, ExecutorConfig, SandboxConfig, StorageConfig,
};
