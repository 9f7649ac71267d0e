//! Configuration system for the Strata memory subsystem.
//!
//! Provides TOML-based configuration with:
//! - Backend declarations (`[backends.<name>]`) and memory-type routing
//! - Cache, router, retry and sync tuning sections
//! - Recovery and logging sections
//! - Layered discovery (user config, then project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigLayer, Discovered, Discovery, LayerOutcome, LayerReport, data_dir, read_config_file,
    user_config_dir, write_config_file,
};
pub use error::{ConfigError, Result};
pub use types::*;
