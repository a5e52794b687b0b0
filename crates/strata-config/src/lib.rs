//! Configuration system for the Strata execution engine.
//!
//! Provides TOML-based configuration with:
//! - Typed sections for resources, recovery, navigation, tools and logging
//! - Config file layering (user config dir + project-local overrides)
//! - Explicit `--config` files that bypass discovery

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
