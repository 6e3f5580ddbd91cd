pub mod config;
pub mod parse;
pub mod run;
pub mod serve;

use anyhow::Context;
use std::path::Path;
use timekeeper_core::config::Config;

/// Load the config at `path`, defaults when the file is absent.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load_or_default(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

/// As [`load_config`], refusing configs with error-level warnings.
pub fn load_validated(path: &Path) -> anyhow::Result<Config> {
    Config::load_validated(path)
        .with_context(|| format!("invalid config at {}", path.display()))
}
