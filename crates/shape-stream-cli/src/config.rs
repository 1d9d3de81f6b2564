//! Config file discovery for the CLI

use anyhow::{Context, Result};
use shape_stream_core::StreamConfig;
use std::path::{Path, PathBuf};

/// `<config dir>/shape-stream/config.toml`, if the platform has a config dir
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("shape-stream").join("config.toml"))
}

/// Load the stream config
///
/// An explicit path must exist. The default path is optional; without it the
/// built-in defaults apply. Environment overrides are applied last.
pub fn load(explicit: Option<&Path>) -> Result<StreamConfig> {
    let config = match explicit {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => match default_path().filter(|path| path.exists()) {
            Some(path) => StreamConfig::load(&path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => StreamConfig::default(),
        },
    };
    config
        .with_env_overrides()
        .context("applying environment overrides")
}
