// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

use std::path::Path;

use powqueue_core::{Config, ConfigLoader};

pub mod destroy;
pub mod serve;
pub mod status;
pub mod submit;
pub mod validate;

/// Load the configuration file if present, else the built-in defaults.
///
/// A file that exists but fails validation is an error.
pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    if Path::new(path).exists() {
        tracing::debug!(config = %path, "Loading configuration");
        Ok(ConfigLoader::load_file(path)?)
    } else {
        tracing::debug!(config = %path, "No configuration file, using defaults");
        Ok(Config::default())
    }
}
