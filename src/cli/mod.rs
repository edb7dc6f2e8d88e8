//! Command-line front end

pub mod commands;
pub mod logging;

use std::path::Path;

use crate::config::PipelineConfig;
use crate::error::Result;

/// Read the configuration file when given, otherwise defaults plus environment
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path),
        None => PipelineConfig::from_env(),
    }
}
