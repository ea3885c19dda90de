//! Engine settings, loaded from TOML. Every field has a default so a config
//! file only needs to name what it changes.

use crate::context::InfoMethod;
use crate::mvn::GenzIntegrator;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker count for partitioned row evaluation.
    pub workers: usize,
    /// Report per-row log-likelihoods instead of the summed fit value.
    pub return_row_likelihoods: bool,
    pub info_method: InfoMethod,
    /// Log every derivative-name mapping when a map is rebuilt.
    pub verbose: bool,
    /// Lattice points per rectangle probability.
    pub integration_points: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            return_row_likelihoods: false,
            info_method: InfoMethod::Hessian,
            verbose: false,
            integration_points: GenzIntegrator::default().points(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn integrator(&self) -> GenzIntegrator {
        GenzIntegrator::new(self.integration_points)
    }
}
