//! Pipeline configuration.
//!
//! Loaded from a JSON file with every field optional, then overlaid with
//! `SLICEQUOTE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::invoker::default_executable;
use crate::profile::QuoteParameters;

pub const ENV_WORKING_ROOT: &str = "SLICEQUOTE_WORKING_ROOT";
pub const ENV_ENGINE: &str = "SLICEQUOTE_ENGINE";
pub const ENV_BASELINE: &str = "SLICEQUOTE_BASELINE";
pub const ENV_SLICE_TIMEOUT: &str = "SLICEQUOTE_SLICE_TIMEOUT_SECS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Parent of all job working directories.
    pub working_root: PathBuf,
    pub engine_executable: PathBuf,
    /// JSON object of baseline engine settings.
    pub baseline_template: PathBuf,
    /// `None` or `0` lets the engine run unbounded.
    pub slice_timeout_secs: Option<u64>,
    /// Stage each run in its own directory beneath the identity directory.
    pub isolate_runs: bool,
    /// Reject models larger than the build volume instead of warning.
    pub enforce_build_volume: bool,
    pub quote_defaults: QuoteParameters,
    pub model_bucket: String,
    pub output_bucket: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            working_root: PathBuf::from("./data/temp"),
            engine_executable: default_executable(),
            baseline_template: PathBuf::from("configs/default_config.json"),
            slice_timeout_secs: Some(600),
            isolate_runs: true,
            enforce_build_volume: true,
            quote_defaults: QuoteParameters::default(),
            model_bucket: "stl-files".to_string(),
            output_bucket: "gcode-files".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay values from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|var| std::env::var(var).ok())
    }

    /// Overlay values from `lookup`, which maps variable names to values.
    pub fn apply_vars<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_WORKING_ROOT) {
            self.working_root = PathBuf::from(root);
        }
        if let Some(engine) = lookup(ENV_ENGINE) {
            self.engine_executable = PathBuf::from(engine);
        }
        if let Some(baseline) = lookup(ENV_BASELINE) {
            self.baseline_template = PathBuf::from(baseline);
        }
        if let Some(raw) = lookup(ENV_SLICE_TIMEOUT) {
            self.slice_timeout_secs = match raw.trim() {
                "" | "none" | "0" => None,
                secs => Some(secs.parse().map_err(|_| ConfigError::Env {
                    var: ENV_SLICE_TIMEOUT,
                    value: raw.clone(),
                })?),
            };
        }
        Ok(self)
    }

    pub fn slice_timeout(&self) -> Option<Duration> {
        self.slice_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
