//! Quote Pipeline - Single Entry Point
//!
//! validate → stage → translate → slice → parse → price → cleanup.
//! Validation always runs first; nothing touches disk or spawns a process
//! for a rejected request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, PipelineConfig};
use crate::hashing::compute_job_hash;
use crate::invoker::{
    EngineOptions, InvokeError, ProcessEngine, RunControl, SlicingEngine, SlicingInvoker,
};
use crate::metrics::{parse_metrics_file, MetricIssue};
use crate::model::{check_printability, read_stl_bounds, ModelBounds, ModelError, Printability};
use crate::pricing::{price, Quote};
use crate::profile::{PrinterProfile, QuoteParameters};
use crate::staging::{JobDir, StagingError, Workspace};
use crate::storage::StorageError;
use crate::translate::{BaselineTemplate, ProfileTranslator, TranslateError};
use crate::validation::{JobInput, ValidationResult, ValidationViolation, Validator};
use crate::PIPELINE_VERSION;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    #[error("Slicing failed: {0}")]
    Slicing(#[from] InvokeError),

    #[error("Engine produced no output at {0}")]
    OutputMissing(PathBuf),

    #[error("Failed to read engine output {path}: {source}")]
    OutputRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Input problems the caller can fix, as opposed to server-side failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::ValidationFailed(_)
                | PipelineError::Model(_)
                | PipelineError::Storage(StorageError::Conflict { .. })
                | PipelineError::Storage(StorageError::NotFound { .. })
                | PipelineError::Storage(StorageError::InvalidPath(_))
        )
    }
}

/// What happens to the working directory after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    Keep,
    #[default]
    Purge,
}

#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub identity: String,
    pub model_filename: String,
    pub model_bytes: Vec<u8>,
    pub profile: PrinterProfile,
    /// Falls back to the configured quote defaults.
    pub params: Option<QuoteParameters>,
    /// Overrides the invoker's default engine flags.
    pub engine_options: Option<EngineOptions>,
    pub cleanup: CleanupPolicy,
}

impl QuoteRequest {
    pub fn new(
        identity: impl Into<String>,
        model_filename: impl Into<String>,
        model_bytes: Vec<u8>,
    ) -> Self {
        Self {
            identity: identity.into(),
            model_filename: model_filename.into(),
            model_bytes,
            profile: PrinterProfile::default(),
            params: None,
            engine_options: None,
            cleanup: CleanupPolicy::default(),
        }
    }

    pub fn with_profile(mut self, profile: PrinterProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_params(mut self, params: QuoteParameters) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }
}

/// Files produced by one slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceArtifacts {
    pub model_path: PathBuf,
    pub config_path: PathBuf,
    pub output_path: PathBuf,
    pub config_hash: String,
    pub engine_output: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub identity: String,
    pub run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub pipeline_version: String,
    pub job_hash: String,
    pub config_hash: String,
    pub output_file: String,
    /// Where the artifacts are, if they were kept.
    pub working_dir: Option<PathBuf>,
    pub printability: Printability,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteOutcome {
    pub quote: Quote,
    pub issues: Vec<MetricIssue>,
    pub warnings: Vec<ValidationViolation>,
    pub job: JobSummary,
}

/// The quote pipeline - single entry point for slicing and pricing.
pub struct QuotePipeline<E> {
    config: PipelineConfig,
    workspace: Workspace,
    translator: ProfileTranslator,
    invoker: SlicingInvoker<E>,
    validator: Validator,
}

impl QuotePipeline<ProcessEngine> {
    /// Startup: load the baseline template and locate the engine binary.
    /// Either failing is fatal for the host process.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let engine = ProcessEngine::locate(&config.engine_executable)?;
        let baseline = BaselineTemplate::load(&config.baseline_template)?;
        info!(
            engine = %engine.executable().display(),
            baseline = %config.baseline_template.display(),
            "Quote pipeline ready"
        );
        Ok(Self::new(
            config,
            ProfileTranslator::new(baseline),
            SlicingInvoker::process(engine),
        ))
    }
}

impl<E: SlicingEngine> QuotePipeline<E> {
    pub fn new(
        config: PipelineConfig,
        translator: ProfileTranslator,
        invoker: SlicingInvoker<E>,
    ) -> Self {
        Self {
            workspace: Workspace::new(&config.working_root),
            validator: Validator::new(config.enforce_build_volume),
            config,
            translator,
            invoker,
        }
    }

    /// Pipeline around a custom engine, invoked as `config.engine_executable`.
    pub fn with_engine(config: PipelineConfig, engine: E) -> Result<Self, PipelineError> {
        let baseline = BaselineTemplate::load(&config.baseline_template)?;
        let invoker = SlicingInvoker::new(engine, config.engine_executable.clone());
        Ok(Self::new(config, ProfileTranslator::new(baseline), invoker))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn translator(&self) -> &ProfileTranslator {
        &self.translator
    }

    pub fn invoker(&self) -> &SlicingInvoker<E> {
        &self.invoker
    }

    /// Run control with the configured timeout and a fresh cancel token.
    pub fn run_control(&self) -> RunControl {
        RunControl {
            timeout: self.config.slice_timeout(),
            ..Default::default()
        }
    }

    pub fn validate(&self, input: &JobInput<'_>) -> ValidationResult {
        self.validator.validate(input)
    }

    pub(crate) fn stage(&self, identity: &str) -> Result<JobDir, StagingError> {
        if self.config.isolate_runs {
            self.workspace.stage_run(identity)
        } else {
            self.workspace.stage(identity)
        }
    }

    /// Validate a job and measure its model.
    ///
    /// MANDATORY: every flow that stages, slices or prices calls this (or
    /// [`Self::check_params`]) first. Nothing touches disk before it passes.
    pub(crate) fn check_model(
        &self,
        identity: &str,
        model_filename: &str,
        model_bytes: &[u8],
        profile: &PrinterProfile,
        params: &QuoteParameters,
    ) -> Result<(ValidationResult, ModelBounds), PipelineError> {
        let bounds = if model_bytes.is_empty() {
            Err(ModelError::Empty)
        } else {
            read_stl_bounds(model_bytes)
        };
        let validation = require_valid(self.validate(&JobInput {
            identity,
            model_filename,
            model_size: model_bytes.len(),
            profile,
            params,
            bounds: bounds.as_ref().ok(),
        }))?;
        Ok((validation, bounds?))
    }

    /// Validate pricing inputs for a job that has no model.
    pub(crate) fn check_params(
        &self,
        identity: Option<&str>,
        params: &QuoteParameters,
    ) -> Result<(), PipelineError> {
        let profile = PrinterProfile::default();
        let input = JobInput {
            identity: identity.unwrap_or_default(),
            model_filename: "",
            model_size: 0,
            profile: &profile,
            params,
            bounds: None,
        };
        require_valid(Validator::pricing(identity.is_some()).validate(&input)).map(|_| ())
    }

    /// Validate, stage and slice a model without pricing it.
    ///
    /// On success the run directory is left in place and belongs to the
    /// caller. On failure it is purged unless the request keeps it.
    pub fn slice(
        &self,
        request: &QuoteRequest,
        control: &RunControl,
    ) -> Result<(JobDir, SliceArtifacts), PipelineError> {
        let params = request
            .params
            .clone()
            .unwrap_or_else(|| self.config.quote_defaults.clone());
        self.check_model(
            &request.identity,
            &request.model_filename,
            &request.model_bytes,
            &request.profile,
            &params,
        )?;

        let dir = self.stage(&request.identity)?;
        let result = dir
            .write_file(&request.model_filename, &request.model_bytes)
            .map_err(PipelineError::from)
            .and_then(|_| {
                let options = request
                    .engine_options
                    .as_ref()
                    .unwrap_or_else(|| self.invoker.options());
                self.slice_model(&dir, &request.model_filename, &request.profile, options, control)
            });
        match result {
            Ok(artifacts) => Ok((dir, artifacts)),
            Err(e) => {
                if request.cleanup == CleanupPolicy::Purge {
                    self.discard(&dir);
                }
                Err(e)
            }
        }
    }

    pub(crate) fn discard(&self, dir: &JobDir) {
        if let Err(e) = self.workspace.cleanup_dir(dir) {
            warn!(path = %dir.path().display(), error = %e, "Failed to clean up run directory");
        }
    }

    /// Quote an uploaded model end to end.
    pub fn quote(&self, request: &QuoteRequest) -> Result<QuoteOutcome, PipelineError> {
        self.quote_with(request, &self.run_control())
    }

    pub fn quote_with(
        &self,
        request: &QuoteRequest,
        control: &RunControl,
    ) -> Result<QuoteOutcome, PipelineError> {
        let params = request
            .params
            .clone()
            .unwrap_or_else(|| self.config.quote_defaults.clone());

        let (validation, bounds) = self.check_model(
            &request.identity,
            &request.model_filename,
            &request.model_bytes,
            &request.profile,
            &params,
        )?;
        let printability = check_printability(&bounds, &request.profile);
        let job_hash = compute_job_hash(&request.profile, &params, PIPELINE_VERSION)?;

        let dir = self.stage(&request.identity)?;
        let result = self.run_staged(&dir, request, &params, control);

        let keep = request.cleanup == CleanupPolicy::Keep;
        if !keep {
            self.discard(&dir);
        }

        let (artifacts, quote, issues) = result?;
        info!(
            identity = %request.identity,
            total_price = quote.total_price,
            currency = %quote.currency,
            "Quoted model"
        );

        Ok(QuoteOutcome {
            quote,
            issues,
            warnings: validation.warnings().cloned().collect(),
            job: JobSummary {
                identity: request.identity.clone(),
                run_id: dir.run_id(),
                created_at: Utc::now(),
                pipeline_version: PIPELINE_VERSION.to_string(),
                job_hash,
                config_hash: artifacts.config_hash,
                output_file: file_name(&artifacts.output_path),
                working_dir: keep.then(|| dir.path().to_path_buf()),
                printability,
            },
        })
    }

    fn run_staged(
        &self,
        dir: &JobDir,
        request: &QuoteRequest,
        params: &QuoteParameters,
        control: &RunControl,
    ) -> Result<(SliceArtifacts, Quote, Vec<MetricIssue>), PipelineError> {
        dir.write_file(&request.model_filename, &request.model_bytes)?;
        let options = request
            .engine_options
            .as_ref()
            .unwrap_or_else(|| self.invoker.options());
        let artifacts =
            self.slice_model(dir, &request.model_filename, &request.profile, options, control)?;
        let (quote, issues) = self.price_output(&artifacts.output_path, params)?;
        Ok((artifacts, quote, issues))
    }

    /// Translate `profile`, then slice the model already staged in `dir`.
    /// Callers validate first.
    pub(crate) fn slice_model(
        &self,
        dir: &JobDir,
        model_filename: &str,
        profile: &PrinterProfile,
        options: &EngineOptions,
        control: &RunControl,
    ) -> Result<SliceArtifacts, PipelineError> {
        let model_path = dir.file(model_filename)?;
        let stem = file_stem(model_filename);
        let config_path = dir.file(&format!("{stem}.ini"))?;
        let output_path = dir.file(&format!("{stem}.gcode"))?;

        let config = self.translator.translate(profile);
        config.persist(&config_path)?;

        let run = self
            .invoker
            .slice_with(&model_path, &config_path, &output_path, options, control)?;
        if !output_path.exists() {
            return Err(PipelineError::OutputMissing(output_path));
        }

        Ok(SliceArtifacts {
            model_path,
            config_path,
            output_path,
            config_hash: config.content_hash(),
            engine_output: run.output,
        })
    }

    /// Parse an engine output file and price it.
    pub fn quote_output(
        &self,
        output: &Path,
        params: &QuoteParameters,
    ) -> Result<(Quote, Vec<MetricIssue>), PipelineError> {
        self.check_params(None, params)?;
        self.price_output(output, params)
    }

    pub(crate) fn price_output(
        &self,
        output: &Path,
        params: &QuoteParameters,
    ) -> Result<(Quote, Vec<MetricIssue>), PipelineError> {
        if !output.exists() {
            return Err(PipelineError::OutputMissing(output.to_path_buf()));
        }
        let report = parse_metrics_file(output).map_err(|source| PipelineError::OutputRead {
            path: output.to_path_buf(),
            source,
        })?;
        Ok((price(&report.metrics, params), report.issues))
    }
}

fn require_valid(result: ValidationResult) -> Result<ValidationResult, PipelineError> {
    if result.valid {
        Ok(result)
    } else {
        Err(PipelineError::ValidationFailed(result.error_summary()))
    }
}

pub(crate) fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("moon.stl"), "moon");
        assert_eq!(file_stem("moon.v2.STL"), "moon.v2");
        assert_eq!(file_stem("noext"), "noext");
    }

    #[test]
    fn test_client_errors() {
        assert!(PipelineError::ValidationFailed("x".into()).is_client_error());
        assert!(PipelineError::Model(ModelError::Empty).is_client_error());
        assert!(!PipelineError::OutputMissing(PathBuf::from("a.gcode")).is_client_error());
    }
}
