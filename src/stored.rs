//! Stored-object flows.
//!
//! Models and engine outputs live in an [`ObjectStore`]; each flow copies
//! what it needs into a fresh run directory and works from there.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::invoker::{EngineOptions, SlicingEngine};
use crate::metrics::MetricIssue;
use crate::pipeline::{file_stem, PipelineError, QuotePipeline};
use crate::pricing::Quote;
use crate::profile::{PrinterProfile, QuoteParameters};
use crate::staging::{JobDir, ReleaseGuard};
use crate::storage::{object_filename, ObjectStore, StoredObject};
use crate::validation::{JobInput, Validator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSlice {
    pub model_path: String,
    pub output: StoredObject,
    pub config_hash: String,
    pub engine_output: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredQuote {
    pub output_path: String,
    pub quote: Quote,
    pub issues: Vec<MetricIssue>,
}

/// A fetched output file, kept on disk while any clone of its guard lives.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    pub filename: String,
    pub path: PathBuf,
    guard: ReleaseGuard,
}

impl DownloadHandle {
    pub fn guard(&self) -> &ReleaseGuard {
        &self.guard
    }

    /// Transfer finished; the directory goes once other holders are done too.
    pub fn release(self) {
        self.guard.release();
    }
}

pub struct StoredJobs<'a, E, S: ?Sized> {
    pipeline: &'a QuotePipeline<E>,
    store: &'a S,
}

impl<'a, E: SlicingEngine, S: ObjectStore + ?Sized> StoredJobs<'a, E, S> {
    pub fn new(pipeline: &'a QuotePipeline<E>, store: &'a S) -> Self {
        Self { pipeline, store }
    }

    /// Store a model in the model bucket. Never overwrites.
    pub fn upload_model(
        &self,
        identity: &str,
        folder: Option<&str>,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, PipelineError> {
        let profile = PrinterProfile::default();
        let params = QuoteParameters::default();
        let input = JobInput {
            identity,
            model_filename: filename,
            model_size: bytes.len(),
            profile: &profile,
            params: &params,
            bounds: None,
        };
        let validation = Validator::upload().validate(&input);
        if !validation.valid {
            return Err(PipelineError::ValidationFailed(validation.error_summary()));
        }

        let bucket = &self.pipeline.config().model_bucket;
        let stored = self.store.upload(identity, folder, bucket, bytes, filename, false)?;
        info!(identity, path = %stored.path, "Uploaded model");
        Ok(stored)
    }

    /// Slice a stored model and store the output next to it in the output
    /// bucket, at the same path with a `.gcode` extension.
    pub fn slice_stored(
        &self,
        identity: &str,
        model_path: &str,
        profile: &PrinterProfile,
        options: Option<&EngineOptions>,
        remove_local: bool,
    ) -> Result<StoredSlice, PipelineError> {
        let config = self.pipeline.config();
        let bytes = self.store.download(&config.model_bucket, model_path)?;
        let model_filename = object_filename(model_path).to_string();
        self.pipeline
            .check_model(identity, &model_filename, &bytes, profile, &config.quote_defaults)?;

        let dir = self.pipeline.stage(identity)?;
        let result = self.slice_in(
            &dir,
            identity,
            model_path,
            &model_filename,
            &bytes,
            profile,
            options,
        );
        if remove_local {
            self.discard(&dir);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn slice_in(
        &self,
        dir: &JobDir,
        identity: &str,
        model_path: &str,
        model_filename: &str,
        bytes: &[u8],
        profile: &PrinterProfile,
        options: Option<&EngineOptions>,
    ) -> Result<StoredSlice, PipelineError> {
        dir.write_file(model_filename, bytes)?;
        let options = options.unwrap_or_else(|| self.pipeline.invoker().options());
        let control = self.pipeline.run_control();
        let artifacts = self
            .pipeline
            .slice_model(dir, model_filename, profile, options, &control)?;

        let output_name = format!("{}.gcode", file_stem(model_filename));
        let gcode = dir.read_file(&output_name)?;
        let folder = output_folder(identity, model_path);
        let output = self.store.upload(
            identity,
            folder.as_deref(),
            &self.pipeline.config().output_bucket,
            &gcode,
            &output_name,
            true,
        )?;
        info!(identity, path = %output.path, "Stored engine output");

        Ok(StoredSlice {
            model_path: model_path.to_string(),
            output,
            config_hash: artifacts.config_hash,
            engine_output: artifacts.engine_output,
        })
    }

    /// Price a stored engine output. The local copy is always removed.
    pub fn quote_stored(
        &self,
        identity: &str,
        output_path: &str,
        params: Option<&QuoteParameters>,
    ) -> Result<StoredQuote, PipelineError> {
        let config = self.pipeline.config();
        let params = params.unwrap_or(&config.quote_defaults);
        self.pipeline.check_params(Some(identity), params)?;

        let (dir, local) = self.fetch_output(identity, output_path)?;
        let result = self.pipeline.price_output(&local, params);
        self.discard(&dir);

        let (quote, issues) = result?;
        Ok(StoredQuote {
            output_path: output_path.to_string(),
            quote,
            issues,
        })
    }

    /// Fetch an engine output for streaming to a client.
    pub fn download_output(
        &self,
        identity: &str,
        output_path: &str,
    ) -> Result<DownloadHandle, PipelineError> {
        let (dir, path) = self.fetch_output(identity, output_path)?;
        Ok(DownloadHandle {
            filename: object_filename(output_path).to_string(),
            path,
            guard: dir.release_guard(),
        })
    }

    fn fetch_output(
        &self,
        identity: &str,
        output_path: &str,
    ) -> Result<(JobDir, PathBuf), PipelineError> {
        let bytes = self
            .store
            .download(&self.pipeline.config().output_bucket, output_path)?;
        let dir = self.pipeline.stage(identity)?;
        match dir.write_file(object_filename(output_path), &bytes) {
            Ok(path) => Ok((dir, path)),
            Err(e) => {
                self.discard(&dir);
                Err(e.into())
            }
        }
    }

    fn discard(&self, dir: &JobDir) {
        self.pipeline.discard(dir);
    }
}

/// Folder of `model_path` below the identity prefix, if any.
fn output_folder(identity: &str, model_path: &str) -> Option<String> {
    let parent = Path::new(model_path).parent()?.to_str()?;
    let folder = parent
        .strip_prefix(identity)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(parent)
        .trim_matches('/');
    (!folder.is_empty()).then(|| folder.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_folder() {
        assert_eq!(output_folder("u1", "u1/part.stl"), None);
        assert_eq!(output_folder("u1", "u1/jobs/a/part.stl"), Some("jobs/a".to_string()));
        assert_eq!(output_folder("u1", "u10/part.stl"), Some("u10".to_string()));
        assert_eq!(output_folder("u1", "part.stl"), None);
    }
}
