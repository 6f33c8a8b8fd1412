//! SliceQuote Core - 3D Print Quoting
//!
//! # Pipeline
//! 1. Translate a printer profile into a layered engine config
//! 2. Slice the staged model with an external engine
//! 3. Read print metrics from the engine's output annotations
//! 4. Price the metrics
//! 5. Clean up the working directory
//!
//! Validation runs before any of it. A rejected job never touches disk.

pub mod config;
pub mod hashing;
pub mod invoker;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod pricing;
pub mod profile;
pub mod staging;
pub mod storage;
pub mod stored;
pub mod translate;
pub mod validation;

pub use config::{ConfigError, PipelineConfig};
pub use hashing::{canonical_json, compute_job_hash, sha256_hex};
pub use invoker::{
    CancelToken, EngineOptions, EngineRun, InvokeError, Invocation, ProcessEngine, RunControl,
    SlicingEngine, SlicingInvoker,
};
pub use metrics::{duration_to_seconds, parse_metrics, MetricIssue, MetricsReport, PrintMetrics};
pub use model::{check_printability, read_stl_bounds, ModelBounds, ModelError, Printability};
pub use pipeline::{
    CleanupPolicy, JobSummary, PipelineError, QuoteOutcome, QuotePipeline, QuoteRequest,
    SliceArtifacts,
};
pub use pricing::{price, round_cents, Quote, QuoteStatus};
pub use profile::{FilamentType, MaterialProfile, PrinterProfile, QuoteParameters};
pub use staging::{JobDir, ReleaseGuard, StagingError, Workspace};
pub use storage::{LocalObjectStore, ObjectStore, StorageError, StoredObject};
pub use stored::{DownloadHandle, StoredJobs};
pub use translate::{
    BaselineTemplate, EngineConfig, ProfileTranslator, SettingSource, SettingValue,
    TranslateError,
};
pub use validation::{ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};

pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");
