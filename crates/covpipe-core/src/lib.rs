//! covpipe core library
//!
//! Runs a test suite with coverage across an interpreter-version matrix and
//! reports each job's terminal status to an external quality service.
//!
//! A job walks five phases in order: dependency install, reporting session
//! open, test run, session close and coverage export. Setup phases are
//! fail-fast, the closing phase runs exactly once per job whatever happened
//! before it, and export only runs after a passing test suite.

pub mod command;
pub mod config;
pub mod context;
pub mod coverage;
pub mod driver;
pub mod error;
pub mod events;
pub mod fakes;
pub mod gate;
pub mod matrix;
pub mod orchestrator;
pub mod phase;
pub mod phases;
pub mod reporting;
pub mod telemetry;

pub use command::{CommandOutput, CommandRunner, Invocation, ProcessRunner};
pub use config::{
    ExportConfig, InstallAction, Installer, InstallersConfig, MatrixConfig, PipelineConfig,
    ReporterConfig, TestConfig, DEFAULT_PIPELINE_FILE, DEFAULT_REPORTER_ID_ENV,
};
pub use context::JobContext;
pub use coverage::{CoverageDataset, CoverageFlags, CoverageState};
pub use driver::{JobPipeline, JobPlan, JobResult, PhaseRecord, PhaseStatus};
pub use error::{PipelineError, Result};
pub use events::{EventLog, JobEvent};
pub use gate::{GateVerdict, MatrixGate};
pub use matrix::{Job, JobId, Matrix};
pub use orchestrator::{MatrixResult, MatrixRunner};
pub use phase::{JobState, Phase, PhaseKind, PhaseOutcome, RunPolicy, SETUP_FAILURE_CODE};
pub use reporting::{HelperReporter, HelperSource, NoopReporter, ReporterId, ReportingService};
pub use telemetry::init_tracing;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
