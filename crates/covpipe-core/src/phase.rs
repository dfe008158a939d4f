//! Phase contract and job state machine.

use crate::context::JobContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result code handed to the closing step when the job never produced a
/// test result (setup failure).
pub const SETUP_FAILURE_CODE: i32 = -1;

/// The ordered stages of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Install system and language dependencies.
    Install,

    /// Acquire the reporting helper and signal `before-build`.
    OpenSession,

    /// Erase coverage, run the test suite with coverage enabled.
    TestRun,

    /// Signal `after-build` with the captured result code.
    CloseSession,

    /// Convert raw coverage data to a portable report.
    ExportCoverage,
}

impl PhaseKind {
    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::Install => "install",
            PhaseKind::OpenSession => "open_session",
            PhaseKind::TestRun => "test_run",
            PhaseKind::CloseSession => "close_session",
            PhaseKind::ExportCoverage => "export_coverage",
        }
    }

    /// When the driver may run this phase.
    pub fn policy(&self) -> RunPolicy {
        match self {
            PhaseKind::Install | PhaseKind::OpenSession | PhaseKind::TestRun => {
                RunPolicy::AfterSetup
            }
            PhaseKind::CloseSession => RunPolicy::Always,
            PhaseKind::ExportCoverage => RunPolicy::OnTestsPassed,
        }
    }

    /// State the job reaches when this phase completes.
    pub fn reached_state(&self) -> JobState {
        match self {
            PhaseKind::Install => JobState::DependenciesInstalled,
            PhaseKind::OpenSession => JobState::ReportSessionOpened,
            PhaseKind::TestRun => JobState::TestsRun,
            PhaseKind::CloseSession => JobState::ReportSessionClosed,
            PhaseKind::ExportCoverage => JobState::CoverageExported,
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Gating rule applied by the driver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPolicy {
    /// Runs only while no earlier phase has aborted the job; a failure aborts.
    AfterSetup,

    /// Runs exactly once, whatever happened before.
    Always,

    /// Runs only when the tests completed with result code 0.
    OnTestsPassed,
}

/// States a job moves through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Start,
    DependenciesInstalled,
    ReportSessionOpened,
    TestsRun,
    ReportSessionClosed,
    CoverageExported,
    End,
}

/// Binary outcome of a phase, plus the result code of the test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Passed,

    Failed { reason: String },

    /// The test suite ran; the code is data, not an abort.
    Completed { result_code: i32 },
}

impl PhaseOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        PhaseOutcome::Failed {
            reason: reason.into(),
        }
    }
}

/// One ordered stage of a job.
#[async_trait]
pub trait Phase: Send + Sync {
    fn kind(&self) -> PhaseKind;

    /// Human-readable steps for dry runs.
    fn describe(&self, ctx: &JobContext) -> Vec<String>;

    async fn run(&self, ctx: &mut JobContext) -> PhaseOutcome;
}
