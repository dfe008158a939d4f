//! Job driver: runs the ordered phases of one job.
//!
//! Fail-fast phases abort the remaining setup/test phases, the closing phase
//! always runs exactly once, and the export phase only runs after a passing
//! test run.

use crate::config::PipelineConfig;
use crate::context::JobContext;
use crate::coverage::CoverageDataset;
use crate::error::{PipelineError, Result};
use crate::events::{self, EventLog, JobEvent};
use crate::matrix::Job;
use crate::phase::{JobState, Phase, PhaseKind, PhaseOutcome, RunPolicy, SETUP_FAILURE_CODE};
use crate::phases::{
    CloseSessionPhase, ExportCoveragePhase, InstallPhase, OpenSessionPhase, TestRunPhase,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How a phase ended inside a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Passed,
    Failed,
    Completed,
    Skipped,
}

/// Per-phase record kept on the job result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseRecord {
    pub kind: PhaseKind,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job: Job,

    /// Unique id of this execution.
    pub run_id: String,

    /// Setup completed and the tests returned 0.
    pub success: bool,

    /// Test result code, or the setup-failure indicator.
    pub exit_code: i32,

    /// Fail-fast phase that aborted the job.
    pub aborted_at: Option<PhaseKind>,

    pub failure: Option<String>,

    /// Closing step failure; never changes the outcome.
    pub report_error: Option<String>,

    /// Export failure; never changes the outcome.
    pub export_error: Option<String>,

    pub states: Vec<JobState>,

    pub phases: Vec<PhaseRecord>,

    pub events: Vec<JobEvent>,

    pub coverage: Option<CoverageDataset>,

    pub report_path: Option<PathBuf>,

    pub started_at: DateTime<Utc>,

    pub duration_ms: u64,
}

impl JobResult {
    pub fn reached(&self, state: JobState) -> bool {
        self.states.contains(&state)
    }

    /// Number of times the closing step was executed.
    pub fn session_close_count(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.kind == PhaseKind::CloseSession && p.status != PhaseStatus::Skipped)
            .count()
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.kind == kind)
    }

    /// Result for a job whose task ended without producing one.
    pub fn crashed(job: Job, reason: String) -> Self {
        Self {
            job,
            run_id: Uuid::new_v4().to_string(),
            success: false,
            exit_code: SETUP_FAILURE_CODE,
            aborted_at: None,
            failure: Some(reason),
            report_error: None,
            export_error: None,
            states: vec![JobState::Start],
            phases: Vec::new(),
            events: Vec::new(),
            coverage: None,
            report_path: None,
            started_at: Utc::now(),
            duration_ms: 0,
        }
    }
}

/// Steps per phase, as shown by dry runs.
pub type JobPlan = Vec<(PhaseKind, Vec<String>)>;

/// Ordered list of phases composing a job.
pub struct JobPipeline {
    phases: Vec<Box<dyn Phase>>,
}

impl JobPipeline {
    /// Build a pipeline from custom phases.
    ///
    /// Exactly one closing phase is required so every job reports a terminal
    /// status exactly once.
    pub fn new(phases: Vec<Box<dyn Phase>>) -> Result<Self> {
        let closers = phases
            .iter()
            .filter(|p| p.kind() == PhaseKind::CloseSession)
            .count();
        if closers != 1 {
            return Err(PipelineError::InvalidConfig(format!(
                "a job pipeline needs exactly one close_session phase, found {}",
                closers
            )));
        }
        Ok(Self { phases })
    }

    /// install → open session → tests → close session → export.
    pub fn standard(config: &PipelineConfig) -> Self {
        Self {
            phases: vec![
                Box::new(InstallPhase::new(
                    config.dependencies.clone(),
                    config.installers.clone(),
                )),
                Box::new(OpenSessionPhase),
                Box::new(TestRunPhase::new(config.tests.clone())),
                Box::new(CloseSessionPhase),
                Box::new(ExportCoveragePhase::new(config.export.clone())),
            ],
        }
    }

    pub fn kinds(&self) -> Vec<PhaseKind> {
        self.phases.iter().map(|p| p.kind()).collect()
    }

    /// Phase-by-phase steps a job would execute.
    pub fn plan(&self, ctx: &JobContext) -> JobPlan {
        self.phases
            .iter()
            .map(|p| (p.kind(), p.describe(ctx)))
            .collect()
    }

    /// Run every phase of one job. Never fails: phase failures become data.
    pub async fn run(&self, mut ctx: JobContext) -> JobResult {
        let start = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let job_id = ctx.job.id.clone();

        let mut log = EventLog::new();
        let mut states = vec![JobState::Start];
        let mut records = Vec::new();
        let mut aborted_at = None;
        let mut failure = None;
        let mut report_error = None;
        let mut export_error = None;

        info!(job = %job_id, run_id = %run_id, digest = ctx.job.short_digest(), "Starting job");
        log.record(
            events::JOB_STARTED,
            json!({
                "job": job_id.0,
                "version": ctx.job.version,
                "run_id": run_id,
            }),
        );

        for phase in &self.phases {
            let kind = phase.kind();
            let policy = kind.policy();

            let should_run = match policy {
                RunPolicy::AfterSetup => aborted_at.is_none(),
                RunPolicy::Always => true,
                RunPolicy::OnTestsPassed => aborted_at.is_none() && ctx.result_code == Some(0),
            };

            if !should_run {
                info!(job = %job_id, phase = %kind, "Skipping phase");
                log.record(events::PHASE_SKIPPED, json!({ "phase": kind.name() }));
                records.push(PhaseRecord {
                    kind,
                    status: PhaseStatus::Skipped,
                    result_code: None,
                    detail: None,
                    duration_ms: 0,
                });
                continue;
            }

            info!(job = %job_id, phase = %kind, "Executing phase");
            log.record(events::PHASE_STARTED, json!({ "phase": kind.name() }));
            let phase_start = Instant::now();
            let outcome = phase.run(&mut ctx).await;
            let duration_ms = phase_start.elapsed().as_millis() as u64;

            let record = match outcome {
                PhaseOutcome::Passed => {
                    states.push(kind.reached_state());
                    log.record(
                        events::PHASE_PASSED,
                        json!({ "phase": kind.name(), "duration_ms": duration_ms }),
                    );
                    PhaseRecord {
                        kind,
                        status: PhaseStatus::Passed,
                        result_code: None,
                        detail: None,
                        duration_ms,
                    }
                }
                PhaseOutcome::Completed { result_code } => {
                    ctx.set_result_code(result_code);
                    states.push(kind.reached_state());
                    info!(job = %job_id, exit_code = result_code, "Test suite finished");
                    log.record(
                        events::TESTS_COMPLETED,
                        json!({
                            "phase": kind.name(),
                            "result_code": result_code,
                            "duration_ms": duration_ms,
                        }),
                    );
                    PhaseRecord {
                        kind,
                        status: PhaseStatus::Completed,
                        result_code: Some(result_code),
                        detail: None,
                        duration_ms,
                    }
                }
                PhaseOutcome::Failed { reason } => {
                    match policy {
                        RunPolicy::AfterSetup => {
                            error!(job = %job_id, phase = %kind, %reason, "Phase failed, aborting job");
                            ctx.aborted = true;
                            aborted_at = Some(kind);
                            failure = Some(reason.clone());
                        }
                        RunPolicy::Always => {
                            warn!(job = %job_id, phase = %kind, %reason, "Closing step failed");
                            report_error = Some(reason.clone());
                        }
                        RunPolicy::OnTestsPassed => {
                            warn!(job = %job_id, phase = %kind, %reason, "Post-processing failed");
                            export_error = Some(reason.clone());
                        }
                    }
                    log.record(
                        events::PHASE_FAILED,
                        json!({
                            "phase": kind.name(),
                            "policy": policy,
                            "error": reason,
                            "duration_ms": duration_ms,
                        }),
                    );
                    PhaseRecord {
                        kind,
                        status: PhaseStatus::Failed,
                        result_code: None,
                        detail: Some(reason),
                        duration_ms,
                    }
                }
            };
            records.push(record);
        }

        states.push(JobState::End);

        let exit_code = if aborted_at.is_some() {
            SETUP_FAILURE_CODE
        } else {
            ctx.result_code.unwrap_or(SETUP_FAILURE_CODE)
        };
        let success = aborted_at.is_none() && exit_code == 0;
        if success {
            info!(job = %job_id, "Job passed");
        } else {
            info!(job = %job_id, exit_code, "Job failed");
        }
        let duration_ms = start.elapsed().as_millis() as u64;

        log.record(
            events::JOB_FINISHED,
            json!({
                "success": success,
                "exit_code": exit_code,
                "duration_ms": duration_ms,
            }),
        );

        JobResult {
            job: ctx.job,
            run_id,
            success,
            exit_code,
            aborted_at,
            failure,
            report_error,
            export_error,
            states,
            phases: records,
            events: log.into_events(),
            coverage: ctx.coverage.dataset,
            report_path: ctx.report_path,
            started_at,
            duration_ms,
        }
    }
}
