//! Per-job execution context shared by the phases of one job.

use crate::command::{CommandRunner, Invocation};
use crate::config::PipelineConfig;
use crate::coverage::CoverageState;
use crate::error::Result;
use crate::matrix::Job;
use crate::phase::SETUP_FAILURE_CODE;
use crate::reporting::{ReporterId, ReportingService, SessionScope};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Variable carrying the test result code to the phases that follow the tests.
pub const TEST_RESULT_ENV: &str = "COVPIPE_TEST_RESULT";

/// Everything a phase may read or mutate while a job runs.
///
/// Nothing here is shared with other jobs except the read-only collaborators.
/// Files a job writes into the shared working directory are suffixed with the
/// job id.
pub struct JobContext {
    pub job: Job,

    /// Absolute working directory.
    pub workdir: PathBuf,

    /// Job variables plus the test result once it is known.
    pub env: BTreeMap<String, String>,

    pub reporter_id: ReporterId,

    pub runner: Arc<dyn CommandRunner>,

    pub reporter: Arc<dyn ReportingService>,

    pub coverage: CoverageState,

    /// Result code of the test run, once it has completed.
    pub result_code: Option<i32>,

    /// Set when a fail-fast phase aborted the job.
    pub aborted: bool,

    /// Portable coverage report written by the export step.
    pub report_path: Option<PathBuf>,

    /// Set as soon as the closing step has been attempted. Shared with the
    /// matrix runner so a crashed job is not closed twice.
    pub close_attempted: Arc<AtomicBool>,
}

/// `path` made absolute against the current directory.
///
/// Commands run with the working directory as their cwd, so relative paths
/// handed to them would resolve twice.
pub fn absolute_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

impl JobContext {
    pub fn new(
        job: Job,
        config: &PipelineConfig,
        reporter_id: ReporterId,
        runner: Arc<dyn CommandRunner>,
        reporter: Arc<dyn ReportingService>,
    ) -> Self {
        let workdir = absolute_path(&config.workdir);

        let mut data_file = config.tests.coverage_file.clone().into_os_string();
        data_file.push(format!(".{}", job.id));
        let data_file = workdir.join(data_file);

        let mut env = job.env.clone();
        env.insert(
            config.tests.coverage_env.clone(),
            data_file.to_string_lossy().into_owned(),
        );

        let coverage = CoverageState::new(
            data_file,
            config.tests.package.clone(),
            config.tests.include_tests,
        );

        Self {
            job,
            workdir,
            env,
            reporter_id,
            runner,
            reporter,
            coverage,
            result_code: None,
            aborted: false,
            report_path: None,
            close_attempted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_close_attempted(&self) {
        self.close_attempted.store(true, Ordering::SeqCst);
    }

    /// Build an invocation from a templated argv, in the job's workdir and env.
    pub fn invocation(&self, label: impl Into<String>, template: &[String]) -> Result<Invocation> {
        Ok(
            Invocation::from_argv(label, self.job.render(template), self.workdir.clone())?
                .with_env(&self.env),
        )
    }

    pub fn session_scope(&self) -> SessionScope {
        SessionScope {
            job_id: self.job.id.clone(),
            workdir: self.workdir.clone(),
            env: self.env.clone(),
        }
    }

    /// Record the test result; it is set once and exported to later phases.
    pub fn set_result_code(&mut self, code: i32) {
        if self.result_code.is_none() {
            self.result_code = Some(code);
            self.env.insert(TEST_RESULT_ENV.to_string(), code.to_string());
        }
    }

    /// Code handed to the closing step.
    pub fn closing_code(&self) -> i32 {
        if self.aborted {
            return SETUP_FAILURE_CODE;
        }
        self.result_code.unwrap_or(SETUP_FAILURE_CODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ProcessRunner;
    use crate::matrix::Matrix;
    use crate::reporting::NoopReporter;

    fn context() -> JobContext {
        let config = PipelineConfig::default();
        let job = Matrix::expand(&config).unwrap().remove(0);
        JobContext::new(
            job,
            &config,
            ReporterId::new("abc"),
            Arc::new(ProcessRunner::new()),
            Arc::new(NoopReporter),
        )
    }

    #[test]
    fn test_closing_code_defaults_to_setup_failure() {
        let ctx = context();
        assert_eq!(ctx.closing_code(), SETUP_FAILURE_CODE);
    }

    #[test]
    fn test_result_code_is_set_once() {
        let mut ctx = context();
        ctx.set_result_code(1);
        ctx.set_result_code(0);
        assert_eq!(ctx.result_code, Some(1));
        assert_eq!(ctx.closing_code(), 1);
        assert_eq!(ctx.env.get(TEST_RESULT_ENV).map(String::as_str), Some("1"));
    }

    #[test]
    fn test_aborted_overrides_result() {
        let mut ctx = context();
        ctx.set_result_code(0);
        ctx.aborted = true;
        assert_eq!(ctx.closing_code(), SETUP_FAILURE_CODE);
    }

    #[test]
    fn test_invocation_renders_and_carries_env() {
        let ctx = context();
        let inv = ctx
            .invocation("install", &["{interpreter}{version}".to_string(), "-V".to_string()])
            .unwrap();
        assert_eq!(inv.program, "python2.7");
        assert_eq!(
            inv.env.get(crate::matrix::INTERPRETER_VERSION_ENV).map(String::as_str),
            Some("2.7")
        );
        assert!(inv.cwd.is_absolute());
        assert_eq!(inv.cwd, absolute_path(Path::new(".")));
    }

    #[test]
    fn test_coverage_file_is_job_scoped() {
        let mut config = PipelineConfig::default();
        config.matrix.versions = vec!["2.7".to_string(), "3.6".to_string()];
        let contexts: Vec<JobContext> = Matrix::expand(&config)
            .unwrap()
            .into_iter()
            .map(|job| {
                JobContext::new(
                    job,
                    &config,
                    ReporterId::new("abc"),
                    Arc::new(ProcessRunner::new()),
                    Arc::new(NoopReporter),
                )
            })
            .collect();

        let first = &contexts[0].coverage.data_file;
        let second = &contexts[1].coverage.data_file;
        assert_ne!(first, second);
        assert!(first.is_absolute());
        assert!(first.ends_with(".coverage.python-2.7"));
        assert_eq!(
            contexts[0].env.get("COVERAGE_FILE").map(String::as_str),
            Some(first.to_string_lossy().as_ref())
        );
    }
}
