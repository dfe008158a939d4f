//! Test runner phase with coverage instrumentation.

use crate::config::TestConfig;
use crate::context::JobContext;
use crate::phase::{Phase, PhaseKind, PhaseOutcome};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Result code recorded when the test command could not run at all.
pub const TEST_EXECUTION_ERROR_CODE: i32 = -1;

/// Erases prior coverage, then runs the suite with coverage enabled.
pub struct TestRunPhase {
    config: TestConfig,
}

impl TestRunPhase {
    pub fn new(config: TestConfig) -> Self {
        Self { config }
    }

    fn argv(&self) -> Vec<String> {
        let mut argv = self.config.command.clone();
        argv.extend(
            self.config
                .flags
                .args(self.config.package.as_deref(), self.config.include_tests),
        );
        argv
    }
}

#[async_trait]
impl Phase for TestRunPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::TestRun
    }

    fn describe(&self, ctx: &JobContext) -> Vec<String> {
        vec![
            format!("erase {}", ctx.coverage.data_file.display()),
            ctx.job.render(&self.argv()).join(" "),
        ]
    }

    async fn run(&self, ctx: &mut JobContext) -> PhaseOutcome {
        // No test run may see coverage data from an earlier job.
        if let Err(e) = ctx.coverage.erase().await {
            error!(job = %ctx.job.id, error = %e, "Failed to erase coverage data");
            return PhaseOutcome::failed(format!("coverage erase failed: {}", e));
        }

        let invocation = match ctx.invocation("test suite", &self.argv()) {
            Ok(inv) => inv.with_timeout(self.config.timeout_secs),
            Err(e) => return PhaseOutcome::failed(e.to_string()),
        };

        info!(job = %ctx.job.id, command = %invocation.command_line(), "Running test suite");

        let result_code = match ctx.runner.run(&invocation).await {
            Ok(output) => output.exit_code,
            Err(e) => {
                warn!(job = %ctx.job.id, error = %e, "Test suite could not complete");
                TEST_EXECUTION_ERROR_CODE
            }
        };

        match ctx.coverage.collect().await {
            Ok(Some(dataset)) => {
                info!(job = %ctx.job.id, bytes = dataset.bytes, "Collected coverage data")
            }
            Ok(None) => warn!(job = %ctx.job.id, "Test run left no coverage data"),
            Err(e) => warn!(job = %ctx.job.id, error = %e, "Failed to read coverage data"),
        }

        PhaseOutcome::Completed { result_code }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::fakes::{RecordingReporter, ScriptedResponse, ScriptedRunner};
    use crate::matrix::Matrix;
    use crate::reporting::ReporterId;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn context(config: &PipelineConfig, runner: Arc<ScriptedRunner>) -> JobContext {
        let job = Matrix::expand(config).unwrap().remove(0);
        JobContext::new(
            job,
            config,
            ReporterId::new("abc"),
            runner,
            Arc::new(RecordingReporter::new()),
        )
    }

    fn config_in(dir: &std::path::Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.workdir = dir.to_path_buf();
        config.tests.package = Some("barf".to_string());
        config
    }

    #[tokio::test]
    async fn test_runs_with_coverage_flags_and_erases_first() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let runner = Arc::new(ScriptedRunner::new().exit("nosetests", 1));
        let mut ctx = context(&config, runner.clone());
        let data_file = ctx.coverage.data_file.clone();
        assert!(data_file.ends_with(".coverage.python-2.7"));
        std::fs::write(&data_file, b"stale").unwrap();

        let outcome = TestRunPhase::new(config.tests.clone()).run(&mut ctx).await;

        assert_eq!(outcome, PhaseOutcome::Completed { result_code: 1 });
        assert!(ctx.coverage.erased);
        assert!(!data_file.exists());
        assert_eq!(
            runner.invocations()[0].env.get("COVERAGE_FILE"),
            Some(&data_file.to_string_lossy().into_owned())
        );
        assert!(ctx.coverage.dataset.is_none());
        assert_eq!(
            runner.command_lines(),
            vec!["nosetests --with-coverage --cover-erase --cover-package=barf --cover-tests"]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_completes_with_error_code() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let runner =
            Arc::new(ScriptedRunner::new().respond("nosetests", ScriptedResponse::SpawnError));
        let mut ctx = context(&config, runner);

        let outcome = TestRunPhase::new(config.tests.clone()).run(&mut ctx).await;
        assert_eq!(
            outcome,
            PhaseOutcome::Completed {
                result_code: TEST_EXECUTION_ERROR_CODE
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_is_applied() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.tests.timeout_secs = 600;
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctx = context(&config, runner.clone());

        TestRunPhase::new(config.tests.clone()).run(&mut ctx).await;
        assert_eq!(runner.invocations()[0].timeout_secs, 600);
    }

    #[test]
    fn test_describe_mentions_erase() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let ctx = context(&config, Arc::new(ScriptedRunner::new()));
        let steps = TestRunPhase::new(config.tests.clone()).describe(&ctx);
        assert!(steps[0].starts_with("erase "));
        assert!(steps[1].starts_with("nosetests --with-coverage"));
    }
}
