//! Post-test reporter: session closure and coverage export.

use crate::config::ExportConfig;
use crate::context::JobContext;
use crate::phase::{Phase, PhaseKind, PhaseOutcome};
use async_trait::async_trait;
use tracing::{info, warn};

/// Signals `after-build` with the captured result code.
#[derive(Debug, Default)]
pub struct CloseSessionPhase;

#[async_trait]
impl Phase for CloseSessionPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::CloseSession
    }

    fn describe(&self, ctx: &JobContext) -> Vec<String> {
        vec![format!(
            "{} reporter: after-build --exit-code <test result>",
            ctx.reporter.name()
        )]
    }

    async fn run(&self, ctx: &mut JobContext) -> PhaseOutcome {
        let code = ctx.closing_code();
        let scope = ctx.session_scope();
        ctx.mark_close_attempted();
        match ctx.reporter.close_session(&ctx.reporter_id, &scope, code).await {
            Ok(()) => {
                info!(job = %ctx.job.id, exit_code = code, "Reporting session closed");
                PhaseOutcome::Passed
            }
            Err(e) => {
                warn!(job = %ctx.job.id, exit_code = code, error = %e, "Failed to close reporting session");
                PhaseOutcome::failed(format!("after-build failed: {}", e))
            }
        }
    }
}

/// Converts the raw coverage data into a portable report.
pub struct ExportCoveragePhase {
    config: ExportConfig,
}

impl ExportCoveragePhase {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Phase for ExportCoveragePhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::ExportCoverage
    }

    fn describe(&self, ctx: &JobContext) -> Vec<String> {
        vec![ctx.job.render(&self.config.command).join(" ")]
    }

    async fn run(&self, ctx: &mut JobContext) -> PhaseOutcome {
        let invocation = match ctx.invocation("coverage export", &self.config.command) {
            Ok(inv) => inv,
            Err(e) => return PhaseOutcome::failed(e.to_string()),
        };

        match ctx.runner.run(&invocation).await {
            Ok(output) if output.passed() => {
                let report = ctx.workdir.join(ctx.job.render_arg(&self.config.output));
                if report.exists() {
                    info!(job = %ctx.job.id, report = %report.display(), "Coverage report exported");
                    ctx.report_path = Some(report);
                } else {
                    warn!(job = %ctx.job.id, report = %report.display(), "Export succeeded but report is missing");
                }
                PhaseOutcome::Passed
            }
            Ok(output) => PhaseOutcome::failed(format!(
                "coverage export exited with code {}",
                output.exit_code
            )),
            Err(e) => PhaseOutcome::failed(format!("coverage export: {}", e)),
        }
    }
}
