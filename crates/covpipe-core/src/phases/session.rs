//! Pre-test hook: opens the reporting session.

use crate::context::JobContext;
use crate::phase::{Phase, PhaseKind, PhaseOutcome};
use async_trait::async_trait;
use tracing::{error, info};

/// Acquires the reporting helper and signals `before-build`.
#[derive(Debug, Default)]
pub struct OpenSessionPhase;

#[async_trait]
impl Phase for OpenSessionPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::OpenSession
    }

    fn describe(&self, ctx: &JobContext) -> Vec<String> {
        vec![format!("{} reporter: before-build", ctx.reporter.name())]
    }

    async fn run(&self, ctx: &mut JobContext) -> PhaseOutcome {
        let scope = ctx.session_scope();
        match ctx.reporter.open_session(&ctx.reporter_id, &scope).await {
            Ok(()) => {
                info!(job = %ctx.job.id, reporter = ctx.reporter.name(), "Reporting session opened");
                PhaseOutcome::Passed
            }
            Err(e) => {
                error!(job = %ctx.job.id, error = %e, "Failed to open reporting session");
                PhaseOutcome::failed(format!("before-build failed: {}", e))
            }
        }
    }
}
