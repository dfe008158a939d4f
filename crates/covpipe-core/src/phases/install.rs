//! Dependency installer phase.

use crate::config::{InstallAction, Installer, InstallersConfig};
use crate::context::JobContext;
use crate::phase::{Phase, PhaseKind, PhaseOutcome};
use async_trait::async_trait;
use tracing::{error, info};

/// Runs the dependency set in declared order and stops at the first failure.
pub struct InstallPhase {
    actions: Vec<InstallAction>,
    installers: InstallersConfig,
}

impl InstallPhase {
    pub fn new(actions: Vec<InstallAction>, installers: InstallersConfig) -> Self {
        Self {
            actions,
            installers,
        }
    }

    fn action_argv(&self, action: &InstallAction) -> Result<Vec<String>, String> {
        let mut argv = self.installers.command_for(action.installer).to_vec();
        argv.push(action.target().map_err(|e| e.to_string())?);
        Ok(argv)
    }

    fn refresh_argv(&self) -> Option<&[String]> {
        let refresh = &self.installers.system.refresh;
        (!refresh.is_empty()).then_some(refresh.as_slice())
    }

    async fn run_step(ctx: &JobContext, label: &str, argv: &[String]) -> Result<(), String> {
        let invocation = ctx.invocation(label, argv).map_err(|e| e.to_string())?;
        match ctx.runner.run(&invocation).await {
            Ok(output) if output.passed() => Ok(()),
            Ok(output) => Err(format!(
                "{} exited with code {}",
                label, output.exit_code
            )),
            Err(e) => Err(format!("{}: {}", label, e)),
        }
    }
}

#[async_trait]
impl Phase for InstallPhase {
    fn kind(&self) -> PhaseKind {
        PhaseKind::Install
    }

    fn describe(&self, ctx: &JobContext) -> Vec<String> {
        let mut steps = Vec::new();
        let mut refreshed = false;
        for action in &self.actions {
            if action.installer == Installer::System && !refreshed {
                if let Some(refresh) = self.refresh_argv() {
                    steps.push(ctx.job.render(refresh).join(" "));
                }
                refreshed = true;
            }
            match self.action_argv(action) {
                Ok(argv) => steps.push(ctx.job.render(&argv).join(" ")),
                Err(reason) => steps.push(format!("<invalid: {}>", reason)),
            }
        }
        steps
    }

    async fn run(&self, ctx: &mut JobContext) -> PhaseOutcome {
        let mut refreshed = false;

        for (index, action) in self.actions.iter().enumerate() {
            let position = index + 1;

            if action.installer == Installer::System && !refreshed {
                if let Some(refresh) = self.refresh_argv() {
                    if let Err(reason) = Self::run_step(ctx, "system package index refresh", refresh).await {
                        error!(job = %ctx.job.id, %reason, "Package index refresh failed");
                        return PhaseOutcome::failed(reason);
                    }
                }
                refreshed = true;
            }

            let label = format!("install action {} ({})", position, action.label());
            let argv = match self.action_argv(action) {
                Ok(argv) => argv,
                Err(reason) => return PhaseOutcome::failed(format!("{}: {}", label, reason)),
            };

            info!(job = %ctx.job.id, action = %action.label(), position, "Installing dependency");
            if let Err(reason) = Self::run_step(ctx, &label, &argv).await {
                error!(job = %ctx.job.id, %reason, "Dependency install failed");
                return PhaseOutcome::failed(reason);
            }
        }

        PhaseOutcome::Passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::fakes::{RecordingReporter, ScriptedRunner};
    use crate::matrix::Matrix;
    use crate::reporting::ReporterId;
    use std::sync::Arc;

    fn context(runner: Arc<ScriptedRunner>) -> JobContext {
        let config = PipelineConfig::default();
        let job = Matrix::expand(&config).unwrap().remove(0);
        JobContext::new(
            job,
            &config,
            ReporterId::new("abc"),
            runner,
            Arc::new(RecordingReporter::new()),
        )
    }

    fn phase(actions: Vec<InstallAction>) -> InstallPhase {
        InstallPhase::new(actions, InstallersConfig::default())
    }

    #[tokio::test]
    async fn test_refresh_runs_once_before_first_system_action() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctx = context(runner.clone());
        let install = phase(vec![
            InstallAction::package(Installer::Language, "coverage"),
            InstallAction::package(Installer::System, "graphviz"),
            InstallAction::package(Installer::System, "libffi-dev"),
        ]);

        assert_eq!(install.run(&mut ctx).await, PhaseOutcome::Passed);
        assert_eq!(
            runner.command_lines(),
            vec![
                "pip install coverage",
                "sudo apt-get update -qq",
                "sudo apt-get install -qq graphviz",
                "sudo apt-get install -qq libffi-dev",
            ]
        );
    }

    #[tokio::test]
    async fn test_no_refresh_without_system_actions() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctx = context(runner.clone());
        let install = phase(vec![InstallAction::local(Installer::Language, ".")]);

        assert_eq!(install.run(&mut ctx).await, PhaseOutcome::Passed);
        assert_eq!(runner.command_lines(), vec!["pip install ."]);
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let runner = Arc::new(ScriptedRunner::new().exit("pip install .", 1));
        let mut ctx = context(runner.clone());
        let install = phase(vec![
            InstallAction::local(Installer::Language, "."),
            InstallAction::package(Installer::Language, "coveralls"),
        ]);

        let outcome = install.run(&mut ctx).await;
        assert_eq!(
            outcome,
            PhaseOutcome::failed("install action 1 (language:.) exited with code 1")
        );
        assert!(!runner.ran("coveralls"));
    }

    #[tokio::test]
    async fn test_empty_dependency_set_passes() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctx = context(runner.clone());
        assert_eq!(phase(Vec::new()).run(&mut ctx).await, PhaseOutcome::Passed);
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn test_describe_lists_rendered_steps() {
        let ctx = context(Arc::new(ScriptedRunner::new()));
        let install = phase(vec![
            InstallAction::package(Installer::System, "graphviz"),
            InstallAction::local(Installer::Language, "."),
        ]);
        assert_eq!(
            install.describe(&ctx),
            vec![
                "sudo apt-get update -qq",
                "sudo apt-get install -qq graphviz",
                "pip install .",
            ]
        );
    }
}
