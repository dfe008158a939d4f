//! In-memory fakes for the pipeline collaborators (testing only).
//!
//! `RecordingReporter` records every session call and can be told to fail;
//! `ScriptedRunner` records every invocation and answers with scripted exit
//! codes instead of spawning processes.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::command::{CommandOutput, CommandRunner, Invocation};
use crate::error::{PipelineError, Result};
use crate::matrix::JobId;
use crate::reporting::{ReporterId, ReportingService, SessionScope};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// A call received by [`RecordingReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReporterCall {
    Open { job: JobId, id: String },
    Close { job: JobId, id: String, exit_code: i32 },
}

/// Reporter that records calls in order.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    calls: Mutex<Vec<ReporterCall>>,
    fail_open: bool,
    fail_close: bool,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open_session` call fails after being recorded.
    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    /// Every `close_session` call fails after being recorded.
    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ReporterCall> {
        lock(&self.calls).clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, ReporterCall::Open { .. }))
            .count()
    }

    /// Exit codes passed to `close_session`, in call order.
    pub fn close_codes(&self) -> Vec<i32> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                ReporterCall::Close { exit_code, .. } => Some(*exit_code),
                _ => None,
            })
            .collect()
    }

    /// Calls made for one job, in order.
    pub fn calls_for(&self, job: &JobId) -> Vec<ReporterCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| match c {
                ReporterCall::Open { job: j, .. } | ReporterCall::Close { job: j, .. } => j == job,
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ReportingService for RecordingReporter {
    fn name(&self) -> &str {
        "recording"
    }

    async fn open_session(&self, id: &ReporterId, scope: &SessionScope) -> Result<()> {
        lock(&self.calls).push(ReporterCall::Open {
            job: scope.job_id.clone(),
            id: id.expose().to_string(),
        });
        if self.fail_open {
            return Err(PipelineError::Reporter {
                command: "before-build".to_string(),
                exit_code: 1,
            });
        }
        Ok(())
    }

    async fn close_session(
        &self,
        id: &ReporterId,
        scope: &SessionScope,
        exit_code: i32,
    ) -> Result<()> {
        lock(&self.calls).push(ReporterCall::Close {
            job: scope.job_id.clone(),
            id: id.expose().to_string(),
            exit_code,
        });
        if self.fail_close {
            return Err(PipelineError::Reporter {
                command: "after-build".to_string(),
                exit_code: 1,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// Scripted answer for matching invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    Exit(i32),
    SpawnError,
}

/// Runner that never spawns anything.
///
/// The first rule whose pattern is contained in the invocation's command
/// line decides the answer; unmatched invocations exit 0.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<(String, ScriptedResponse)>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, pattern: &str, response: ScriptedResponse) -> Self {
        self.rules.push((pattern.to_string(), response));
        self
    }

    pub fn exit(self, pattern: &str, code: i32) -> Self {
        self.respond(pattern, ScriptedResponse::Exit(code))
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    /// Command lines seen so far, in order.
    pub fn command_lines(&self) -> Vec<String> {
        lock(&self.invocations)
            .iter()
            .map(Invocation::command_line)
            .collect()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.command_lines().iter().any(|line| line.contains(pattern))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        lock(&self.invocations).push(invocation.clone());

        let line = invocation.command_line();
        let response = self
            .rules
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or(ScriptedResponse::Exit(0));

        match response {
            ScriptedResponse::Exit(exit_code) => Ok(CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
            }),
            ScriptedResponse::SpawnError => Err(PipelineError::Spawn {
                program: invocation.program.clone(),
                message: "scripted spawn failure".to_string(),
            }),
        }
    }
}
