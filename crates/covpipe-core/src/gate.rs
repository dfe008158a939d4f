//! Matrix gate evaluation over the per-job event logs.

use crate::driver::JobResult;
use crate::events::{self, JobEvent};
use crate::phase::PhaseKind;
use serde::{Deserialize, Serialize};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Problems that were surfaced but do not affect the outcome.
    pub warnings: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Matrix gate rules.
pub struct MatrixGate;

impl MatrixGate {
    /// Evaluate a set of job results.
    ///
    /// Gate rule, per job:
    /// - a fail-fast phase failure is a violation
    /// - a `tests_completed` event with a non-zero result code is a violation
    /// - the closing phase must have started exactly once
    /// - a job without `job_finished` never completed
    ///
    /// Closing and export failures are warnings only.
    pub fn evaluate(jobs: &[JobResult]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        for job in jobs {
            let name = job.job.id.to_string();
            let (job_violations, job_warnings) = Self::evaluate_events(&name, &job.events);
            violations.extend(job_violations);
            warnings.extend(job_warnings);

            if job.events.is_empty() {
                if let Some(failure) = &job.failure {
                    violations.push(format!("Job '{}' crashed: {}", name, failure));
                }
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            format!("All {} job(s) passed", jobs.len())
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            warnings,
            message,
        }
    }

    /// Violations and warnings for a single job's event log.
    pub fn evaluate_events(job: &str, log: &[JobEvent]) -> (Vec<String>, Vec<String>) {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();
        let mut closes = 0usize;
        let mut finished = false;

        let close = PhaseKind::CloseSession.name();
        let export = PhaseKind::ExportCoverage.name();

        for event in log {
            let phase = event.phase().unwrap_or("unknown");
            match event.kind.as_str() {
                events::PHASE_STARTED if phase == close => closes += 1,
                events::TESTS_COMPLETED => {
                    let code = event.payload["result_code"].as_i64().unwrap_or(-1);
                    if code != 0 {
                        violations.push(format!(
                            "Job '{}' tests returned non-zero result code: {}",
                            job, code
                        ));
                    }
                }
                events::PHASE_FAILED => {
                    let error = event.payload["error"]
                        .as_str()
                        .unwrap_or("Unknown error")
                        .to_string();
                    if phase == close || phase == export {
                        warnings.push(format!("Job '{}' {} failed: {}", job, phase, error));
                    } else {
                        violations.push(format!(
                            "Job '{}' aborted during {}: {}",
                            job, phase, error
                        ));
                    }
                }
                events::JOB_FINISHED => finished = true,
                _ => {}
            }
        }

        if !log.is_empty() {
            if closes != 1 {
                violations.push(format!(
                    "Job '{}' closed its reporting session {} time(s), expected exactly once",
                    job, closes
                ));
            }
            if !finished {
                violations.push(format!("Job '{}' never finished", job));
            }
        }

        (violations, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(seq: u64, kind: &str, payload: serde_json::Value) -> JobEvent {
        JobEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    fn passing_log() -> Vec<JobEvent> {
        vec![
            event(1, events::JOB_STARTED, json!({})),
            event(2, events::PHASE_STARTED, json!({ "phase": "test_run" })),
            event(3, events::TESTS_COMPLETED, json!({ "phase": "test_run", "result_code": 0 })),
            event(4, events::PHASE_STARTED, json!({ "phase": "close_session" })),
            event(5, events::PHASE_PASSED, json!({ "phase": "close_session" })),
            event(6, events::JOB_FINISHED, json!({ "success": true })),
        ]
    }

    #[test]
    fn test_empty_events_passes() {
        let (violations, warnings) = MatrixGate::evaluate_events("job", &[]);
        assert!(violations.is_empty());
        assert!(warnings.is_empty());
        assert!(MatrixGate::evaluate(&[]).passed);
    }

    #[test]
    fn test_passing_job() {
        let (violations, warnings) = MatrixGate::evaluate_events("job", &passing_log());
        assert!(violations.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_non_zero_result_code() {
        let mut log = passing_log();
        log[2] = event(3, events::TESTS_COMPLETED, json!({ "phase": "test_run", "result_code": 1 }));
        let (violations, _) = MatrixGate::evaluate_events("job", &log);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("non-zero result code: 1"));
    }

    #[test]
    fn test_setup_failure_is_violation() {
        let log = vec![
            event(1, events::JOB_STARTED, json!({})),
            event(2, events::PHASE_STARTED, json!({ "phase": "install" })),
            event(3, events::PHASE_FAILED, json!({ "phase": "install", "error": "apt-get failed" })),
            event(4, events::PHASE_STARTED, json!({ "phase": "close_session" })),
            event(5, events::JOB_FINISHED, json!({})),
        ];
        let (violations, warnings) = MatrixGate::evaluate_events("job", &log);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("aborted during install"));
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_close_failure_is_warning() {
        let mut log = passing_log();
        log[4] = event(
            5,
            events::PHASE_FAILED,
            json!({ "phase": "close_session", "error": "after-build failed" }),
        );
        let (violations, warnings) = MatrixGate::evaluate_events("job", &log);
        assert!(violations.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_missing_close_is_violation() {
        let log: Vec<JobEvent> = passing_log()
            .into_iter()
            .filter(|e| e.phase() != Some("close_session"))
            .collect();
        let (violations, _) = MatrixGate::evaluate_events("job", &log);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("0 time(s)"));
    }

    #[test]
    fn test_unfinished_job_is_violation() {
        let mut log = passing_log();
        log.pop();
        let (violations, _) = MatrixGate::evaluate_events("job", &log);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("never finished"));
    }
}
