//! Ordered per-job event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JOB_STARTED: &str = "job_started";
pub const PHASE_STARTED: &str = "phase_started";
pub const PHASE_PASSED: &str = "phase_passed";
pub const PHASE_FAILED: &str = "phase_failed";
pub const PHASE_SKIPPED: &str = "phase_skipped";
pub const TESTS_COMPLETED: &str = "tests_completed";
pub const JOB_FINISHED: &str = "job_finished";

/// One entry of a job's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// 1-based position in the log.
    pub seq: u64,
    pub kind: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// The `phase` field of the payload, if any.
    pub fn phase(&self) -> Option<&str> {
        self.payload["phase"].as_str()
    }
}

/// Append-only log with monotonically increasing sequence numbers.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Vec<JobEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: &str, payload: Value) {
        let seq = self.events.len() as u64 + 1;
        self.events.push(JobEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<JobEvent> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_numbers_increase() {
        let mut log = EventLog::new();
        log.record(JOB_STARTED, json!({}));
        log.record(PHASE_STARTED, json!({ "phase": "install" }));
        let events = log.into_events();
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
        assert_eq!(events[1].phase(), Some("install"));
        assert_eq!(events[0].phase(), None);
    }
}
