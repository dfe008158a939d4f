//! Matrix expansion: one independent job per interpreter version.

use crate::config::PipelineConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Variable holding the interpreter name inside a job.
pub const INTERPRETER_ENV: &str = "COVPIPE_INTERPRETER";

/// Variable holding the interpreter version inside a job.
pub const INTERPRETER_VERSION_ENV: &str = "COVPIPE_INTERPRETER_VERSION";

/// Variable holding the 1-based job number inside a job.
pub const JOB_NUMBER_ENV: &str = "COVPIPE_JOB_NUMBER";

/// Stable job identifier, e.g. `python-2.7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One matrix-expanded build run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    /// 1-based position in the matrix.
    pub number: usize,

    pub interpreter: String,

    pub version: String,

    /// Variables set once at job start and never mutated afterwards.
    pub env: BTreeMap<String, String>,

    /// SHA-256 over the pipeline digest and the version.
    pub digest: String,
}

impl Job {
    /// Substitute `{interpreter}`, `{version}` and `{job}` in one argument.
    pub fn render_arg(&self, arg: &str) -> String {
        arg.replace("{interpreter}", &self.interpreter)
            .replace("{version}", &self.version)
            .replace("{job}", &self.id.0)
    }

    pub fn render(&self, template: &[String]) -> Vec<String> {
        template.iter().map(|arg| self.render_arg(arg)).collect()
    }

    /// First 12 characters of the job digest.
    pub fn short_digest(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}

/// Matrix expander.
pub struct Matrix;

impl Matrix {
    /// Produce one job per configured version, in declared order.
    ///
    /// Jobs share only read-only global configuration: each gets its own copy
    /// of the global variables plus its interpreter identity.
    pub fn expand(config: &PipelineConfig) -> Result<Vec<Job>> {
        config.validate()?;
        let pipeline_digest = config.digest()?;
        let interpreter = config.matrix.interpreter.clone();

        let jobs = config
            .matrix
            .versions
            .iter()
            .enumerate()
            .map(|(index, version)| {
                let number = index + 1;
                let mut env = config.env.clone();
                env.insert(INTERPRETER_ENV.to_string(), interpreter.clone());
                env.insert(INTERPRETER_VERSION_ENV.to_string(), version.clone());
                env.insert(JOB_NUMBER_ENV.to_string(), number.to_string());

                Job {
                    id: JobId(format!("{}-{}", interpreter, version)),
                    number,
                    interpreter: interpreter.clone(),
                    version: version.clone(),
                    env,
                    digest: job_digest(&pipeline_digest, version),
                }
            })
            .collect();

        Ok(jobs)
    }
}

fn job_digest(pipeline_digest: &str, version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pipeline_digest.as_bytes());
    hasher.update(b"\0");
    hasher.update(version.as_bytes());
    hex::encode(hasher.finalize())
}
