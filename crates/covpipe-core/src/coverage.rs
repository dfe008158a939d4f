//! Coverage state owned by a single job.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::debug;

/// Command-line dialect used to switch coverage on in the test runner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageFlags {
    /// nose: `--with-coverage --cover-erase --cover-package=P --cover-tests`
    #[default]
    Nose,

    /// pytest-cov: `--cov=P [--cov=tests] --cov-report=`
    PytestCov,
}

impl CoverageFlags {
    /// Flags appended to the test command.
    pub fn args(&self, package: Option<&str>, include_tests: bool) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            CoverageFlags::Nose => {
                args.push("--with-coverage".to_string());
                args.push("--cover-erase".to_string());
                if let Some(package) = package {
                    args.push(format!("--cover-package={}", package));
                }
                if include_tests {
                    args.push("--cover-tests".to_string());
                }
            }
            CoverageFlags::PytestCov => {
                match package {
                    Some(package) => args.push(format!("--cov={}", package)),
                    None => args.push("--cov".to_string()),
                }
                if include_tests {
                    args.push("--cov=tests".to_string());
                }
                args.push("--cov-report=".to_string());
            }
        }
        args
    }
}

/// Raw coverage data collected after a test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageDataset {
    pub path: PathBuf,
    pub bytes: u64,
    pub digest: String,
}

/// Coverage accounting for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageState {
    /// Absolute or workdir-joined path of the raw data file.
    pub data_file: PathBuf,

    pub package: Option<String>,

    pub include_tests: bool,

    /// Set once prior data has been removed for this job.
    pub erased: bool,

    pub dataset: Option<CoverageDataset>,
}

impl CoverageState {
    pub fn new(data_file: PathBuf, package: Option<String>, include_tests: bool) -> Self {
        Self {
            data_file,
            package,
            include_tests,
            erased: false,
            dataset: None,
        }
    }

    /// Remove any data left by an earlier run.
    pub async fn erase(&mut self) -> Result<()> {
        match tokio::fs::remove_file(&self.data_file).await {
            Ok(()) => debug!(path = %self.data_file.display(), "Erased previous coverage data"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.erased = true;
        self.dataset = None;
        Ok(())
    }

    /// Read the data file produced by the test run, if any.
    pub async fn collect(&mut self) -> Result<Option<&CoverageDataset>> {
        let bytes = match tokio::fs::read(&self.data_file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.dataset = None;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        self.dataset = Some(CoverageDataset {
            path: self.data_file.clone(),
            bytes: bytes.len() as u64,
            digest: hex::encode(hasher.finalize()),
        });
        Ok(self.dataset.as_ref())
    }
}
