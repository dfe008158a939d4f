//! Reporting sessions with the external quality-tracking service.
//!
//! A session is opened before the tests (`before-build`) and closed after
//! them (`after-build --exit-code N`). The service is an injectable
//! collaborator: [`HelperReporter`] drives the real helper executable,
//! [`NoopReporter`] does nothing, and `fakes::RecordingReporter` records calls.

use crate::command::{CommandRunner, Invocation};
use crate::config::ReporterConfig;
use crate::context::absolute_path;
use crate::error::{PipelineError, Result};
use crate::matrix::JobId;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Reporting-service identifier.
///
/// `Debug` and `Display` redact the value; use [`ReporterId::expose`] when
/// handing it to the helper.
#[derive(Clone, PartialEq, Eq)]
pub struct ReporterId(String);

impl ReporterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReporterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReporterId(***)")
    }
}

impl fmt::Display for ReporterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

/// Job-local information a reporter needs to run its helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionScope {
    pub job_id: JobId,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// External quality-reporting service.
#[async_trait]
pub trait ReportingService: Send + Sync {
    fn name(&self) -> &str;

    /// Signal "build starting".
    async fn open_session(&self, id: &ReporterId, scope: &SessionScope) -> Result<()>;

    /// Signal the terminal status of the session.
    async fn close_session(&self, id: &ReporterId, scope: &SessionScope, exit_code: i32)
        -> Result<()>;
}

/// Reporter that accepts every call and does nothing.
#[derive(Debug, Default, Clone)]
pub struct NoopReporter;

#[async_trait]
impl ReportingService for NoopReporter {
    fn name(&self) -> &str {
        "noop"
    }

    async fn open_session(&self, _id: &ReporterId, scope: &SessionScope) -> Result<()> {
        debug!(job = %scope.job_id, "Reporting disabled, skipping before-build");
        Ok(())
    }

    async fn close_session(
        &self,
        _id: &ReporterId,
        scope: &SessionScope,
        exit_code: i32,
    ) -> Result<()> {
        debug!(job = %scope.job_id, exit_code, "Reporting disabled, skipping after-build");
        Ok(())
    }
}

/// Where the helper executable comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperSource {
    /// Download over HTTP(S).
    Url(String),
    /// Copy a local file.
    File(PathBuf),
}

impl fmt::Display for HelperSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HelperSource::Url(url) => write!(f, "{}", url),
            HelperSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Reporter backed by the external helper executable.
///
/// Every job gets its own copy of the helper, so concurrent jobs never
/// overwrite a helper another job is running. Only jobs whose helper was
/// acquired by this reporter can close a session.
pub struct HelperReporter {
    source: HelperSource,
    helper_path: PathBuf,
    id_env: String,
    timeout_secs: u64,
    runner: Arc<dyn CommandRunner>,
    http_client: reqwest::Client,
    acquired: Mutex<HashSet<JobId>>,
}

impl HelperReporter {
    pub fn new(
        source: HelperSource,
        helper_path: PathBuf,
        id_env: String,
        timeout_secs: u64,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("covpipe/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            source,
            helper_path,
            id_env,
            timeout_secs,
            runner,
            http_client,
            acquired: Mutex::new(HashSet::new()),
        })
    }

    pub fn from_config(config: &ReporterConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let source = match &config.helper_file {
            Some(path) => HelperSource::File(path.clone()),
            None => HelperSource::Url(config.helper_url.clone()),
        };
        Self::new(
            source,
            config.helper_path.clone(),
            config.id_env.clone(),
            config.timeout_secs,
            runner,
        )
    }

    /// Absolute, job-scoped helper location: `<helper_path>-<job id>`.
    pub fn helper_for(&self, scope: &SessionScope) -> PathBuf {
        let mut path = scope.workdir.join(&self.helper_path).into_os_string();
        path.push(format!("-{}", scope.job_id));
        absolute_path(Path::new(&path))
    }

    fn was_acquired(&self, job: &JobId) -> bool {
        self.acquired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(job)
    }

    /// Fetch the helper to `dest` and make it executable.
    pub async fn acquire(&self, dest: &Path) -> Result<()> {
        match &self.source {
            HelperSource::Url(url) => {
                info!(url = %url, dest = %dest.display(), "Downloading reporting helper");
                let bytes = self
                    .http_client
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .bytes()
                    .await?;
                tokio::fs::write(dest, &bytes).await?;
            }
            HelperSource::File(path) => {
                debug!(from = %path.display(), dest = %dest.display(), "Copying reporting helper");
                tokio::fs::copy(path, dest)
                    .await
                    .map_err(|e| PipelineError::HelperFetch {
                        source_desc: path.display().to_string(),
                        message: e.to_string(),
                    })?;
            }
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755)).await?;
        }

        Ok(())
    }

    async fn invoke(
        &self,
        helper: &Path,
        args: &[String],
        id: &ReporterId,
        scope: &SessionScope,
    ) -> Result<()> {
        let mut argv = vec![helper.to_string_lossy().into_owned()];
        argv.extend(args.iter().cloned());

        let invocation = Invocation::from_argv(
            format!("reporter {}", args.first().map(String::as_str).unwrap_or("")),
            argv,
            scope.workdir.clone(),
        )?
        .with_env(&scope.env)
        .with_var(&self.id_env, id.expose())
        .with_timeout(self.timeout_secs);

        let output = self.runner.run(&invocation).await?;
        if !output.passed() {
            return Err(PipelineError::Reporter {
                command: args.join(" "),
                exit_code: output.exit_code,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReportingService for HelperReporter {
    fn name(&self) -> &str {
        "helper"
    }

    async fn open_session(&self, id: &ReporterId, scope: &SessionScope) -> Result<()> {
        let helper = self.helper_for(scope);
        self.acquire(&helper).await?;
        self.acquired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.job_id.clone());
        self.invoke(&helper, &["before-build".to_string()], id, scope)
            .await
    }

    async fn close_session(
        &self,
        id: &ReporterId,
        scope: &SessionScope,
        exit_code: i32,
    ) -> Result<()> {
        let helper = self.helper_for(scope);
        if !self.was_acquired(&scope.job_id) {
            return Err(PipelineError::HelperFetch {
                source_desc: self.source.to_string(),
                message: format!(
                    "helper was never acquired for job {} at {}",
                    scope.job_id,
                    helper.display()
                ),
            });
        }
        let args = vec![
            "after-build".to_string(),
            "--exit-code".to_string(),
            exit_code.to_string(),
        ];
        self.invoke(&helper, &args, id, scope).await
    }
}
