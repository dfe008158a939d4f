//! Matrix runner: executes every expanded job in isolation.
//!
//! Jobs run as independent tokio tasks bounded by a semaphore. A failing or
//! panicking job never prevents the others from running and reporting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::command::CommandRunner;
use crate::config::PipelineConfig;
use crate::context::JobContext;
use crate::driver::{JobPipeline, JobPlan, JobResult};
use crate::error::Result;
use crate::matrix::{Job, Matrix};
use crate::phase::SETUP_FAILURE_CODE;
use crate::reporting::{ReporterId, ReportingService, SessionScope};

/// Outcome of a whole matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixResult {
    pub build_id: String,

    /// Digest of the pipeline configuration that produced the jobs.
    pub config_digest: String,

    /// Job results in matrix order.
    pub jobs: Vec<JobResult>,

    pub started_at: DateTime<Utc>,

    pub duration_ms: u64,
}

impl MatrixResult {
    pub fn success(&self) -> bool {
        self.jobs.iter().all(|j| j.success)
    }

    pub fn passed_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.jobs.iter().filter(|j| !j.success).count()
    }

    /// Process exit code for the whole matrix.
    ///
    /// 0 when every job passed; otherwise the first failing job's code when it
    /// is a valid process status, else 1.
    pub fn exit_code(&self) -> i32 {
        match self.jobs.iter().find(|j| !j.success) {
            None => 0,
            Some(job) if (1..=255).contains(&job.exit_code) => job.exit_code,
            Some(_) => 1,
        }
    }
}

/// What the runner keeps about a job in case its task never returns.
struct CrashWatch {
    job: Job,
    scope: SessionScope,
    close_attempted: Arc<AtomicBool>,
}

/// Runs the jobs of a matrix against shared read-only collaborators.
pub struct MatrixRunner {
    config: Arc<PipelineConfig>,
    pipeline: Arc<JobPipeline>,
    reporter_id: ReporterId,
    runner: Arc<dyn CommandRunner>,
    reporter: Arc<dyn ReportingService>,
}

impl MatrixRunner {
    /// Runner using the standard job pipeline for `config`.
    pub fn new(
        config: PipelineConfig,
        reporter_id: ReporterId,
        runner: Arc<dyn CommandRunner>,
        reporter: Arc<dyn ReportingService>,
    ) -> Self {
        let pipeline = JobPipeline::standard(&config);
        Self::with_pipeline(config, pipeline, reporter_id, runner, reporter)
    }

    pub fn with_pipeline(
        config: PipelineConfig,
        pipeline: JobPipeline,
        reporter_id: ReporterId,
        runner: Arc<dyn CommandRunner>,
        reporter: Arc<dyn ReportingService>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            reporter_id,
            runner,
            reporter,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Context a job would run with; used for dry-run plans.
    pub fn plan(&self) -> Result<Vec<(JobContext, JobPlan)>> {
        let jobs = Matrix::expand(&self.config)?;
        Ok(jobs
            .into_iter()
            .map(|job| {
                let ctx = self.context_for(job);
                let steps = self.pipeline.plan(&ctx);
                (ctx, steps)
            })
            .collect())
    }

    fn context_for(&self, job: Job) -> JobContext {
        JobContext::new(
            job,
            &self.config,
            self.reporter_id.clone(),
            Arc::clone(&self.runner),
            Arc::clone(&self.reporter),
        )
    }

    /// Expand the matrix and run every job.
    #[instrument(skip(self), fields(versions = self.config.matrix.versions.len()))]
    pub async fn run(&self) -> Result<MatrixResult> {
        let start = Instant::now();
        let started_at = Utc::now();
        let build_id = Uuid::new_v4().to_string();
        let config_digest = self.config.digest()?;
        let jobs = Matrix::expand(&self.config)?;

        info!(
            build_id = %build_id,
            jobs = jobs.len(),
            parallelism = self.config.matrix.parallelism,
            "Starting matrix"
        );

        let sem = Arc::new(Semaphore::new(self.config.matrix.parallelism));
        let mut tasks = Vec::with_capacity(jobs.len());

        for job in jobs {
            let ctx = self.context_for(job.clone());
            let watch = CrashWatch {
                job,
                scope: ctx.session_scope(),
                close_attempted: Arc::clone(&ctx.close_attempted),
            };
            let pipeline = Arc::clone(&self.pipeline);
            let sem = Arc::clone(&sem);

            let task = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                pipeline.run(ctx).await
            });
            tasks.push((watch, task));
        }

        let (watches, handles): (Vec<CrashWatch>, Vec<_>) = tasks.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut results = Vec::with_capacity(joined.len());
        for (outcome, watch) in joined.into_iter().zip(watches) {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(job = %watch.job.id, error = %e, "Job task ended abnormally");
                    results.push(self.recover_crashed(watch, e.to_string()).await);
                }
            }
        }

        let result = MatrixResult {
            build_id,
            config_digest,
            jobs: results,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            passed = result.passed_count(),
            failed = result.failed_count(),
            exit_code = result.exit_code(),
            "Matrix finished"
        );

        Ok(result)
    }

    /// Result for a crashed job, closing its session if the job never got to.
    async fn recover_crashed(&self, watch: CrashWatch, reason: String) -> JobResult {
        let mut result = JobResult::crashed(watch.job, format!("job task failed: {}", reason));
        if watch.close_attempted.load(Ordering::SeqCst) {
            return result;
        }

        match self
            .reporter
            .close_session(&self.reporter_id, &watch.scope, SETUP_FAILURE_CODE)
            .await
        {
            Ok(()) => info!(job = %watch.scope.job_id, "Closed reporting session of crashed job"),
            Err(e) => {
                warn!(job = %watch.scope.job_id, error = %e, "Failed to close session of crashed job");
                result.report_error = Some(format!("after-build failed: {}", e));
            }
        }
        result
    }
}
