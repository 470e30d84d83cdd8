//! Facade used by the CLI and the web layer: create, read, run and sweep jobs.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use comps_adapters::{build_adapters, SourceRegistry};
use comps_core::{JobId, ScrapeJob, ScrapeQuery, StoredComparable};
use comps_storage::{
    ComparableFilter, ComparableStore, HttpFetcher, JobStore, MemoryComparableStore,
    MemoryJobStore, PgStore,
};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::{PipelineConfig, PipelineError, PipelineRunner, ScrapeAgent};

/// Queued jobs picked up per worker sweep.
pub const SWEEP_BATCH: usize = 25;

#[derive(Clone)]
pub struct JobService {
    jobs: Arc<dyn JobStore>,
    comparables: Arc<dyn ComparableStore>,
    runner: Arc<PipelineRunner>,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        comparables: Arc<dyn ComparableStore>,
        agent: ScrapeAgent,
        error_max_chars: usize,
    ) -> Self {
        let runner = PipelineRunner::new(
            jobs.clone(),
            comparables.clone(),
            Arc::new(agent),
            error_max_chars,
        );
        Self {
            jobs,
            comparables,
            runner: Arc::new(runner),
        }
    }

    /// Builds the adapter chain from the source registry and picks Postgres
    /// when `DATABASE_URL` is set, in-memory stores otherwise.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let registry = SourceRegistry::load(&config.sources_file).await?;
        let adapters = build_adapters(&registry, http).context("building source adapters")?;
        let agent = ScrapeAgent::new(adapters, config.adapter_timeout);
        info!(sources = ?agent.adapter_names(), "adapter chain ready");

        match &config.database_url {
            Some(url) => {
                let store = Arc::new(
                    PgStore::connect(url)
                        .await
                        .context("connecting to postgres")?,
                );
                store.migrate().await.context("running migrations")?;
                Ok(Self::new(
                    store.clone(),
                    store,
                    agent,
                    config.error_max_chars,
                ))
            }
            None => {
                warn!("DATABASE_URL not set; jobs and comparables live in memory only");
                Ok(Self::new(
                    Arc::new(MemoryJobStore::new()),
                    Arc::new(MemoryComparableStore::new()),
                    agent,
                    config.error_max_chars,
                ))
            }
        }
    }

    pub async fn create(&self, query: ScrapeQuery) -> Result<JobId, PipelineError> {
        query.validate()?;
        let job = ScrapeJob::new(query, Utc::now());
        self.jobs.insert_job(&job).await?;
        info!(job_id = %job.id, address = %job.query.address, "job queued");
        Ok(job.id)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<ScrapeJob>, PipelineError> {
        Ok(self.jobs.get_job(id).await?)
    }

    pub async fn run(&self, id: JobId) -> Result<ScrapeJob, PipelineError> {
        self.runner.run(id).await
    }

    /// Runs the job on a background task; the outcome lands on the job record.
    pub fn spawn(&self, id: JobId) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(err) = service.run(id).await {
                error!(job_id = %id, error = %err, "background job run failed");
            }
        })
    }

    pub async fn create_and_run(&self, query: ScrapeQuery) -> Result<ScrapeJob, PipelineError> {
        let id = self.create(query).await?;
        self.run(id).await
    }

    /// Runs queued jobs oldest first. Jobs claimed by another runner in the
    /// meantime are skipped.
    pub async fn sweep_queued(&self, limit: usize) -> Result<Vec<ScrapeJob>, PipelineError> {
        let queued = self.jobs.queued_jobs(limit).await?;
        if queued.is_empty() {
            debug!("no queued jobs");
            return Ok(Vec::new());
        }
        info!(count = queued.len(), "sweeping queued jobs");

        let mut finished = Vec::with_capacity(queued.len());
        for id in queued {
            match self.run(id).await {
                Ok(job) => finished.push(job),
                Err(err) if err.is_conflict() => {
                    debug!(job_id = %id, "job already claimed; skipping");
                }
                Err(err) => {
                    warn!(job_id = %id, error = %err, "queued job could not be run");
                }
            }
        }
        Ok(finished)
    }

    pub async fn search_comparables(
        &self,
        filter: &ComparableFilter,
    ) -> Result<Vec<StoredComparable>, PipelineError> {
        Ok(self.comparables.search(filter).await?)
    }

    /// Cron-driven sweep of queued jobs. `None` when the worker is disabled.
    pub async fn build_scheduler(&self, config: &PipelineConfig) -> Result<Option<JobScheduler>> {
        if !config.worker_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let service = self.clone();
        let cron = config.worker_cron.as_str();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                match service.sweep_queued(SWEEP_BATCH).await {
                    Ok(jobs) if !jobs.is_empty() => info!(ran = jobs.len(), "worker sweep finished"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "worker sweep failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
