//! Drives one job through `Queued -> Running -> Terminal`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use comps_core::{normalize, truncate_chars, JobId, JobMeta, JobOutcome, NormalizedRecord, ScrapeJob};
use comps_storage::{
    classify_store_error, retry_with_backoff, BackoffPolicy, ComparableStore, JobCompletion,
    JobStore,
};
use tracing::{error, info, info_span, warn, Instrument};

use crate::agent::{AgentResult, ScrapeAgent};
use crate::dedupe::dedupe;
use crate::upsert::{UpsertReport, Upserter};
use crate::PipelineError;

/// Retries for the terminal status write. A job whose final write fails stays
/// `running` and is never swept again.
const FINISH_RETRY: BackoffPolicy = BackoffPolicy {
    max_retries: 2,
    base_delay: Duration::from_millis(200),
    max_delay: Duration::from_secs(2),
};

/// Counts and caveats gathered while a job runs.
#[derive(Debug, Clone, Default)]
struct RunReport {
    meta: JobMeta,
    upsert: UpsertReport,
}

pub struct PipelineRunner {
    jobs: Arc<dyn JobStore>,
    agent: Arc<ScrapeAgent>,
    upserter: Upserter,
    error_max_chars: usize,
}

impl PipelineRunner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        comparables: Arc<dyn ComparableStore>,
        agent: Arc<ScrapeAgent>,
        error_max_chars: usize,
    ) -> Self {
        Self {
            jobs,
            agent,
            upserter: Upserter::new(comparables),
            error_max_chars,
        }
    }

    /// Runs a queued job to a terminal state. Errors only when the job cannot be
    /// loaded or its status cannot be written; everything else ends up on the job.
    ///
    /// Running the same id from two callers at once is a caller error; the
    /// loser gets a conflict from the store.
    pub async fn run(&self, id: JobId) -> Result<ScrapeJob, PipelineError> {
        if self.jobs.get_job(id).await?.is_none() {
            return Err(PipelineError::JobNotFound(id));
        }
        let job = self.jobs.mark_running(id, Utc::now()).await?;
        info!(job_id = %id, address = %job.query.address, "job running");

        let span = info_span!("pipeline_run", job_id = %id);
        let outcome = self.execute(&job).instrument(span).await;

        let completion = match outcome {
            Ok(report) => {
                let error = (!report.upsert.errors.is_empty())
                    .then(|| truncate_chars(&report.upsert.errors.join("; "), self.error_max_chars));
                JobCompletion {
                    outcome: JobOutcome::Success,
                    records_inserted: report.upsert.written(),
                    error,
                    meta: report.meta,
                    finished_at: Utc::now(),
                }
            }
            Err(message) => {
                warn!(job_id = %id, error = %message, "job failed");
                JobCompletion {
                    outcome: JobOutcome::Failure,
                    records_inserted: 0,
                    error: Some(truncate_chars(&message, self.error_max_chars)),
                    meta: job.meta.clone().stage("failed", 100),
                    finished_at: Utc::now(),
                }
            }
        };

        let finished = retry_with_backoff(&FINISH_RETRY, classify_store_error, |_| {
            self.jobs.finish_job(id, &completion)
        })
        .await
        .inspect_err(|err| {
            error!(
                job_id = %id,
                error = %err,
                "terminal status write failed; job left in running state"
            );
        })?;
        info!(
            job_id = %id,
            status = %finished.status,
            records_inserted = finished.records_inserted,
            "job finished"
        );
        Ok(finished)
    }

    /// `Err` carries the text stored on a failed job.
    async fn execute(&self, job: &ScrapeJob) -> Result<RunReport, String> {
        job.query
            .validate()
            .map_err(|e| format!("invalid query: {e}"))?;

        let mut meta = JobMeta::default().stage("fetching", 10);
        self.write_meta(job.id, &meta).await;

        let agent = self.agent.clone();
        let query = job.query.clone();
        let fetched: AgentResult = tokio::spawn(async move { agent.run(&query).await })
            .await
            .map_err(|e| match e.try_into_panic() {
                Ok(payload) => format!("pipeline panicked: {}", panic_message(payload.as_ref())),
                Err(e) => format!("pipeline task failed: {e}"),
            })?;

        meta.caveats = fetched.caveats;
        meta.source = fetched.source;
        meta = meta
            .stage("normalizing", 40)
            .count("fetched", fetched.records.len());
        self.write_meta(job.id, &meta).await;

        let (normalized, discarded) = normalize_for_job(job, fetched.records);
        if discarded > 0 {
            meta.caveats
                .push(format!("discarded {discarded} record(s) without an address"));
        }
        let unique = dedupe(normalized);
        meta = meta
            .stage("upserting", 70)
            .count("discarded_addressless", discarded)
            .count("deduplicated", unique.len());
        self.write_meta(job.id, &meta).await;

        let upsert = self.upserter.upsert_all(&unique, job.id, Utc::now()).await;
        meta = meta
            .stage("done", 100)
            .count("inserted", upsert.inserted as usize)
            .count("updated", upsert.updated as usize)
            .count("row_errors", upsert.errors.len());

        Ok(RunReport { meta, upsert })
    }

    async fn write_meta(&self, id: JobId, meta: &JobMeta) {
        if let Err(err) = self.jobs.update_meta(id, meta).await {
            warn!(job_id = %id, error = %err, "progress update failed");
        }
    }
}

/// Fills street-only addresses from the query locality, normalizes, and drops
/// records that still have no address. Returns the kept records and the drop count.
fn normalize_for_job(
    job: &ScrapeJob,
    records: Vec<comps_core::RawRecord>,
) -> (Vec<NormalizedRecord>, usize) {
    let mut discarded = 0usize;
    let kept = records
        .into_iter()
        .filter_map(|mut raw| {
            raw.fill_locality_from(&job.query);
            let record = normalize(&raw);
            if record.has_address() {
                Some(record)
            } else {
                discarded += 1;
                None
            }
        })
        .collect();
    (kept, discarded)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::{raw, Behavior, FakeAdapter};
    use comps_adapters::{HeuristicAdapter, SourceAdapter};
    use comps_core::{JobStatus, ScrapeQuery, SourceTier, DEFAULT_ERROR_MAX_CHARS};
    use async_trait::async_trait;
    use chrono::DateTime;
    use comps_storage::{MemoryComparableStore, MemoryJobStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        jobs: Arc<MemoryJobStore>,
        comparables: Arc<MemoryComparableStore>,
        runner: PipelineRunner,
    }

    fn harness(adapters: Vec<Arc<dyn SourceAdapter>>) -> Harness {
        let jobs = Arc::new(MemoryJobStore::new());
        let comparables = Arc::new(MemoryComparableStore::new());
        let agent = Arc::new(ScrapeAgent::new(adapters, Duration::from_secs(5)));
        let runner = PipelineRunner::new(
            jobs.clone(),
            comparables.clone(),
            agent,
            DEFAULT_ERROR_MAX_CHARS,
        );
        Harness {
            jobs,
            comparables,
            runner,
        }
    }

    /// Delegates to a memory store but drops the first `failures` terminal writes.
    struct FlakyFinish {
        inner: MemoryJobStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for FlakyFinish {
        async fn insert_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
            self.inner.insert_job(job).await
        }

        async fn get_job(&self, id: JobId) -> Result<Option<ScrapeJob>, StoreError> {
            self.inner.get_job(id).await
        }

        async fn mark_running(&self, id: JobId, at: DateTime<Utc>) -> Result<ScrapeJob, StoreError> {
            self.inner.mark_running(id, at).await
        }

        async fn update_meta(&self, id: JobId, meta: &JobMeta) -> Result<(), StoreError> {
            self.inner.update_meta(id, meta).await
        }

        async fn finish_job(
            &self,
            id: JobId,
            completion: &JobCompletion,
        ) -> Result<ScrapeJob, StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.finish_job(id, completion).await
        }

        async fn queued_jobs(&self, limit: usize) -> Result<Vec<JobId>, StoreError> {
            self.inner.queued_jobs(limit).await
        }
    }

    fn flaky_runner(failures: usize) -> (Arc<FlakyFinish>, PipelineRunner) {
        let jobs = Arc::new(FlakyFinish {
            inner: MemoryJobStore::new(),
            failures: AtomicUsize::new(failures),
        });
        let agent = Arc::new(ScrapeAgent::new(
            vec![Arc::new(HeuristicAdapter::default()) as Arc<dyn SourceAdapter>],
            Duration::from_secs(5),
        ));
        let runner = PipelineRunner::new(
            jobs.clone(),
            Arc::new(MemoryComparableStore::new()),
            agent,
            DEFAULT_ERROR_MAX_CHARS,
        );
        (jobs, runner)
    }

    async fn queue(h: &Harness, address: &str) -> JobId {
        let job = ScrapeJob::new(ScrapeQuery::new(address), Utc::now());
        h.jobs.insert_job(&job).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn total_fallback_still_succeeds_with_heuristic_records() {
        let h = harness(vec![
            FakeAdapter::new("primary", SourceTier::Primary, Behavior::Fail("down".into()))
                as Arc<dyn SourceAdapter>,
            FakeAdapter::new("secondary", SourceTier::Secondary, Behavior::Fail("down".into())),
            Arc::new(HeuristicAdapter::default()),
        ]);
        let id = queue(&h, "123 Main St, Nashville, TN").await;
        let job = h.runner.run(id).await.unwrap();

        assert_eq!(job.status, JobStatus::SUCCEEDED);
        assert!(job.records_inserted > 0);
        assert_eq!(job.records_inserted, h.comparables.count().await.unwrap());
        assert!(job.started_at.is_some() && job.finished_at.is_some());
    }

    #[tokio::test]
    async fn zero_records_is_a_success() {
        let h = harness(vec![FakeAdapter::new(
            "primary",
            SourceTier::Primary,
            Behavior::Records(vec![]),
        ) as Arc<dyn SourceAdapter>]);
        let id = queue(&h, "1 Elm St").await;
        let job = h.runner.run(id).await.unwrap();
        assert_eq!(job.status, JobStatus::SUCCEEDED);
        assert_eq!(job.records_inserted, 0);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn duplicates_and_addressless_records_are_not_written() {
        let mut nameless = raw("Ghost", "", 10);
        nameless.address = None;
        let h = harness(vec![FakeAdapter::new(
            "primary",
            SourceTier::Primary,
            Behavior::Records(vec![
                raw("Oak Apartments", "123 Main Street", 150),
                raw("Oak Apts", "123 main st.", 150),
                nameless,
                raw("Birch", "9 Birch Ave", 40),
            ]),
        ) as Arc<dyn SourceAdapter>]);
        let id = queue(&h, "123 Main St, Nashville, TN").await;
        let job = h.runner.run(id).await.unwrap();

        assert_eq!(job.status, JobStatus::SUCCEEDED);
        assert_eq!(job.records_inserted, 2);
        let rows = h.comparables.all().await;
        let oak = rows
            .iter()
            .find(|r| r.record.canonical_address == "123 main st, nashville, tn")
            .unwrap();
        assert_eq!(oak.record.name.as_deref(), Some("Oak Apartments"));
    }

    #[tokio::test]
    async fn panic_escaping_the_pipeline_fails_the_job_with_truncated_error() {
        let h = harness(vec![FakeAdapter::new(
            "primary",
            SourceTier::Primary,
            Behavior::Panic("x".repeat(5000)),
        ) as Arc<dyn SourceAdapter>]);
        let id = queue(&h, "1 Elm St").await;
        let job = h.runner.run(id).await.unwrap();

        assert_eq!(job.status, JobStatus::FAILED);
        assert_eq!(job.records_inserted, 0);
        let error = job.error.unwrap();
        assert_eq!(error.chars().count(), DEFAULT_ERROR_MAX_CHARS);
        assert!(error.starts_with("pipeline panicked: xxx"));
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn invalid_stored_query_fails_the_job() {
        let h = harness(vec![Arc::new(HeuristicAdapter::default()) as Arc<dyn SourceAdapter>]);
        let id = queue(&h, "   ").await;
        let job = h.runner.run(id).await.unwrap();
        assert_eq!(job.status, JobStatus::FAILED);
        assert_eq!(job.error.as_deref(), Some("invalid query: query address must not be blank"));
    }

    #[tokio::test]
    async fn missing_and_already_finished_jobs_are_rejected() {
        let h = harness(vec![Arc::new(HeuristicAdapter::default()) as Arc<dyn SourceAdapter>]);
        let missing = uuid::Uuid::new_v4();
        assert!(matches!(
            h.runner.run(missing).await,
            Err(PipelineError::JobNotFound(id)) if id == missing
        ));

        let id = queue(&h, "1 Elm St").await;
        h.runner.run(id).await.unwrap();
        assert!(matches!(
            h.runner.run(id).await,
            Err(PipelineError::Store(StoreError::Transition(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_terminal_write_failure_is_retried() {
        let (jobs, runner) = flaky_runner(2);
        let job = ScrapeJob::new(ScrapeQuery::new("1 Elm St, Nashville, TN"), Utc::now());
        jobs.insert_job(&job).await.unwrap();

        let finished = runner.run(job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::SUCCEEDED);
        assert_eq!(jobs.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_terminal_write_failure_surfaces_the_store_error() {
        let (jobs, runner) = flaky_runner(10);
        let job = ScrapeJob::new(ScrapeQuery::new("1 Elm St, Nashville, TN"), Utc::now());
        jobs.insert_job(&job).await.unwrap();

        assert!(matches!(
            runner.run(job.id).await,
            Err(PipelineError::Store(StoreError::Database(_)))
        ));
        assert_eq!(jobs.failures.load(Ordering::SeqCst), 10 - 3);
        let stuck = jobs.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Running);
    }
}
