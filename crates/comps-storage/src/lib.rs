//! Persistence + outbound HTTP utilities for the comps pipeline.

pub mod http;
pub mod memory;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comps_core::{
    JobId, JobMeta, JobOutcome, JobStatus, NaturalKey, NormalizedRecord, ScrapeJob,
    StoredComparable, TransitionError,
};
use thiserror::Error;
use uuid::Uuid;

pub use http::{
    classify_fetch_error, classify_reqwest_error, classify_status, retry_with_backoff,
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RequestPacer,
    RetryDisposition,
};
pub use memory::{MemoryComparableStore, MemoryJobStore};
pub use pg::PgStore;
pub use reqwest::Url;

pub const CRATE_NAME: &str = "comps-storage";

pub const DEFAULT_SEARCH_LIMIT: usize = 50;
pub const MAX_SEARCH_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("job {id} changed concurrently; expected status {expected}")]
    Conflict { id: JobId, expected: JobStatus },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Connection-level database failures may clear up on retry; everything else is final.
pub fn classify_store_error(err: &StoreError) -> RetryDisposition {
    match err {
        StoreError::Database(_) => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Terminal write for a job: outcome, counts, error text and final meta.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub outcome: JobOutcome,
    pub records_inserted: u64,
    pub error: Option<String>,
    pub meta: JobMeta,
    pub finished_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &ScrapeJob) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<ScrapeJob>, StoreError>;

    /// `Queued -> Running`. Fails if the job is missing or not queued.
    async fn mark_running(&self, id: JobId, at: DateTime<Utc>) -> Result<ScrapeJob, StoreError>;

    /// Advisory progress write; does not touch status.
    async fn update_meta(&self, id: JobId, meta: &JobMeta) -> Result<(), StoreError>;

    /// `Running -> Terminal`. Fails if the job is missing or not running.
    async fn finish_job(
        &self,
        id: JobId,
        completion: &JobCompletion,
    ) -> Result<ScrapeJob, StoreError>;

    /// Queued job ids, oldest first.
    async fn queued_jobs(&self, limit: usize) -> Result<Vec<JobId>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(Uuid),
    Updated(Uuid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Updated(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComparableFilter {
    pub text: Option<String>,
    pub limit: Option<usize>,
}

impl ComparableFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT)
    }

    pub fn needle(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }
}

#[async_trait]
pub trait ComparableStore: Send + Sync {
    /// Insert, or merge the market fields into the row with the same natural key.
    /// Amenities are only replaced by a non-empty set.
    async fn upsert(
        &self,
        record: &NormalizedRecord,
        job_id: JobId,
        scraped_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredComparable>, StoreError>;

    async fn search(&self, filter: &ComparableFilter) -> Result<Vec<StoredComparable>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}
