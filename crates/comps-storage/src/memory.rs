//! In-process stores with the same semantics as the Postgres ones.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comps_core::{JobId, JobMeta, JobStatus, NaturalKey, NormalizedRecord, ScrapeJob, StoredComparable};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{ComparableFilter, ComparableStore, JobCompletion, JobStore, StoreError, UpsertOutcome};

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, ScrapeJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ScrapeJob>, StoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn mark_running(&self, id: JobId, at: DateTime<Utc>) -> Result<ScrapeJob, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.start(at)?;
        job.meta = JobMeta::default().stage("running", 0);
        Ok(job.clone())
    }

    async fn update_meta(&self, id: JobId, meta: &JobMeta) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.meta = meta.clone();
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn finish_job(
        &self,
        id: JobId,
        completion: &JobCompletion,
    ) -> Result<ScrapeJob, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.finish(
            completion.outcome,
            completion.records_inserted,
            completion.error.clone(),
            completion.finished_at,
        )?;
        job.meta = completion.meta.clone();
        Ok(job.clone())
    }

    async fn queued_jobs(&self, limit: usize) -> Result<Vec<JobId>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut queued = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .map(|j| (j.created_at, j.id))
            .collect::<Vec<_>>();
        queued.sort();
        Ok(queued.into_iter().take(limit).map(|(_, id)| id).collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryComparableStore {
    rows: Mutex<BTreeMap<NaturalKey, StoredComparable>>,
}

impl MemoryComparableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<StoredComparable> {
        self.rows.lock().await.values().cloned().collect()
    }
}

/// Same column set the Postgres `ON CONFLICT DO UPDATE` touches.
fn merge_market_fields(
    row: &mut StoredComparable,
    incoming: &NormalizedRecord,
    job_id: JobId,
    scraped_at: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    let record = &mut row.record;
    record.rent_psf = incoming.rent_psf;
    record.rent_pu = incoming.rent_pu;
    record.occupancy_pct = incoming.occupancy_pct;
    record.concession_pct = incoming.concession_pct;
    if !incoming.amenities.is_empty() {
        record.amenities = incoming.amenities.clone();
    }
    record.notes = incoming.notes.clone();
    record.source = incoming.source.clone();
    record.source_url = incoming.source_url.clone();
    row.scraped_at = scraped_at;
    row.job_id = job_id;
    row.updated_at = now;
}

#[async_trait]
impl ComparableStore for MemoryComparableStore {
    async fn upsert(
        &self,
        record: &NormalizedRecord,
        job_id: JobId,
        scraped_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        match rows.entry(record.natural_key()) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                merge_market_fields(existing, record, job_id, scraped_at, now);
                Ok(UpsertOutcome::Updated(existing.id))
            }
            Entry::Vacant(slot) => {
                let id = Uuid::new_v4();
                slot.insert(StoredComparable {
                    id,
                    job_id,
                    record: record.clone(),
                    scraped_at,
                    created_at: now,
                    updated_at: now,
                });
                Ok(UpsertOutcome::Inserted(id))
            }
        }
    }

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredComparable>, StoreError> {
        Ok(self.rows.lock().await.get(key).cloned())
    }

    async fn search(&self, filter: &ComparableFilter) -> Result<Vec<StoredComparable>, StoreError> {
        let needle = filter.needle();
        let rows = self.rows.lock().await;
        let mut hits = rows
            .values()
            .filter(|row| match needle.as_deref() {
                None => true,
                Some(needle) => [
                    row.record.name.as_deref(),
                    row.record.address.as_deref(),
                    row.record.city.as_deref(),
                    Some(row.record.canonical_address.as_str()),
                ]
                .into_iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(needle)),
            })
            .cloned()
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        hits.truncate(filter.effective_limit());
        Ok(hits)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.lock().await.len() as u64)
    }
}
