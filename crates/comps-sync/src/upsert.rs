use std::sync::Arc;

use chrono::{DateTime, Utc};
use comps_core::{JobId, NormalizedRecord};
use comps_storage::{ComparableStore, UpsertOutcome};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: u64,
    pub updated: u64,
    /// One entry per row that could not be written.
    pub errors: Vec<String>,
}

impl UpsertReport {
    /// Rows successfully written, inserts and merges alike.
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Writes a deduplicated batch row by row; a failing row is logged and skipped.
#[derive(Clone)]
pub struct Upserter {
    store: Arc<dyn ComparableStore>,
}

impl Upserter {
    pub fn new(store: Arc<dyn ComparableStore>) -> Self {
        Self { store }
    }

    pub async fn upsert_all(
        &self,
        records: &[NormalizedRecord],
        job_id: JobId,
        scraped_at: DateTime<Utc>,
    ) -> UpsertReport {
        let mut report = UpsertReport::default();
        for record in records {
            match self.store.upsert(record, job_id, scraped_at).await {
                Ok(UpsertOutcome::Inserted(_)) => report.inserted += 1,
                Ok(UpsertOutcome::Updated(_)) => report.updated += 1,
                Err(err) => {
                    warn!(
                        job_id = %job_id,
                        canonical_address = %record.canonical_address,
                        unit_plan = %record.unit_plan,
                        error = %err,
                        "skipping comparable that failed to persist"
                    );
                    report
                        .errors
                        .push(format!("{} [{}]: {err}", record.canonical_address, record.unit_plan));
                }
            }
        }
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use comps_core::{NaturalKey, StoredComparable};
    use comps_storage::{ComparableFilter, MemoryComparableStore, StoreError};
    use uuid::Uuid;

    /// Delegates to the memory store but rejects one address.
    pub(crate) struct RejectingStore {
        pub inner: MemoryComparableStore,
        pub reject: String,
    }

    #[async_trait]
    impl ComparableStore for RejectingStore {
        async fn upsert(
            &self,
            record: &NormalizedRecord,
            job_id: JobId,
            scraped_at: DateTime<Utc>,
        ) -> Result<UpsertOutcome, StoreError> {
            if record.canonical_address == self.reject {
                return Err(StoreError::Corrupt("value too long for column".into()));
            }
            self.inner.upsert(record, job_id, scraped_at).await
        }

        async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredComparable>, StoreError> {
            self.inner.find_by_key(key).await
        }

        async fn search(&self, filter: &ComparableFilter) -> Result<Vec<StoredComparable>, StoreError> {
            self.inner.search(filter).await
        }

        async fn count(&self) -> Result<u64, StoreError> {
            self.inner.count().await
        }
    }

    fn rec(address: &str, plan: &str, amenities: &[&str]) -> NormalizedRecord {
        NormalizedRecord {
            address: Some(address.to_string()),
            rent_pu: Some(1800.0),
            amenities: amenities.iter().map(|a| a.to_string()).collect(),
            canonical_address: address.to_string(),
            unit_plan: plan.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upserting_twice_is_idempotent() {
        let store = Arc::new(MemoryComparableStore::new());
        let upserter = Upserter::new(store.clone());
        let batch = vec![rec("1 elm st", "10u", &["pool"]), rec("2 oak ave", "20u", &[])];
        let job = Uuid::new_v4();
        let scraped_at = Utc::now();

        let first = upserter.upsert_all(&batch, job, scraped_at).await;
        let rows_after_first = store.all().await;
        let second = upserter.upsert_all(&batch, job, scraped_at).await;
        let rows_after_second = store.all().await;

        assert_eq!(first.inserted, 2);
        assert_eq!(second.updated, 2);
        assert_eq!(second.written(), 2);
        assert_eq!(rows_after_first.len(), rows_after_second.len());
        for (a, b) in rows_after_first.iter().zip(&rows_after_second) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.record, b.record);
            assert_eq!(a.created_at, b.created_at);
            assert_eq!(a.scraped_at, b.scraped_at);
        }
    }

    #[tokio::test]
    async fn amenities_survive_an_empty_update_and_are_replaced_by_a_new_list() {
        let store = Arc::new(MemoryComparableStore::new());
        let upserter = Upserter::new(store.clone());
        let job = Uuid::new_v4();
        let key = rec("1 elm st", "10u", &[]).natural_key();

        upserter.upsert_all(&[rec("1 elm st", "10u", &["pool", "gym"])], job, Utc::now()).await;
        upserter.upsert_all(&[rec("1 elm st", "10u", &[])], job, Utc::now()).await;
        let row = store.find_by_key(&key).await.unwrap().unwrap();
        assert_eq!(
            row.record.amenities.into_iter().collect::<Vec<_>>(),
            vec!["gym".to_string(), "pool".to_string()]
        );

        upserter
            .upsert_all(&[rec("1 elm st", "10u", &["pool", "gym", "rooftop"])], job, Utc::now())
            .await;
        let row = store.find_by_key(&key).await.unwrap().unwrap();
        assert_eq!(
            row.record.amenities.into_iter().collect::<Vec<_>>(),
            vec!["gym".to_string(), "pool".to_string(), "rooftop".to_string()]
        );
    }

    #[tokio::test]
    async fn failing_row_is_skipped_without_aborting_the_batch() {
        let store = Arc::new(RejectingStore {
            inner: MemoryComparableStore::new(),
            reject: "2 oak ave".into(),
        });
        let upserter = Upserter::new(store.clone());
        let batch = vec![
            rec("1 elm st", "10u", &[]),
            rec("2 oak ave", "20u", &[]),
            rec("3 ash ct", "30u", &[]),
        ];
        let report = upserter.upsert_all(&batch, Uuid::new_v4(), Utc::now()).await;
        assert_eq!(report.written(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("2 oak ave [20u]"));
        assert_eq!(store.count().await.unwrap(), 2);
    }
}
