use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use comps_adapters::{AdapterError, AdapterOutput, HeuristicAdapter, SourceAdapter};
use comps_core::{JobStatus, NaturalKey, RawRecord, ScrapeQuery, SourceTier};
use comps_storage::{ComparableStore, MemoryComparableStore, MemoryJobStore};
use comps_sync::{JobService, ScrapeAgent};

struct StalledPrimary;

#[async_trait]
impl SourceAdapter for StalledPrimary {
    fn name(&self) -> &str {
        "primary-extractor"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Primary
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(10))
    }

    async fn search(&self, _query: &ScrapeQuery) -> Result<AdapterOutput, AdapterError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(AdapterOutput::default())
    }
}

struct OakSecondary;

#[async_trait]
impl SourceAdapter for OakSecondary {
    fn name(&self) -> &str {
        "secondary-extractor"
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Secondary
    }

    async fn search(&self, _query: &ScrapeQuery) -> Result<AdapterOutput, AdapterError> {
        Ok(AdapterOutput::new(vec![RawRecord {
            name: Some("Oak Apartments".into()),
            address: Some("123 Main Street".into()),
            units: Some(150i64.into()),
            rent_pu: Some(1800i64.into()),
            ..Default::default()
        }]))
    }
}

#[tokio::test(start_paused = true)]
async fn primary_timeout_falls_back_to_secondary_and_persists_one_comparable() {
    let comparables = Arc::new(MemoryComparableStore::new());
    let agent = ScrapeAgent::new(
        vec![
            Arc::new(StalledPrimary) as Arc<dyn SourceAdapter>,
            Arc::new(OakSecondary),
            Arc::new(HeuristicAdapter::default()),
        ],
        Duration::from_secs(30),
    );
    let service = JobService::new(
        Arc::new(MemoryJobStore::new()),
        comparables.clone(),
        agent,
        2000,
    );

    let query = ScrapeQuery::new("123 Main St, Nashville, TN")
        .with_radius(5.0)
        .with_asset_type("Multifamily");
    let job = service.create_and_run(query).await.unwrap();

    assert_eq!(job.status, JobStatus::SUCCEEDED);
    assert_eq!(job.records_inserted, 1);
    assert!(job
        .meta
        .caveats
        .iter()
        .any(|c| c.starts_with("primary-extractor failed: timed out")));

    assert_eq!(comparables.count().await.unwrap(), 1);
    let row = comparables
        .find_by_key(&NaturalKey {
            canonical_address: "123 main st, nashville, tn".into(),
            unit_plan: "150u|$1800pu".into(),
        })
        .await
        .unwrap()
        .expect("stored comparable");
    assert_eq!(row.job_id, job.id);
    assert_eq!(row.record.name.as_deref(), Some("Oak Apartments"));
    assert_eq!(row.record.units, Some(150));
    assert_eq!(row.record.rent_pu, Some(1800.0));

    let rerun = service
        .create_and_run(ScrapeQuery::new("123 Main St, Nashville, TN"))
        .await
        .unwrap();
    assert_eq!(rerun.records_inserted, 1);
    assert_eq!(comparables.count().await.unwrap(), 1);
}
