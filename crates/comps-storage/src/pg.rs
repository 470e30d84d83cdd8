//! Postgres-backed job and comparable stores (sqlx).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use comps_core::{
    JobId, JobMeta, JobStatus, NaturalKey, NormalizedRecord, ScrapeJob, ScrapeQuery,
    StoredComparable,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::{ComparableFilter, ComparableStore, JobCompletion, JobStore, StoreError, UpsertOutcome};

const JOB_COLUMNS: &str = "id, query, status, meta, error, records_inserted, created_at, updated_at, started_at, finished_at";

const COMPARABLE_COLUMNS: &str = "id, job_id, canonical_address, unit_plan, name, address, city, state, zip, units, year_built, rent_psf, rent_pu, occupancy_pct, concession_pct, amenities, notes, source, source_url, scraped_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<ScrapeJob, StoreError> {
    let status: String = row.try_get("status")?;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown job status `{status}`")))?;
    let Json(query): Json<ScrapeQuery> = row.try_get("query")?;
    let Json(meta): Json<JobMeta> = row.try_get("meta")?;
    let records_inserted: i64 = row.try_get("records_inserted")?;
    Ok(ScrapeJob {
        id: row.try_get("id")?,
        query,
        status,
        meta,
        error: row.try_get("error")?,
        records_inserted: records_inserted.max(0) as u64,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn comparable_from_row(row: &PgRow) -> Result<StoredComparable, StoreError> {
    let units: Option<i32> = row.try_get("units")?;
    let amenities: Vec<String> = row.try_get("amenities")?;
    Ok(StoredComparable {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        record: NormalizedRecord {
            name: row.try_get("name")?,
            address: row.try_get("address")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            zip: row.try_get("zip")?,
            units: units.and_then(|u| u32::try_from(u).ok()),
            year_built: row.try_get("year_built")?,
            rent_psf: row.try_get("rent_psf")?,
            rent_pu: row.try_get("rent_pu")?,
            occupancy_pct: row.try_get("occupancy_pct")?,
            concession_pct: row.try_get("concession_pct")?,
            amenities: amenities.into_iter().collect(),
            notes: row.try_get("notes")?,
            source: row.try_get("source")?,
            source_url: row.try_get("source_url")?,
            canonical_address: row.try_get("canonical_address")?,
            unit_plan: row.try_get("unit_plan")?,
        },
        scraped_at: row.try_get("scraped_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO scrape_jobs (id, query, status, meta, error, records_inserted,
                                     created_at, updated_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id)
        .bind(Json(&job.query))
        .bind(job.status.as_str())
        .bind(Json(&job.meta))
        .bind(&job.error)
        .bind(job.records_inserted as i64)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ScrapeJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_running(&self, id: JobId, at: DateTime<Utc>) -> Result<ScrapeJob, StoreError> {
        let mut job = self.get_job(id).await?.ok_or(StoreError::JobNotFound(id))?;
        job.start(at)?;
        job.meta = JobMeta::default().stage("running", 0);

        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
               SET status = $2,
                   started_at = $3,
                   updated_at = $3,
                   meta = $4
             WHERE id = $1
               AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(job.status.as_str())
        .bind(at)
        .bind(Json(&job.meta))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                id,
                expected: JobStatus::Queued,
            });
        }
        Ok(job)
    }

    async fn update_meta(&self, id: JobId, meta: &JobMeta) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE scrape_jobs SET meta = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(Json(meta))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn finish_job(
        &self,
        id: JobId,
        completion: &JobCompletion,
    ) -> Result<ScrapeJob, StoreError> {
        let mut job = self.get_job(id).await?.ok_or(StoreError::JobNotFound(id))?;
        job.finish(
            completion.outcome,
            completion.records_inserted,
            completion.error.clone(),
            completion.finished_at,
        )?;
        job.meta = completion.meta.clone();

        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
               SET status = $2,
                   records_inserted = $3,
                   error = $4,
                   meta = $5,
                   finished_at = $6,
                   updated_at = $6
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(job.status.as_str())
        .bind(job.records_inserted as i64)
        .bind(&job.error)
        .bind(Json(&job.meta))
        .bind(completion.finished_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                id,
                expected: JobStatus::Running,
            });
        }
        Ok(job)
    }

    async fn queued_jobs(&self, limit: usize) -> Result<Vec<JobId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id
              FROM scrape_jobs
             WHERE status = 'queued'
             ORDER BY created_at
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("id").map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl ComparableStore for PgStore {
    async fn upsert(
        &self,
        record: &NormalizedRecord,
        job_id: JobId,
        scraped_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let amenities = record.amenities.iter().cloned().collect::<Vec<_>>();
        let row = sqlx::query(
            r#"
            INSERT INTO comparables (
                id, job_id, canonical_address, unit_plan, name, address, city, state, zip,
                units, year_built, rent_psf, rent_pu, occupancy_pct, concession_pct,
                amenities, notes, source, source_url, scraped_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, NOW(), NOW())
            ON CONFLICT ON CONSTRAINT comparables_natural_key DO UPDATE SET
                rent_psf = EXCLUDED.rent_psf,
                rent_pu = EXCLUDED.rent_pu,
                occupancy_pct = EXCLUDED.occupancy_pct,
                concession_pct = EXCLUDED.concession_pct,
                amenities = CASE
                    WHEN cardinality(EXCLUDED.amenities) > 0 THEN EXCLUDED.amenities
                    ELSE comparables.amenities
                END,
                notes = EXCLUDED.notes,
                source = EXCLUDED.source,
                source_url = EXCLUDED.source_url,
                scraped_at = EXCLUDED.scraped_at,
                job_id = EXCLUDED.job_id,
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(&record.canonical_address)
        .bind(&record.unit_plan)
        .bind(&record.name)
        .bind(&record.address)
        .bind(&record.city)
        .bind(&record.state)
        .bind(&record.zip)
        .bind(record.units.and_then(|u| i32::try_from(u).ok()))
        .bind(record.year_built)
        .bind(record.rent_psf)
        .bind(record.rent_pu)
        .bind(record.occupancy_pct)
        .bind(record.concession_pct)
        .bind(&amenities)
        .bind(&record.notes)
        .bind(&record.source)
        .bind(&record.source_url)
        .bind(scraped_at)
        .fetch_one(&self.pool)
        .await?;

        let id: Uuid = row.try_get("id")?;
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted(id)
        } else {
            UpsertOutcome::Updated(id)
        })
    }

    async fn find_by_key(&self, key: &NaturalKey) -> Result<Option<StoredComparable>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COMPARABLE_COLUMNS} FROM comparables WHERE canonical_address = $1 AND unit_plan = $2"
        ))
        .bind(&key.canonical_address)
        .bind(&key.unit_plan)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(comparable_from_row).transpose()
    }

    async fn search(&self, filter: &ComparableFilter) -> Result<Vec<StoredComparable>, StoreError> {
        let pattern = filter.needle().map(|n| format!("%{}%", escape_like(&n)));
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COMPARABLE_COLUMNS}
              FROM comparables
             WHERE $1::text IS NULL
                OR name ILIKE $1
                OR address ILIKE $1
                OR city ILIKE $1
                OR canonical_address ILIKE $1
             ORDER BY updated_at DESC
             LIMIT $2
            "#
        ))
        .bind(pattern)
        .bind(filter.effective_limit() as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(comparable_from_row).collect()
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comparables")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }
}
