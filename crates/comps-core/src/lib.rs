//! Core domain model for the comparable-property scrape pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod normalize;

pub use normalize::{canonical_address, normalize, unit_plan};

pub const CRATE_NAME: &str = "comps-core";

pub const DEFAULT_RADIUS_MI: f64 = 5.0;
pub const DEFAULT_ASSET_TYPE: &str = "Multifamily";
pub const DEFAULT_ERROR_MAX_CHARS: usize = 2000;

pub type JobId = Uuid;

fn default_radius() -> f64 {
    DEFAULT_RADIUS_MI
}

fn default_asset_type() -> String {
    DEFAULT_ASSET_TYPE.to_string()
}

/// Input to a scrape job. Stored verbatim and never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeQuery {
    pub address: String,
    #[serde(default = "default_radius", alias = "radius")]
    pub radius_mi: f64,
    #[serde(default = "default_asset_type")]
    pub asset_type: String,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("query address must not be blank")]
    BlankAddress,
    #[error("search radius must be a positive number of miles, got {0}")]
    InvalidRadius(f64),
}

impl ScrapeQuery {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            radius_mi: DEFAULT_RADIUS_MI,
            asset_type: DEFAULT_ASSET_TYPE.to_string(),
            amenities: Vec::new(),
            keywords: Vec::new(),
        }
    }

    pub fn with_radius(mut self, radius_mi: f64) -> Self {
        self.radius_mi = radius_mi;
        self
    }

    pub fn with_asset_type(mut self, asset_type: impl Into<String>) -> Self {
        self.asset_type = asset_type.into();
        self
    }

    pub fn with_amenities<I, S>(mut self, amenities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.amenities = amenities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        if self.address.trim().is_empty() {
            return Err(QueryError::BlankAddress);
        }
        if !self.radius_mi.is_finite() || self.radius_mi <= 0.0 {
            return Err(QueryError::InvalidRadius(self.radius_mi));
        }
        Ok(())
    }

    /// The part of the address after the street line, e.g. `Nashville, TN`.
    pub fn locality(&self) -> Option<&str> {
        let (_, rest) = self.address.split_once(',')?;
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

/// Which tier of the fallback chain produced a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Primary,
    Secondary,
    Heuristic,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Primary => "primary",
            SourceTier::Secondary => "secondary",
            SourceTier::Heuristic => "heuristic",
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure,
}

/// Canonical job states. Legacy `completed` / `error` spellings parse into the
/// terminal variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobStatus {
    Queued,
    Running,
    Terminal(JobOutcome),
}

impl JobStatus {
    pub const SUCCEEDED: JobStatus = JobStatus::Terminal(JobOutcome::Success);
    pub const FAILED: JobStatus = JobStatus::Terminal(JobOutcome::Failure);

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Terminal(JobOutcome::Success) => "done",
            JobStatus::Terminal(JobOutcome::Failure) => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "done" | "completed" => Some(JobStatus::SUCCEEDED),
            "failed" | "error" => Some(JobStatus::FAILED),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Terminal(_))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_string()
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        JobStatus::parse(&value).ok_or_else(|| format!("unknown job status `{value}`"))
    }
}

/// Advisory progress payload. Never used for control flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub percent: u8,
    #[serde(default)]
    pub counts: BTreeMap<String, usize>,
    #[serde(default)]
    pub caveats: Vec<String>,
    #[serde(default)]
    pub source: Option<SourceTier>,
}

impl JobMeta {
    pub fn stage(mut self, stage: &str, percent: u8) -> Self {
        self.stage = Some(stage.to_string());
        self.percent = percent.min(100);
        self
    }

    pub fn count(mut self, key: &str, value: usize) -> Self {
        self.counts.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("job {id} cannot move from {from} to {to}")]
    Invalid {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// The unit of work: one query, one lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: JobId,
    pub query: ScrapeQuery,
    pub status: JobStatus,
    pub meta: JobMeta,
    pub error: Option<String>,
    pub records_inserted: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScrapeJob {
    pub fn new(query: ScrapeQuery, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query,
            status: JobStatus::Queued,
            meta: JobMeta::default().stage("queued", 0),
            error: None,
            records_inserted: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// `Queued -> Running`; sets `started_at`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != JobStatus::Queued {
            return Err(TransitionError::Invalid {
                id: self.id,
                from: self.status,
                to: JobStatus::Running,
            });
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `Running -> Terminal`; sets `finished_at`.
    pub fn finish(
        &mut self,
        outcome: JobOutcome,
        records_inserted: u64,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let to = JobStatus::Terminal(outcome);
        if self.status != JobStatus::Running {
            return Err(TransitionError::Invalid {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.records_inserted = records_inserted;
        self.error = error;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

/// Truncates to at most `max_chars` characters, always on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// A loosely typed scalar as sources hand it over: `150`, `"1,800"`, `"$1.95/sf"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Loose {
    Number(f64),
    Text(String),
}

impl From<f64> for Loose {
    fn from(value: f64) -> Self {
        Loose::Number(value)
    }
}

impl From<i64> for Loose {
    fn from(value: i64) -> Self {
        Loose::Number(value as f64)
    }
}

impl From<&str> for Loose {
    fn from(value: &str) -> Self {
        Loose::Text(value.to_string())
    }
}

impl From<String> for Loose {
    fn from(value: String) -> Self {
        Loose::Text(value)
    }
}

/// Untrusted record shape returned by a source adapter. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
    #[serde(default)]
    pub units: Option<Loose>,
    #[serde(default)]
    pub year_built: Option<Loose>,
    #[serde(default)]
    pub rent_psf: Option<Loose>,
    #[serde(default)]
    pub rent_pu: Option<Loose>,
    #[serde(default)]
    pub occupancy_pct: Option<Loose>,
    #[serde(default)]
    pub concession_pct: Option<Loose>,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

impl RawRecord {
    /// Street-only addresses inherit city/state/zip from the query locality.
    pub fn fill_locality_from(&mut self, query: &ScrapeQuery) {
        let street_only = self
            .address
            .as_deref()
            .map(|a| !a.contains(','))
            .unwrap_or(false);
        if !street_only || self.city.is_some() || self.state.is_some() {
            return;
        }
        let Some(locality) = query.locality() else {
            return;
        };
        let mut parts = locality.split(',').map(str::trim).filter(|p| !p.is_empty());
        self.city = parts.next().map(ToString::to_string);
        if let Some(state_zip) = parts.next() {
            let mut tokens = state_zip.split_whitespace();
            self.state = tokens.next().map(ToString::to_string);
            if self.zip.is_none() {
                self.zip = tokens.next().map(ToString::to_string);
            }
        }
    }
}

/// Storage identity of a comparable, independent of generated row ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub canonical_address: String,
    pub unit_plan: String,
}

/// Trusted, canonical record produced by the normalizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub units: Option<u32>,
    pub year_built: Option<i32>,
    pub rent_psf: Option<f64>,
    pub rent_pu: Option<f64>,
    pub occupancy_pct: Option<f64>,
    pub concession_pct: Option<f64>,
    pub amenities: BTreeSet<String>,
    pub notes: Option<String>,
    pub source: Option<String>,
    pub source_url: Option<String>,
    pub canonical_address: String,
    pub unit_plan: String,
}

impl NormalizedRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            canonical_address: self.canonical_address.clone(),
            unit_plan: self.unit_plan.clone(),
        }
    }

    pub fn has_address(&self) -> bool {
        !self.canonical_address.is_empty()
    }
}

/// Persisted comparable row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredComparable {
    pub id: Uuid,
    pub job_id: JobId,
    #[serde(flatten)]
    pub record: NormalizedRecord,
    pub scraped_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, 0, 0).single().unwrap()
    }

    #[test]
    fn job_lifecycle_sets_timestamps_only_when_allowed() {
        let mut job = ScrapeJob::new(ScrapeQuery::new("123 Main St, Nashville, TN"), ts(1));
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.started_at.is_none() && job.finished_at.is_none());

        job.start(ts(2)).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.started_at, Some(ts(2)));
        assert!(job.finished_at.is_none());

        job.finish(JobOutcome::Success, 4, None, ts(3)).unwrap();
        assert_eq!(job.status, JobStatus::SUCCEEDED);
        assert_eq!(job.finished_at, Some(ts(3)));
        assert_eq!(job.records_inserted, 4);
    }

    #[test]
    fn job_cannot_start_twice_or_finish_from_queued() {
        let mut job = ScrapeJob::new(ScrapeQuery::new("1 Elm St"), ts(1));
        assert!(job.finish(JobOutcome::Failure, 0, None, ts(2)).is_err());
        job.start(ts(2)).unwrap();
        let err = job.start(ts(3)).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Invalid {
                id: job.id,
                from: JobStatus::Running,
                to: JobStatus::Running
            }
        );
        job.finish(JobOutcome::Failure, 0, Some("boom".into()), ts(3)).unwrap();
        assert!(job.finish(JobOutcome::Success, 0, None, ts(4)).is_err());
        assert_eq!(job.status, JobStatus::FAILED);
    }

    #[test]
    fn status_synonyms_collapse_to_canonical_states() {
        assert_eq!(JobStatus::parse("completed"), Some(JobStatus::SUCCEEDED));
        assert_eq!(JobStatus::parse("DONE"), Some(JobStatus::SUCCEEDED));
        assert_eq!(JobStatus::parse("error"), Some(JobStatus::FAILED));
        assert_eq!(JobStatus::parse("paused"), None);
        let json = serde_json::to_string(&JobStatus::SUCCEEDED).unwrap();
        assert_eq!(json, "\"done\"");
        let back: JobStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(back, JobStatus::SUCCEEDED);
    }

    #[test]
    fn truncation_is_char_safe() {
        let long = "é".repeat(5000);
        let cut = truncate_chars(&long, DEFAULT_ERROR_MAX_CHARS);
        assert_eq!(cut.chars().count(), 2000);
        assert_eq!(truncate_chars("short", 2000), "short");
    }

    #[test]
    fn query_defaults_and_validation() {
        let q: ScrapeQuery = serde_json::from_str(r#"{"address":"123 Main St, Nashville, TN"}"#).unwrap();
        assert_eq!(q.radius_mi, 5.0);
        assert_eq!(q.asset_type, "Multifamily");
        assert_eq!(q.locality(), Some("Nashville, TN"));
        assert!(q.validate().is_ok());
        assert_eq!(ScrapeQuery::new("  ").validate(), Err(QueryError::BlankAddress));
        assert!(ScrapeQuery::new("1 Elm").with_radius(0.0).validate().is_err());
    }

    #[test]
    fn street_only_address_inherits_query_locality() {
        let query = ScrapeQuery::new("123 Main St, Nashville, TN 37201");
        let mut raw = RawRecord {
            address: Some("9 Oak Street".into()),
            ..Default::default()
        };
        raw.fill_locality_from(&query);
        assert_eq!(raw.city.as_deref(), Some("Nashville"));
        assert_eq!(raw.state.as_deref(), Some("TN"));
        assert_eq!(raw.zip.as_deref(), Some("37201"));

        let mut full = RawRecord {
            address: Some("9 Oak Street, Memphis, TN".into()),
            ..Default::default()
        };
        full.fill_locality_from(&query);
        assert!(full.city.is_none());
    }
}
