//! Pipeline orchestration: fallback agent, dedup, upsert, job runner and service.

use comps_core::{JobId, QueryError};
use comps_storage::StoreError;
use thiserror::Error;

pub mod agent;
pub mod config;
pub mod dedupe;
pub mod runner;
pub mod service;
pub mod upsert;

pub use agent::{AgentResult, ScrapeAgent, NO_PROPERTIES_CAVEAT};
pub use config::PipelineConfig;
pub use dedupe::dedupe;
pub use runner::PipelineRunner;
pub use service::{JobService, SWEEP_BATCH};
pub use upsert::{UpsertReport, Upserter};

pub const CRATE_NAME: &str = "comps-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// The job exists but is not in the state the operation needs.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            PipelineError::Store(StoreError::Conflict { .. } | StoreError::Transition(_))
        )
    }
}
