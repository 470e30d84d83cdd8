//! Ordered fallback across source adapters for a single query.

use std::sync::Arc;
use std::time::Duration;

use comps_adapters::SourceAdapter;
use comps_core::{RawRecord, ScrapeQuery, SourceTier};
use tracing::{info, warn};

pub const NO_PROPERTIES_CAVEAT: &str = "No properties found";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResult {
    pub records: Vec<RawRecord>,
    pub caveats: Vec<String>,
    /// Tier that produced `records`; `None` when nothing was found.
    pub source: Option<SourceTier>,
    pub source_name: Option<String>,
    pub attempts: usize,
}

/// Tries adapters one at a time in the injected order and stops at the first
/// that returns at least one record. Failures and timeouts become caveats.
pub struct ScrapeAgent {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    default_timeout: Duration,
}

impl ScrapeAgent {
    pub fn new(adapters: Vec<Arc<dyn SourceAdapter>>, default_timeout: Duration) -> Self {
        Self {
            adapters,
            default_timeout,
        }
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    pub async fn run(&self, query: &ScrapeQuery) -> AgentResult {
        let mut result = AgentResult::default();

        for adapter in &self.adapters {
            let name = adapter.name();
            let limit = adapter.timeout().unwrap_or(self.default_timeout);
            result.attempts += 1;

            match tokio::time::timeout(limit, adapter.search(query)).await {
                Ok(Ok(output)) => {
                    result.caveats.extend(output.caveats);
                    if output.records.is_empty() {
                        info!(source = name, "adapter returned no records; falling back");
                        continue;
                    }
                    info!(source = name, records = output.records.len(), "adapter produced records");
                    result.records = output.records;
                    result.source = Some(adapter.tier());
                    result.source_name = Some(name.to_string());
                    return result;
                }
                Ok(Err(err)) => {
                    warn!(source = name, error = %err, "adapter failed; falling back");
                    result.caveats.push(format!("{name} failed: {err}"));
                }
                Err(_) => {
                    warn!(source = name, timeout_ms = limit.as_millis() as u64, "adapter timed out; falling back");
                    result.caveats.push(format!("{name} failed: timed out after {limit:?}"));
                }
            }
        }

        result.caveats.push(NO_PROPERTIES_CAVEAT.to_string());
        result
    }
}
