//! Source adapter contract plus the concrete extraction, listing-page and
//! heuristic sources.

use std::time::Duration;

use async_trait::async_trait;
use comps_core::{RawRecord, ScrapeQuery, SourceTier};
use comps_storage::FetchError;
use thiserror::Error;

pub mod extraction;
pub mod heuristic;
pub mod listing;
pub mod registry;

pub use extraction::{parse_extraction_response, ExtractionApiAdapter};
pub use heuristic::{HeuristicAdapter, HEURISTIC_CAVEAT};
pub use listing::{parse_listing_html, ListingPageAdapter};
pub use registry::{build_adapters, RetryConfig, SourceConfig, SourceKind, SourceRegistry};

pub const CRATE_NAME: &str = "comps-adapters";

pub const DEFAULT_MAX_RESULTS: usize = 25;

/// Records returned by one adapter call, plus any non-fatal warnings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterOutput {
    pub records: Vec<RawRecord>,
    pub caveats: Vec<String>,
}

impl AdapterOutput {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            caveats: Vec::new(),
        }
    }

    pub fn with_caveat(mut self, caveat: impl Into<String>) -> Self {
        self.caveats.push(caveat.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Message(String),
}

/// "Given a query, return zero or more raw property records, or fail."
///
/// Implementations must not mutate the query. Callers bound every call with
/// [`SourceAdapter::timeout`] (or their own default) and treat expiry as a failure.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn tier(&self) -> SourceTier;

    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn search(&self, query: &ScrapeQuery) -> Result<AdapterOutput, AdapterError>;
}

/// Provider-facing search phrase, e.g.
/// `multifamily properties near 123 Main St within 5 miles, amenities: pool`.
pub fn provider_search_string(query: &ScrapeQuery) -> String {
    let mut out = format!(
        "{} properties near {} within {} miles",
        query.asset_type.trim().to_lowercase(),
        query.address.trim(),
        query.radius_mi
    );
    if !query.amenities.is_empty() {
        out.push_str(", amenities: ");
        out.push_str(&query.amenities.join(", "));
    }
    if !query.keywords.is_empty() {
        out.push_str(", keywords: ");
        out.push_str(&query.keywords.join(", "));
    }
    out
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_string_mentions_every_query_part() {
        let query = ScrapeQuery::new("123 Main St, Nashville, TN")
            .with_amenities(["pool", "gym"])
            .with_keywords(["luxury"]);
        assert_eq!(
            provider_search_string(&query),
            "multifamily properties near 123 Main St, Nashville, TN within 5 miles, amenities: pool, gym, keywords: luxury"
        );
        assert_eq!(
            provider_search_string(&ScrapeQuery::new("1 Elm St").with_radius(2.5)),
            "multifamily properties near 1 Elm St within 2.5 miles"
        );
    }

    #[test]
    fn text_or_none_collapses_whitespace() {
        assert_eq!(text_or_none("  Oak \n  Apartments "), Some("Oak Apartments".into()));
        assert_eq!(text_or_none(" \t"), None);
    }
}
