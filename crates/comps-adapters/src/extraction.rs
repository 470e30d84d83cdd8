use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use comps_core::{Loose, RawRecord, ScrapeQuery, SourceTier};
use comps_storage::{BackoffPolicy, HttpFetcher, RequestPacer};
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use crate::{provider_search_string, text_or_none, AdapterError, AdapterOutput, SourceAdapter};

const RESULT_KEYS: &[&str] = &["results", "properties", "data"];

const NAME_KEYS: &[&str] = &["name", "property_name", "title"];
const ADDRESS_KEYS: &[&str] = &["address", "full_address", "street_address"];
const CITY_KEYS: &[&str] = &["city"];
const STATE_KEYS: &[&str] = &["state", "state_code"];
const ZIP_KEYS: &[&str] = &["zip", "zip_code", "postal_code"];
const UNITS_KEYS: &[&str] = &["units", "unit_count", "total_units"];
const YEAR_KEYS: &[&str] = &["year_built", "built", "year"];
const RENT_PSF_KEYS: &[&str] = &["rent_psf", "rent_per_sqft", "rent_per_sf"];
const RENT_PU_KEYS: &[&str] = &["rent_pu", "rent_per_unit", "avg_rent"];
const OCCUPANCY_KEYS: &[&str] = &["occupancy", "occupancy_pct", "occupancy_rate"];
const CONCESSION_KEYS: &[&str] = &["concession", "concession_pct", "concessions"];
const AMENITY_KEYS: &[&str] = &["amenities", "amenity_tags", "features"];
const NOTES_KEYS: &[&str] = &["notes", "description", "summary"];
const URL_KEYS: &[&str] = &["source_url", "url", "link"];

/// JSON extraction service: one POST per query, bearer-authenticated when an
/// API key variable is configured.
pub struct ExtractionApiAdapter {
    name: String,
    tier: SourceTier,
    endpoint: String,
    api_key_env: Option<String>,
    max_results: usize,
    timeout: Option<Duration>,
    backoff: BackoffPolicy,
    pacer: RequestPacer,
    http: Arc<HttpFetcher>,
}

impl ExtractionApiAdapter {
    pub fn new(
        name: impl Into<String>,
        tier: SourceTier,
        endpoint: impl Into<String>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        let backoff = http.default_backoff();
        Self {
            name: name.into(),
            tier,
            endpoint: endpoint.into(),
            api_key_env: None,
            max_results: crate::DEFAULT_MAX_RESULTS,
            timeout: None,
            backoff,
            pacer: RequestPacer::new(Duration::ZERO),
            http,
        }
    }

    pub fn with_api_key_env(mut self, var: Option<String>) -> Self {
        self.api_key_env = var;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.pacer = RequestPacer::new(min_interval);
        self
    }

    fn api_key(&self) -> Result<Option<String>, AdapterError> {
        let Some(var) = &self.api_key_env else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
            _ => Err(AdapterError::Config(format!("api key variable {var} is not set"))),
        }
    }

    fn request_body(&self, query: &ScrapeQuery) -> JsonValue {
        json!({
            "query": provider_search_string(query),
            "radius_miles": query.radius_mi,
            "asset_type": query.asset_type,
            "amenities": query.amenities,
            "keywords": query.keywords,
            "limit": self.max_results,
        })
    }
}

#[async_trait]
impl SourceAdapter for ExtractionApiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> SourceTier {
        self.tier
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn search(&self, query: &ScrapeQuery) -> Result<AdapterOutput, AdapterError> {
        let api_key = self.api_key()?;
        let body = self.request_body(query);
        self.pacer.wait_turn().await;
        let response = self
            .http
            .post_json(
                &self.name,
                &self.endpoint,
                &body,
                api_key.as_deref(),
                Some(&self.backoff),
            )
            .await?;

        let mut records = parse_extraction_response(&response, &self.name)?;
        let returned = records.len();
        records.truncate(self.max_results);
        debug!(source = %self.name, returned, kept = records.len(), "extraction response parsed");

        let mut output = AdapterOutput::new(records);
        if returned > self.max_results {
            output = output.with_caveat(format!(
                "{} returned {returned} records; kept the first {}",
                self.name, self.max_results
            ));
        }
        Ok(output)
    }
}

/// Accepts a bare array or an object wrapping one under `results`,
/// `properties` or `data`. Non-object entries are skipped.
pub fn parse_extraction_response(
    value: &JsonValue,
    source: &str,
) -> Result<Vec<RawRecord>, AdapterError> {
    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(obj) => RESULT_KEYS
            .iter()
            .find_map(|key| obj.get(*key).and_then(JsonValue::as_array))
            .ok_or_else(|| {
                AdapterError::Malformed(format!(
                    "expected an array under one of {}",
                    RESULT_KEYS.join("/")
                ))
            })?,
        other => {
            return Err(AdapterError::Malformed(format!(
                "expected a JSON array or object, got {}",
                json_kind(other)
            )))
        }
    };

    Ok(items
        .iter()
        .filter_map(JsonValue::as_object)
        .map(|obj| record_from_object(obj, source))
        .collect())
}

fn record_from_object(obj: &Map<String, JsonValue>, source: &str) -> RawRecord {
    RawRecord {
        name: first_text(obj, NAME_KEYS),
        address: first_text(obj, ADDRESS_KEYS),
        city: first_text(obj, CITY_KEYS),
        state: first_text(obj, STATE_KEYS),
        zip: first_text(obj, ZIP_KEYS),
        units: first_loose(obj, UNITS_KEYS),
        year_built: first_loose(obj, YEAR_KEYS),
        rent_psf: first_loose(obj, RENT_PSF_KEYS),
        rent_pu: first_loose(obj, RENT_PU_KEYS),
        occupancy_pct: first_loose(obj, OCCUPANCY_KEYS),
        concession_pct: first_loose(obj, CONCESSION_KEYS),
        amenities: first_list(obj, AMENITY_KEYS),
        notes: first_text(obj, NOTES_KEYS),
        source: first_text(obj, &["source"]).or_else(|| Some(source.to_string())),
        source_url: first_text(obj, URL_KEYS),
    }
}

fn first_value<'a>(obj: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|value| !value.is_null())
}

fn first_text(obj: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    match first_value(obj, keys)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_loose(obj: &Map<String, JsonValue>, keys: &[&str]) -> Option<Loose> {
    match first_value(obj, keys)? {
        JsonValue::Number(n) => n.as_f64().map(Loose::Number),
        JsonValue::String(s) => text_or_none(s).map(Loose::Text),
        _ => None,
    }
}

fn first_list(obj: &Map<String, JsonValue>, keys: &[&str]) -> Vec<String> {
    match first_value(obj, keys) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .filter_map(text_or_none)
            .collect(),
        Some(JsonValue::String(s)) => s.split(',').filter_map(text_or_none).collect(),
        _ => Vec::new(),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comps_storage::HttpClientConfig;

    #[test]
    fn maps_field_aliases_into_raw_records() {
        let body = json!({
            "results": [
                {
                    "property_name": "Oak Apartments",
                    "full_address": "123 Main Street",
                    "unit_count": "150",
                    "avg_rent": "$1,800",
                    "rent_per_sqft": 1.95,
                    "occupancy_rate": "94%",
                    "features": "Pool, Fitness Center",
                    "url": "https://example.com/oak"
                },
                "not an object",
                { "name": "Birch Flats", "address": null, "street_address": "9 Birch Ave", "source": "partner-feed" }
            ]
        });
        let records = parse_extraction_response(&body, "primary-api").unwrap();
        assert_eq!(records.len(), 2);

        let oak = &records[0];
        assert_eq!(oak.name.as_deref(), Some("Oak Apartments"));
        assert_eq!(oak.address.as_deref(), Some("123 Main Street"));
        assert_eq!(oak.units, Some(Loose::Text("150".into())));
        assert_eq!(oak.rent_pu, Some(Loose::Text("$1,800".into())));
        assert_eq!(oak.rent_psf, Some(Loose::Number(1.95)));
        assert_eq!(oak.amenities, vec!["Pool".to_string(), "Fitness Center".to_string()]);
        assert_eq!(oak.source.as_deref(), Some("primary-api"));
        assert_eq!(oak.source_url.as_deref(), Some("https://example.com/oak"));

        let birch = &records[1];
        assert_eq!(birch.address.as_deref(), Some("9 Birch Ave"));
        assert_eq!(birch.source.as_deref(), Some("partner-feed"));
    }

    #[test]
    fn accepts_bare_arrays_and_rejects_other_shapes() {
        let bare = json!([{ "name": "Elm Court", "address": "1 Elm St" }]);
        assert_eq!(parse_extraction_response(&bare, "x").unwrap().len(), 1);

        let err = parse_extraction_response(&json!({ "error": "quota" }), "x").unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
        let err = parse_extraction_response(&json!("nope"), "x").unwrap_err();
        assert!(err.to_string().contains("a string"));
    }

    #[tokio::test]
    async fn missing_api_key_is_a_configuration_failure() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapter = ExtractionApiAdapter::new(
            "primary-api",
            SourceTier::Primary,
            "http://127.0.0.1:9/search",
            http,
        )
        .with_api_key_env(Some("COMPS_TEST_KEY_THAT_IS_NEVER_SET".into()));
        let err = adapter
            .search(&ScrapeQuery::new("123 Main St"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }

    #[test]
    fn request_body_carries_query_and_limit() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapter = ExtractionApiAdapter::new("p", SourceTier::Primary, "http://x", http)
            .with_max_results(10);
        let body = adapter.request_body(&ScrapeQuery::new("1 Elm St").with_amenities(["pool"]));
        assert_eq!(body["limit"], 10);
        assert_eq!(body["radius_miles"], 5.0);
        assert_eq!(body["asset_type"], "Multifamily");
        assert_eq!(body["amenities"], json!(["pool"]));
        assert!(body["query"].as_str().unwrap().contains("near 1 Elm St"));
    }
}
