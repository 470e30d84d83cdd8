use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use comps_core::{Loose, RawRecord, ScrapeQuery, SourceTier};
use comps_storage::{BackoffPolicy, HttpFetcher, RequestPacer, Url};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::{provider_search_string, text_or_none, AdapterError, AdapterOutput, SourceAdapter};

const CARD_SELECTOR: &str = ".property-card, .listing-card, article.property";

/// HTML search-results page scraped card by card.
pub struct ListingPageAdapter {
    name: String,
    tier: SourceTier,
    endpoint: String,
    max_results: usize,
    timeout: Option<Duration>,
    backoff: BackoffPolicy,
    pacer: RequestPacer,
    http: Arc<HttpFetcher>,
}

impl ListingPageAdapter {
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
            max_results: crate::DEFAULT_MAX_RESULTS,
            timeout: None,
            backoff,
            pacer: RequestPacer::new(Duration::ZERO),
            http,
        }
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

    fn search_url(&self, query: &ScrapeQuery) -> Result<Url, AdapterError> {
        Url::parse_with_params(&self.endpoint, &[("q", provider_search_string(query))])
            .map_err(|e| AdapterError::Config(format!("invalid endpoint {}: {e}", self.endpoint)))
    }
}

#[async_trait]
impl SourceAdapter for ListingPageAdapter {
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
        let url = self.search_url(query)?;
        self.pacer.wait_turn().await;
        let page = self
            .http
            .get(&self.name, url.as_str(), Some(&self.backoff))
            .await?;

        let mut records = parse_listing_html(&page.text(), &self.name, &page.final_url)?;
        records.truncate(self.max_results);
        debug!(source = %self.name, cards = records.len(), "listing page parsed");
        Ok(AdapterOutput::new(records))
    }
}

/// Cards with neither a name nor an address are skipped. Relative links are
/// resolved against `page_url`.
pub fn parse_listing_html(
    html: &str,
    source: &str,
    page_url: &str,
) -> Result<Vec<RawRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let cards = parse_selector(CARD_SELECTOR)?;
    let base = Url::parse(page_url).ok();

    let mut records = Vec::new();
    for card in document.select(&cards) {
        let name = select_first_text(card, ".name")?;
        let address = select_first_text(card, ".address")?;
        if name.is_none() && address.is_none() {
            continue;
        }
        let link = select_first_attr(card, "a[href]", "href")?.map(|href| match &base {
            Some(base) => base
                .join(&href)
                .map(|u| u.to_string())
                .unwrap_or(href),
            None => href,
        });
        records.push(RawRecord {
            name,
            address,
            city: select_first_text(card, ".city")?,
            state: select_first_text(card, ".state")?,
            zip: select_first_text(card, ".zip")?,
            units: select_first_text(card, ".units")?.map(Loose::Text),
            year_built: select_first_text(card, ".year-built")?.map(Loose::Text),
            rent_psf: select_first_text(card, ".psf")?.map(Loose::Text),
            rent_pu: select_first_text(card, ".rent")?.map(Loose::Text),
            occupancy_pct: select_first_text(card, ".occupancy")?.map(Loose::Text),
            concession_pct: select_first_text(card, ".concession")?.map(Loose::Text),
            amenities: select_all_texts(card, ".amenities li")?,
            notes: select_first_text(card, ".notes, .description")?,
            source: Some(source.to_string()),
            source_url: link,
        });
    }
    Ok(records)
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn select_first_text(card: ElementRef<'_>, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(card
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_all_texts(card: ElementRef<'_>, selector: &str) -> Result<Vec<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(card
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn select_first_attr(
    card: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(card
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none))
}
