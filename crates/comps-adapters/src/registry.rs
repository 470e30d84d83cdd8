//! Ordered source registry (`sources.yaml`) and the adapter chain built from it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use comps_core::SourceTier;
use comps_storage::{BackoffPolicy, HttpFetcher};
use serde::Deserialize;
use tracing::info;

use crate::heuristic::DEFAULT_HEURISTIC_RESULTS;
use crate::{ExtractionApiAdapter, HeuristicAdapter, ListingPageAdapter, SourceAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ExtractionApi,
    ListingPage,
    Heuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> usize {
    BackoffPolicy::default().max_retries
}

fn default_base_delay_ms() -> u64 {
    BackoffPolicy::default().base_delay.as_millis() as u64
}

fn default_max_delay_ms() -> u64 {
    BackoffPolicy::default().max_delay.as_millis() as u64
}

impl From<RetryConfig> for BackoffPolicy {
    fn from(retry: RetryConfig) -> Self {
        BackoffPolicy {
            max_retries: retry.max_retries,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms.max(retry.base_delay_ms)),
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    pub tier: SourceTier,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub min_interval_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl SourceConfig {
    fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.unwrap_or(0))
    }

    fn endpoint(&self) -> Result<&str> {
        match self.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => Ok(endpoint),
            _ => bail!("source {} ({:?}) requires an endpoint", self.name, self.kind),
        }
    }
}

/// File order is priority order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn heuristic_only() -> Self {
        Self {
            sources: vec![SourceConfig {
                name: "heuristic".to_string(),
                kind: SourceKind::Heuristic,
                tier: SourceTier::Heuristic,
                enabled: true,
                endpoint: None,
                api_key_env: None,
                timeout_secs: None,
                max_results: None,
                min_interval_ms: None,
                retry: None,
            }],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).context("parsing source registry")?;
        Ok(registry)
    }

    /// A missing file means "heuristic only".
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            info!(path = %path.display(), "source registry not found; using heuristic generator only");
            return Ok(Self::heuristic_only());
        }
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Enabled sources, in registry order, as the injected adapter chain.
///
/// The heuristic tier may only close the chain; a registry with no enabled
/// heuristic source gets the default generator appended.
pub fn build_adapters(
    registry: &SourceRegistry,
    http: Arc<HttpFetcher>,
) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
    for source in registry.enabled() {
        let adapter: Arc<dyn SourceAdapter> = match source.kind {
            SourceKind::ExtractionApi => {
                let mut adapter = ExtractionApiAdapter::new(
                    &source.name,
                    source.tier,
                    source.endpoint()?,
                    http.clone(),
                )
                .with_api_key_env(source.api_key_env.clone())
                .with_timeout(source.timeout())
                .with_min_interval(source.min_interval());
                if let Some(max) = source.max_results {
                    adapter = adapter.with_max_results(max);
                }
                if let Some(retry) = source.retry {
                    adapter = adapter.with_backoff(retry.into());
                }
                Arc::new(adapter)
            }
            SourceKind::ListingPage => {
                let mut adapter = ListingPageAdapter::new(
                    &source.name,
                    source.tier,
                    source.endpoint()?,
                    http.clone(),
                )
                .with_timeout(source.timeout())
                .with_min_interval(source.min_interval());
                if let Some(max) = source.max_results {
                    adapter = adapter.with_max_results(max);
                }
                if let Some(retry) = source.retry {
                    adapter = adapter.with_backoff(retry.into());
                }
                Arc::new(adapter)
            }
            SourceKind::Heuristic => Arc::new(
                HeuristicAdapter::new(&source.name)
                    .with_max_results(source.max_results.unwrap_or(DEFAULT_HEURISTIC_RESULTS))
                    .with_timeout(source.timeout()),
            ),
        };
        info!(source = %source.name, tier = %source.tier, "registered source adapter");
        adapters.push(adapter);
    }

    let last = adapters.len().saturating_sub(1);
    if let Some((_, early)) = adapters
        .iter()
        .enumerate()
        .find(|(i, a)| *i < last && a.tier() == SourceTier::Heuristic)
    {
        bail!(
            "heuristic source `{}` must be the last enabled source",
            early.name()
        );
    }
    if !adapters.iter().any(|a| a.tier() == SourceTier::Heuristic) {
        info!("no heuristic source enabled; appending the default generator");
        adapters.push(Arc::new(HeuristicAdapter::default()));
    }
    Ok(adapters)
}
