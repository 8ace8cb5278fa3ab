//! Multi-source fan-out.
//!
//! Runs one catalog search per source on a bounded worker pool sized to the
//! source count and concatenates the results in source order. A failing
//! source is reported next to the results and never aborts its siblings.

use crate::error::{ScrapeError, ScrapeResult};
use crate::listing::PropertyListing;
use crate::sources::{SearchQuery, SourceId};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

/// Catalog access consumed by comparable discovery.
#[async_trait]
pub trait ListingProvider: Send + Sync {
    /// Run a parametrized search on one source.
    async fn search(&self, source: SourceId, query: &SearchQuery) -> ScrapeResult<Vec<PropertyListing>>;

    /// Fetch a known catalog URL (a complex page, a street page).
    async fn fetch_catalog(&self, url: &str) -> ScrapeResult<Vec<PropertyListing>>;
}

#[derive(Debug, Default)]
pub struct FanOutResult {
    pub listings: Vec<PropertyListing>,
    pub failures: Vec<(SourceId, ScrapeError)>,
}

impl FanOutResult {
    /// Every source failed (and at least one was asked).
    pub fn all_failed(&self) -> bool {
        self.listings.is_empty() && !self.failures.is_empty()
    }
}

/// Search every source in parallel and concatenate what succeeded.
pub async fn fan_out(
    provider: &dyn ListingProvider,
    sources: &[SourceId],
    query: &SearchQuery,
) -> FanOutResult {
    let workers = sources.len().max(1);
    let results: Vec<(SourceId, ScrapeResult<Vec<PropertyListing>>)> = stream::iter(sources.iter().copied())
        .map(|source| async move { (source, provider.search(source, query).await) })
        .buffered(workers)
        .collect()
        .await;

    let mut out = FanOutResult::default();
    for (source, result) in results {
        match result {
            Ok(listings) => {
                debug!(source = %source, listings = listings.len(), "fan-out source answered");
                out.listings.extend(listings);
            }
            Err(e) => {
                warn!(source = %source, "fan-out source failed: {e}");
                out.failures.push((source, e));
            }
        }
    }
    out
}
