//! CLI subcommand implementations for the `comps` binary.

pub mod comparables_cmd;
pub mod doctor;
pub mod output;
pub mod parse_cmd;
pub mod sources_cmd;

use anyhow::{Context, Result};
use comps_runtime::config::RuntimeConfig;
use comps_runtime::context::ScrapeContext;
use comps_runtime::renderer::chromium::ChromiumDriver;
use comps_runtime::renderer::{BrowserDriver, NoopDriver};
use std::sync::Arc;
use tracing::warn;

/// Build the process context, falling back to HTTP-only mode without Chromium.
pub fn build_context(config: RuntimeConfig) -> Result<ScrapeContext> {
    let driver: Arc<dyn BrowserDriver> = match ChromiumDriver::detect() {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            warn!("{e:#} Browser techniques are disabled.");
            Arc::new(NoopDriver)
        }
    };
    ScrapeContext::builder(config)
        .driver(driver)
        .build()
        .context("failed to initialize the scraping runtime")
}
