//! `comps comparables <url>`: parse a target listing and search its comparables.

use super::{build_context, output};
use anyhow::Result;
use comps_runtime::config::RuntimeConfig;
use comps_runtime::discovery::ScopeHint;
use serde_json::json;
use std::time::Duration;

pub async fn run(
    url: &str,
    limit: usize,
    scope: Option<ScopeHint>,
    timeout_secs: Option<u64>,
    broad: bool,
) -> Result<()> {
    let mut config = RuntimeConfig::from_env();
    if broad {
        config.discovery.broad_search = true;
    }
    let context = build_context(config)?;
    let deadline = timeout_secs.map(Duration::from_secs);
    let result = context.comparables_for(url, limit, scope, deadline).await;
    context.shutdown().await;
    let (target, found) = result?;

    if output::is_json() {
        output::print_json(&json!({
            "target": target.listing(),
            "segment": target.segment(),
            "market": target.market(),
            "comparables": found.comparables,
            "tier_trace": found.tier_trace,
        }));
        return Ok(());
    }

    println!("  Target ({} segment)", target.segment().as_str());
    println!("  {}", output::listing_line(target.listing()));
    println!();
    if found.comparables.is_empty() {
        println!("  No comparables found.");
    }
    for (i, comparable) in found.comparables.iter().enumerate() {
        println!(
            "  {:>2}. [{}] {}",
            i + 1,
            comparable.tier.as_str(),
            output::listing_line(&comparable.listing)
        );
        println!("      {}", comparable.listing.url);
    }
    if !output::is_quiet() {
        println!();
        for report in &found.tier_trace {
            println!("  {report}");
        }
    }
    Ok(())
}
