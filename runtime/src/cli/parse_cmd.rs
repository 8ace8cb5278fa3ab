//! `comps parse <url>`: fetch one listing through the technique chain.

use super::{build_context, output};
use anyhow::{bail, Result};
use comps_runtime::config::RuntimeConfig;
use comps_runtime::error::ScrapeError;
use comps_runtime::strategy::{StatsRow, Technique, TraceEntry};
use serde_json::json;
use std::time::Duration;

pub async fn run(
    url: &str,
    technique: Option<Technique>,
    no_fallback: bool,
    show_stats: bool,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let context = build_context(RuntimeConfig::from_env())?;
    let orchestrator = context.orchestrator();
    let result = match timeout_secs {
        Some(secs) => {
            orchestrator
                .parse_with_deadline(url, technique, !no_fallback, Duration::from_secs(secs))
                .await
        }
        None => orchestrator.parse(url, technique, !no_fallback).await,
    };
    let stats = context.stats().snapshot();
    context.shutdown().await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(ScrapeError::StrategyExhausted { url, trace }) => {
            if output::is_json() {
                output::print_json(&json!({
                    "error": true,
                    "message": format!("all techniques failed for {url}"),
                    "trace": trace,
                }));
                std::process::exit(1);
            }
            if !output::is_quiet() {
                print_trace(&trace);
            }
            bail!("all {} techniques failed for {url}", trace.len());
        }
        Err(e) => return Err(e.into()),
    };

    if output::is_json() {
        let mut value = json!({
            "listing": outcome.listing,
            "technique_used": outcome.technique_used,
            "elapsed_ms": outcome.elapsed.as_millis() as u64,
            "from_cache": outcome.from_cache,
            "trace": outcome.trace,
        });
        if show_stats {
            value["stats"] = json!(stats);
        }
        output::print_json(&value);
        return Ok(());
    }

    let listing = &outcome.listing;
    println!("  {}", listing.title);
    println!("  {}", output::listing_line(listing));
    if !listing.transit_stops.is_empty() {
        println!("  Метро: {}", listing.transit_stops.join(", "));
    }
    if let Some(complex) = &listing.residential_complex {
        println!("  ЖК: {complex}");
    }
    println!("  {}", listing.url);
    println!();
    println!(
        "  via {} in {}ms{}",
        outcome.technique_used,
        outcome.elapsed.as_millis(),
        if outcome.from_cache { " (cache)" } else { "" }
    );
    if !output::is_quiet() {
        print_trace(&outcome.trace);
    }
    if show_stats {
        print_stats(&stats);
    }
    Ok(())
}

fn print_trace(trace: &[TraceEntry]) {
    for (i, entry) in trace.iter().enumerate() {
        println!(
            "  {}. {:<17} {:<9} {:>6}ms  {}",
            i + 1,
            entry.technique.as_str(),
            format!("{:?}", entry.outcome).to_lowercase(),
            entry.elapsed_ms,
            entry.detail.as_deref().unwrap_or("")
        );
    }
}

fn print_stats(rows: &[StatsRow]) {
    println!();
    println!(
        "  {:<14} {:<17} {:>8} {:>8} {:>8} {:>7} {:>10}",
        "source", "technique", "attempts", "success", "failure", "rate", "latency"
    );
    for row in rows {
        println!(
            "  {:<14} {:<17} {:>8} {:>8} {:>8} {:>6.0}% {:>8.0}ms",
            row.source.as_str(),
            row.technique.as_str(),
            row.stats.attempts,
            row.stats.successes,
            row.stats.failures,
            row.success_rate * 100.0,
            row.stats.avg_latency_ms
        );
    }
}
