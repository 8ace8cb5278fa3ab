// Copyright 2026 Comps Contributors
// SPDX-License-Identifier: Apache-2.0

//! Comps runtime library: adaptive listing scraping and comparable discovery
//! for real-estate valuation.
//!
//! The [`context::ScrapeContext`] wires everything together: a bounded
//! [`pool::BrowserPool`], the [`strategy::orchestrator::Orchestrator`] that
//! falls back through fetch techniques per source, and the
//! [`discovery::ComparableEngine`] that runs the tiered comparable search.

#![allow(clippy::new_without_default)]

pub mod cache;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod listing;
pub mod pool;
pub mod renderer;
pub mod sources;
pub mod store;
pub mod strategy;
