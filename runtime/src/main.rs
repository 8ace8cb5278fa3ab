// Copyright 2026 Comps Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use comps_runtime::discovery::ScopeHint;
use comps_runtime::strategy::Technique;
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser)]
#[command(
    name = "comps",
    about = "Comps: adaptive listing scraper and comparable finder for real-estate valuation",
    version,
    after_help = "Run 'comps <command> --help' for details on each command."
)]
struct Cli {
    /// Output results (and log lines) as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Suppress traces and non-essential output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Enable verbose/debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse one listing URL through the technique fallback chain
    Parse {
        /// Listing URL (cian.ru, avito.ru, domclick.ru, realty.yandex.ru)
        url: String,
        /// Try this technique first (direct_api, light_browser, hardened_browser, proxy_browser)
        #[arg(long)]
        technique: Option<Technique>,
        /// Stop after the first technique
        #[arg(long)]
        no_fallback: bool,
        /// Print per-technique statistics after the run
        #[arg(long)]
        stats: bool,
        /// Overall deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Find comparable listings for a target listing URL
    Comparables {
        /// Target listing URL
        url: String,
        /// Maximum number of comparables
        #[arg(long, default_value = "10")]
        limit: usize,
        /// Prefer the transit stop or the district for the area query (stop, district)
        #[arg(long)]
        scope: Option<ScopeHint>,
        /// Overall deadline in seconds; partial results are returned on expiry
        #[arg(long)]
        timeout: Option<u64>,
        /// Also run the city-wide and relaxed tiers
        #[arg(long)]
        broad: bool,
    },
    /// List supported sources and their technique chains
    Sources,
    /// Check environment and diagnose issues
    Doctor,
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "comps=debug" } else { "comps=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Output flags are read by every subcommand through the environment.
    if cli.json {
        std::env::set_var("COMPS_JSON", "1");
    }
    if cli.quiet {
        std::env::set_var("COMPS_QUIET", "1");
    }
    init_tracing(cli.verbose, cli.json);

    let result = match cli.command {
        Commands::Parse {
            url,
            technique,
            no_fallback,
            stats,
            timeout,
        } => cli::parse_cmd::run(&url, technique, no_fallback, stats, timeout).await,
        Commands::Comparables {
            url,
            limit,
            scope,
            timeout,
            broad,
        } => cli::comparables_cmd::run(&url, limit, scope, timeout, broad).await,
        Commands::Sources => cli::sources_cmd::run().await,
        Commands::Doctor => cli::doctor::run().await,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "comps", &mut std::io::stdout());
            Ok(())
        }
    };

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        if cli::output::is_json() {
            cli::output::print_json(&serde_json::json!({
                "error": true,
                "message": format!("{e:#}"),
            }));
        } else {
            eprintln!("  Error: {e:#}");
        }
        std::process::exit(1);
    }

    result
}
