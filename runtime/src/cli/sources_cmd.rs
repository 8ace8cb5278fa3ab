//! `comps sources`: registered sources and their technique chains.

use super::output;
use anyhow::Result;
use comps_runtime::sources::SourceId;
use serde_json::json;

pub async fn run() -> Result<()> {
    if output::is_json() {
        let rows: Vec<_> = SourceId::ALL
            .iter()
            .map(|s| {
                json!({
                    "source": s.as_str(),
                    "domains": s.domains(),
                    "techniques": s.techniques(),
                })
            })
            .collect();
        output::print_json(&rows);
        return Ok(());
    }

    for source in SourceId::ALL {
        let chain: Vec<&str> = source.techniques().iter().map(|t| t.as_str()).collect();
        println!("  {:<14} {}", source.as_str(), source.domains().join(", "));
        println!("  {:<14} {}", "", chain.join(" -> "));
    }
    Ok(())
}
