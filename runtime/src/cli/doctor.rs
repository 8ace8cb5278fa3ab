//! Environment readiness check.

use super::output;
use anyhow::Result;
use comps_runtime::config::RuntimeConfig;
use comps_runtime::renderer::chromium::ChromiumDriver;
use comps_runtime::sources::SourceId;
use serde_json::json;
use std::process::Command;

/// Rough resident size of one browser session.
const MB_PER_BROWSER: u64 = 256;

/// Check Chromium, configuration, sink path and available memory.
pub async fn run() -> Result<()> {
    let config = RuntimeConfig::from_env();
    let chromium = ChromiumDriver::detect();
    let config_check = config.validate();
    let sink_path = config
        .sink_path
        .clone()
        .unwrap_or_else(RuntimeConfig::default_sink_path);
    let sink_dir_ok = sink_path
        .parent()
        .map(|dir| std::fs::create_dir_all(dir).is_ok())
        .unwrap_or(false);
    let needed_mb = MB_PER_BROWSER * config.pool.max_browsers as u64;
    let mem_mb = get_available_memory_mb();

    if output::is_json() {
        output::print_json(&json!({
            "chromium": chromium.as_ref().ok().map(|d| d.path().display().to_string()),
            "config_valid": config_check.is_ok(),
            "config_error": config_check.as_ref().err().map(|e| e.to_string()),
            "sink_path": sink_path.display().to_string(),
            "sink_dir_writable": sink_dir_ok,
            "proxies": config.fetch.proxies.len(),
            "available_memory_mb": mem_mb,
            "needed_memory_mb": needed_mb,
            "sources": SourceId::ALL.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        }));
        return Ok(());
    }

    println!("Comps Doctor");
    println!("============");
    println!();
    println!("OS:   {}", std::env::consts::OS);
    println!("Arch: {}", std::env::consts::ARCH);
    println!();

    match &chromium {
        Ok(driver) => println!("[OK] Chromium found: {}", driver.path().display()),
        Err(e) => println!("[!!] {e:#} Browser techniques will fail; direct API still works."),
    }
    match &config_check {
        Ok(()) => println!(
            "[OK] Configuration valid (max browsers {}, close-enough {}, preferred {})",
            config.pool.max_browsers, config.discovery.close_enough, config.discovery.preferred
        ),
        Err(e) => println!("[!!] {e}"),
    }
    if sink_dir_ok {
        println!("[OK] Sink directory writable: {}", sink_path.display());
    } else {
        println!("[!!] Cannot create sink directory for {}", sink_path.display());
    }
    if config.fetch.proxies.is_empty() {
        println!("[--] No proxies configured (COMPS_PROXIES); proxy technique disabled");
    } else {
        println!("[OK] {} proxies configured", config.fetch.proxies.len());
    }
    match mem_mb {
        Some(mb) if mb >= needed_mb => {
            println!("[OK] Available memory: {mb}MB (>= {needed_mb}MB for the pool)")
        }
        Some(mb) => println!("[!!] Available memory: {mb}MB (< {needed_mb}MB, lower COMPS_MAX_BROWSERS)"),
        None => println!("[??] Could not determine available memory"),
    }

    println!();
    if chromium.is_ok() && config_check.is_ok() {
        println!("Status: READY");
    } else {
        println!("Status: NOT READY");
    }
    Ok(())
}

/// Get available memory in MB (platform-specific).
fn get_available_memory_mb() -> Option<u64> {
    #[cfg(target_os = "macos")]
    {
        let output = Command::new("sysctl")
            .args(["-n", "hw.memsize"])
            .output()
            .ok()?;
        let s = String::from_utf8_lossy(&output.stdout);
        let bytes: u64 = s.trim().parse().ok()?;
        Some(bytes / 1_048_576)
    }
    #[cfg(target_os = "linux")]
    {
        let output = Command::new("free").args(["-m"]).output().ok()?;
        let s = String::from_utf8_lossy(&output.stdout);
        s.lines()
            .find(|line| line.starts_with("Mem:"))
            .and_then(|line| line.split_whitespace().nth(6))
            .and_then(|v| v.parse().ok())
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}
