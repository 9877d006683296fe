use anyhow::{Context, Result};
use clap::Parser;
use probe_core::Config;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "preflight")]
#[command(about = "Preflight checks for a load run (DNS/TLS/HTTP reachability of the target)")]
struct Args {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target URL (overrides config)
    #[arg(long)]
    target: Option<String>,

    /// Scenario whose client settings should be shown (overrides config)
    #[arg(long)]
    scenario: Option<String>,

    /// Timeout for the reachability request in milliseconds
    #[arg(long, default_value = "10000")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    if let Some(target) = args.target {
        cfg.run.target = target;
    }
    if let Some(scenario) = args.scenario {
        cfg.run.scenario = scenario;
    }

    info!("Validating configuration...");
    cfg.validate()?;
    let catalog = cfg.catalog()?;
    let scenario = catalog.get(&cfg.run.scenario)?;

    let url = url::Url::parse(&cfg.run.target)
        .with_context(|| format!("Invalid target URL: {}", cfg.run.target))?;
    let host = url
        .host_str()
        .context("validated URL must have host_str")?
        .to_string();
    let port = url
        .port_or_known_default()
        .context("validated URL must have a port")?;

    println!();
    println!("=== Preflight ===");
    println!("Target: {}", url);
    println!(
        "Scenario: {} ({}), client={} protocol={:?} keep_alive={} idle/host={} max_conns/host={}",
        scenario.id,
        scenario.name,
        scenario.profile.name,
        scenario.profile.protocol,
        scenario.profile.keep_alive,
        scenario.profile.max_idle_per_host,
        scenario
            .profile
            .max_conns_per_host
            .map_or_else(|| "unlimited".to_string(), |n| n.to_string()),
    );

    let mut failures = 0u64;

    // DNS (required)
    let start = Instant::now();
    match tokio::net::lookup_host((host.as_str(), port)).await {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.collect();
            println!(
                "DNS {} -> {} address(es) ({}ms)",
                host,
                addrs.len(),
                start.elapsed().as_millis()
            );
            if addrs.is_empty() {
                failures = failures.saturating_add(1);
            }
        }
        Err(e) => {
            println!("DNS {} -> ERROR ({}ms)", host, start.elapsed().as_millis());
            warn!("DNS resolution failed: host={} error={}", host, e);
            failures = failures.saturating_add(1);
        }
    }

    if url.scheme() == "https" {
        println!("TLS hostname: {host}");
    }

    // Reachability runs on its own client so the load client pool stays cold.
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(args.timeout_ms.max(1)))
        .danger_accept_invalid_certs(!scenario.profile.verify_tls)
        .build()
        .context("Failed to build HTTP client")?;

    if !check_target(&client, &url).await {
        failures = failures.saturating_add(1);
    }

    if failures > 0 {
        anyhow::bail!("Preflight failed: {failures} check(s) failed");
    }

    println!();
    println!("Preflight OK.");
    Ok(())
}

async fn check_target(client: &reqwest::Client, url: &url::Url) -> bool {
    let start = Instant::now();
    let resp = client.get(url.clone()).send().await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match resp {
        Ok(r) => {
            let status = r.status();
            println!("GET {} -> {} {:?} ({}ms)", url, status.as_u16(), r.version(), latency_ms);
            if status.is_server_error() {
                warn!("Target returned a server error: {}", status);
                false
            } else {
                true
            }
        }
        Err(e) => {
            println!("GET {} -> ERROR ({}ms)", url, latency_ms);
            warn!("Target request failed: error={}", e);
            false
        }
    }
}
