use anyhow::{Context, Result};
use clap::Parser;
use http::Uri;
use probe_core::{
    accountant, parse_stages, stats, telemetry, Catalog, Census, Config, ConnectionCounts,
    Instrumented, LoadDriver, RequestOutcome, Sampler, Scenario, StageReport, StatsCollector,
    StubTransport, Transport,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Connection-pooling load tester - runs a staged scenario against a target")]
struct Args {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Scenario id (overrides config)
    #[arg(long)]
    scenario: Option<String>,

    /// Target URL (overrides config)
    #[arg(long)]
    target: Option<String>,

    /// Transport mode: http or mock
    #[arg(long, default_value = "http")]
    mode: String,

    /// Stage list replacing the scenario's, e.g. "2x20s,100x20s,2x20s"
    #[arg(long)]
    stages: Option<String>,

    /// Worker ID (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Print stats every N milliseconds
    #[arg(long, default_value = "1000")]
    print_every_ms: u64,

    /// List available scenarios and exit
    #[arg(long)]
    list: bool,

    /// Sample OS connection states with netstat (overrides config)
    #[arg(long)]
    census: bool,

    /// Serve Prometheus metrics on this address (overrides config)
    #[arg(long)]
    bind_metrics: Option<SocketAddr>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerResult {
    worker_id: String,
    scenario_id: String,
    scenario_name: String,
    client: String,
    target: String,
    timestamp: String,
    duration_ms: u64,
    iterations: u64,
    cancelled: bool,
    drained: bool,
    completed: u64,
    responses: u64,
    status_2xx: u64,
    status_other: u64,
    failed: u64,
    timeouts: u64,
    aborted: u64,
    latency_p50_ms: u64,
    latency_p95_ms: u64,
    latency_p99_ms: u64,
    achieved_rps: u64,
    connections: ConnectionCounts,
    stages: Vec<StageReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };

    if let Some(scenario) = args.scenario {
        config.run.scenario = scenario;
    }
    if let Some(target) = args.target {
        config.run.target = target;
    }
    if let Some(worker_id) = args.worker_id {
        config.run.worker_id = worker_id;
    }
    if args.census {
        config.telemetry.census = true;
    }
    if args.bind_metrics.is_some() {
        config.telemetry.bind_metrics = args.bind_metrics;
    }

    if args.list {
        print_catalog(&config.catalog()?);
        return Ok(());
    }

    config.validate()?;
    let catalog = config.catalog()?;
    let mut scenario = catalog.get(&config.run.scenario)?.clone();
    if let Some(stages) = &args.stages {
        scenario.stages =
            parse_stages(stages).with_context(|| format!("Invalid --stages '{stages}'"))?;
    }
    let target = config.target_uri()?;

    if let Some(addr) = config.telemetry.bind_metrics {
        telemetry::install_prometheus(addr)?;
        info!("Serving metrics on http://{}/metrics", addr);
    }

    info!(
        "Starting worker '{}' in {} mode: scenario {} ({})",
        config.run.worker_id, args.mode, scenario.id, scenario.name
    );
    info!("Target: {}", target);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping run");
                cancel.cancel();
            }
        });
    }

    let result = match args.mode.as_str() {
        "mock" => {
            let stub = StubTransport::new(Duration::from_millis(5));
            run_scenario(&config, &scenario, target, stub, cancel, args.print_every_ms).await?
        }
        "http" => {
            let client = scenario
                .profile
                .build()
                .context("Failed to create HTTP client")?;
            run_scenario(&config, &scenario, target, client, cancel, args.print_every_ms).await?
        }
        _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
    };

    // Write results to file
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let output_path = format!("results/worker_{}_{}.json", config.run.worker_id, timestamp);

    std::fs::create_dir_all("results").ok();
    let result_json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&output_path, result_json)
        .with_context(|| format!("Failed to write {}", output_path))?;

    info!("Results written to {}", output_path);
    print_summary(&result);

    Ok(())
}

async fn run_scenario<T: Transport + 'static>(
    config: &Config,
    scenario: &Scenario,
    target: Uri,
    transport: T,
    cancel: CancellationToken,
    print_every_ms: u64,
) -> Result<WorkerResult> {
    let client = transport.name().to_string();

    // Create channel for collecting outcomes
    let (outcome_tx, outcome_rx) = mpsc::channel::<RequestOutcome>(10000);
    let stats_handle = tokio::spawn(stats::collect(
        outcome_rx,
        Duration::from_millis(print_every_ms),
        print_progress,
    ));

    let mut driver =
        LoadDriver::new(Instrumented::new(transport), target.clone(), cancel.clone())
            .with_outcomes(outcome_tx);

    let mut sampler = Sampler::new(config.telemetry.sample_interval, accountant::global())
        .with_driver(driver.state());
    if config.telemetry.census {
        sampler = sampler.with_census(Census::from_command(&config.telemetry.census_command)?);
    }
    let sampler_cancel = cancel.child_token();
    let sampler_handle = tokio::spawn(sampler.run(sampler_cancel.clone()));

    info!(
        "Planned {} stages, total duration: {:?}, peak concurrency: {}",
        scenario.stages.stages().len(),
        scenario.stages.total_duration(),
        scenario.stages.max_concurrency()
    );

    let report = driver.run(scenario.stages.stages()).await;

    // Wait for in-flight requests to complete
    info!("Waiting for in-flight requests to complete...");
    let drained = driver.drain(config.run.drain_grace).await;

    // Close outcome channel and wait for stats collector
    driver.close_outcomes();
    let stats = stats_handle.await?;
    sampler_cancel.cancel();
    sampler_handle.await?;

    let summary = stats.summary();
    let elapsed_ms = report.elapsed_ms;
    let achieved_rps = if elapsed_ms > 0 {
        (summary.responses * 1000) / elapsed_ms
    } else {
        0
    };

    Ok(WorkerResult {
        worker_id: config.run.worker_id.clone(),
        scenario_id: scenario.id.clone(),
        scenario_name: scenario.name.clone(),
        client,
        target: target.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        duration_ms: elapsed_ms,
        iterations: report.iterations,
        cancelled: report.cancelled,
        drained,
        completed: summary.completed,
        responses: summary.responses,
        status_2xx: summary.status_2xx,
        status_other: summary.status_other,
        failed: summary.failed,
        timeouts: summary.timeouts,
        aborted: summary.cancelled,
        latency_p50_ms: summary.latency_p50_ms,
        latency_p95_ms: summary.latency_p95_ms,
        latency_p99_ms: summary.latency_p99_ms,
        achieved_rps,
        connections: accountant::global().snapshot(),
        stages: report.stages,
    })
}

fn print_catalog(catalog: &Catalog) {
    println!("\n=== Scenarios ===");
    for scenario in catalog.iter() {
        let stages: Vec<String> = scenario
            .stages
            .stages()
            .iter()
            .map(|s| format!("{}x{}", s.concurrency, humantime_secs(s.duration)))
            .collect();
        println!(
            "{:<6} {:<50} client={:<20} stages={}",
            scenario.id,
            scenario.name,
            scenario.profile.name,
            stages.join(",")
        );
    }
    println!();
}

fn humantime_secs(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn print_progress(stats: &StatsCollector) {
    let summary = stats.summary();
    let elapsed_s = summary.duration_ms / 1000;
    let rps = if elapsed_s > 0 {
        summary.responses / elapsed_s
    } else {
        0
    };

    info!(
        "Progress: completed={} responses={} failed={} timeouts={} open_conns={} rps={} p50={}ms p95={}ms p99={}ms",
        summary.completed,
        summary.responses,
        summary.failed,
        summary.timeouts,
        accountant::global().open(),
        rps,
        summary.latency_p50_ms,
        summary.latency_p95_ms,
        summary.latency_p99_ms
    );
}

fn print_summary(result: &WorkerResult) {
    println!("\n=== Worker {} Summary ===", result.worker_id);
    println!("Scenario: {} ({})", result.scenario_id, result.scenario_name);
    println!("Client: {}", result.client);
    println!("Target: {}", result.target);
    println!("Duration: {}ms", result.duration_ms);
    if result.cancelled {
        println!("Run was cancelled");
    }
    for stage in &result.stages {
        println!(
            "Stage {}: concurrency={} admitted={} peak_in_flight={} elapsed={}ms",
            stage.index, stage.concurrency, stage.admitted, stage.peak_in_flight, stage.elapsed_ms
        );
    }
    println!("Iterations: {}", result.iterations);
    println!(
        "Responses: {} (2xx={}, other={})",
        result.responses, result.status_2xx, result.status_other
    );
    println!("Failed: {}", result.failed);
    println!("Timeouts: {}", result.timeouts);
    println!("Aborted: {}", result.aborted);
    println!(
        "Connections: opened={} closed={} open={}",
        result.connections.opened, result.connections.closed, result.connections.open
    );
    println!("Achieved RPS: {}", result.achieved_rps);
    println!("Latency p50: {}ms", result.latency_p50_ms);
    println!("Latency p95: {}ms", result.latency_p95_ms);
    println!("Latency p99: {}ms", result.latency_p99_ms);
    println!();
}
