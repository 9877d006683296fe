use crate::census;
use crate::client::ClientSpec;
use crate::scenario::{Catalog, Scenario};
use crate::stage::StagePlan;
use anyhow::Context;
use http::Uri;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub run: RunConfig,
    pub telemetry: TelemetryConfig,
    /// Extra scenarios, added to (or replacing) the built-in ones
    pub scenarios: Vec<ScenarioConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Built-in scenarios merged with the ones from this file.
    pub fn catalog(&self) -> anyhow::Result<Catalog> {
        let mut catalog = Catalog::builtin();
        for sc in &self.scenarios {
            let profile = sc
                .client
                .resolve()
                .with_context(|| format!("Invalid client for scenario '{}'", sc.id))?;
            catalog.insert(Scenario {
                id: sc.id.clone(),
                name: sc.name.clone().unwrap_or_else(|| sc.id.clone()),
                stages: sc.stages.clone(),
                profile,
            })?;
        }
        Ok(catalog)
    }

    /// Parse the run target; only absolute http(s) URLs are accepted.
    pub fn target_uri(&self) -> anyhow::Result<Uri> {
        parse_target(&self.run.target)
    }

    /// Check everything a run needs before any stage starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        let catalog = self.catalog()?;
        catalog.get(&self.run.scenario)?;
        self.target_uri()?;
        if self.telemetry.sample_interval.is_zero() {
            anyhow::bail!("telemetry.sample_interval must be greater than zero");
        }
        if self.telemetry.census && self.telemetry.census_command.is_empty() {
            anyhow::bail!("telemetry.census_command must not be empty when census is enabled");
        }
        Ok(())
    }
}

pub fn parse_target(raw: &str) -> anyhow::Result<Uri> {
    let url = url::Url::parse(raw).with_context(|| format!("Invalid target URL: {raw}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("target must be http:// or https:// (got {raw})");
    }
    if url.host_str().is_none() {
        anyhow::bail!("target must include a host (got {raw})");
    }
    url.as_str()
        .parse::<Uri>()
        .with_context(|| format!("Invalid target URL: {raw}"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Scenario id to run
    pub scenario: String,
    /// URL every request is sent to
    pub target: String,
    /// Worker identifier for results
    pub worker_id: String,
    /// How long to wait for in-flight requests after the last stage
    #[serde(with = "humantime_serde")]
    pub drain_grace: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scenario: "1.1".to_string(),
            target: "https://www.google.com/".to_string(),
            worker_id: "worker-1".to_string(),
            drain_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Address to bind the Prometheus endpoint (e.g., "127.0.0.1:9100")
    pub bind_metrics: Option<SocketAddr>,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Run the OS connection census on every sample
    pub census: bool,
    /// Program and arguments used for the census
    pub census_command: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            bind_metrics: None,
            sample_interval: Duration::from_secs(1),
            census: false,
            census_command: census::default_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub stages: StagePlan,
    #[serde(default)]
    pub client: ClientSpec,
}
