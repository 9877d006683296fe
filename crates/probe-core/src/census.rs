//! Operating-system view of this process's connections.

use crate::telemetry::{ATTR_STATE, NETSTAT_CONNECTIONS, NETSTAT_DURATION};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

/// The netstat invocation that prints an owning pid on this platform.
pub fn default_command() -> Vec<String> {
    let args = if cfg!(windows) { "-ano" } else { "-antp" };
    vec!["netstat".to_string(), args.to_string()]
}

/// Runs a netstat-style command and counts this process's sockets by state.
#[derive(Debug, Clone)]
pub struct Census {
    program: String,
    args: Vec<String>,
    pid: u32,
    /// States with a published gauge, zeroed once they disappear.
    published: Arc<Mutex<BTreeSet<String>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CensusSample {
    pub by_state: BTreeMap<String, u64>,
    pub total: u64,
}

/// What [`parse_netstat`] found in one command output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetstatCounts {
    /// This process's TCP sockets, per state
    pub by_state: BTreeMap<String, u64>,
    pub tcp_lines: u64,
    /// TCP lines without a recognisable owner column
    pub unowned: u64,
}

impl Census {
    /// Use `command` (program followed by its arguments).
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("census command must name a program")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            pid: std::process::id(),
            published: Arc::default(),
        })
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Run the command once and publish per-state gauges.
    pub async fn count(&self) -> Result<CensusSample> {
        let start = Instant::now();
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await;
        metrics::histogram!(NETSTAT_DURATION).record(start.elapsed().as_secs_f64());

        let output = output.with_context(|| format!("Failed to run {}", self.program))?;
        if !output.status.success() {
            anyhow::bail!("{} exited with {}", self.program, output.status);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let parsed = parse_netstat(&text, self.pid);
        if parsed.tcp_lines > 0 && parsed.unowned == parsed.tcp_lines {
            warn!(
                program = %self.program,
                args = ?self.args,
                lines = parsed.tcp_lines,
                "census output has no pid column, counts will be empty"
            );
        }

        self.publish(&parsed.by_state);
        let by_state = parsed.by_state;
        let total = by_state.values().sum();
        debug!(total, states = by_state.len(), "census sampled");
        Ok(CensusSample { by_state, total })
    }

    fn publish(&self, by_state: &BTreeMap<String, u64>) {
        let mut published = self.published.lock();
        for gone in published.iter().filter(|s| !by_state.contains_key(*s)) {
            metrics::gauge!(NETSTAT_CONNECTIONS, ATTR_STATE => gone.clone()).set(0.0);
        }
        published.retain(|s| by_state.contains_key(s));
        for (state, count) in by_state {
            metrics::gauge!(NETSTAT_CONNECTIONS, ATTR_STATE => state.clone()).set(*count as f64);
            published.insert(state.clone());
        }
    }

    /// Zero every per-state gauge this census has published.
    pub fn reset(&self) {
        for state in std::mem::take(&mut *self.published.lock()) {
            metrics::gauge!(NETSTAT_CONNECTIONS, ATTR_STATE => state).set(0.0);
        }
    }
}

/// Count TCP sockets owned by `pid`, per state.
///
/// Understands the Windows `netstat -ano` layout
/// (`proto local remote state pid`) and the Linux `netstat -antp` layout
/// (`proto recv-q send-q local remote state pid/program`). Lines from other
/// processes are skipped; a `-` owner counts as another process.
pub fn parse_netstat(output: &str, pid: u32) -> NetstatCounts {
    let mut counts = NetstatCounts::default();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(proto) = fields.first() else {
            continue;
        };
        if !proto.to_ascii_lowercase().starts_with("tcp") {
            continue;
        }
        counts.tcp_lines += 1;

        let (state, owner) = match fields.len() {
            5 => (fields[3], fields[4]),
            n if n >= 7 => (fields[5], fields[6]),
            _ => {
                counts.unowned += 1;
                continue;
            }
        };
        if owner == "-" {
            continue;
        }
        let owner = owner.split('/').next().unwrap_or_default();
        match owner.parse::<u32>() {
            Ok(p) if p == pid => *counts.by_state.entry(state.to_string()).or_insert(0) += 1,
            Ok(_) => {}
            Err(_) => counts.unowned += 1,
        }
    }
    counts
}
