use crate::transport::{Exchange, TransportError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How one request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// A response was received, whatever its status.
    Response { status: u16 },
    Timeout,
    Failed,
    Cancelled,
}

/// Sent by every request task to the stats collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOutcome {
    pub stage: usize,
    pub kind: OutcomeKind,
    pub latency_ms: u64,
}

impl RequestOutcome {
    pub fn new(stage: usize, result: &Result<Exchange, TransportError>, latency: Duration) -> Self {
        let kind = match result {
            Ok(exchange) => OutcomeKind::Response {
                status: exchange.status.as_u16(),
            },
            Err(TransportError::Timeout(_)) => OutcomeKind::Timeout,
            Err(TransportError::Cancelled) => OutcomeKind::Cancelled,
            Err(_) => OutcomeKind::Failed,
        };
        Self {
            stage,
            kind,
            latency_ms: latency.as_millis() as u64,
        }
    }

    pub fn cancelled(stage: usize, latency: Duration) -> Self {
        Self {
            stage,
            kind: OutcomeKind::Cancelled,
            latency_ms: latency.as_millis() as u64,
        }
    }
}

/// Run statistics with an integer-millisecond latency histogram.
///
/// Latencies are bucketed at 1ms resolution up to 10s; anything slower lands
/// in the last bucket. Only responses contribute latency samples.
#[derive(Debug, Clone)]
pub struct StatsCollector {
    pub completed: u64,
    pub responses: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    /// Responses per status class, 1xx through 5xx.
    pub status_classes: [u64; 5],
    latency_buckets: Vec<u64>,
    start_time: Instant,
}

const LATENCY_BUCKETS: usize = 10_000;

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            completed: 0,
            responses: 0,
            failed: 0,
            timeouts: 0,
            cancelled: 0,
            status_classes: [0; 5],
            latency_buckets: vec![0; LATENCY_BUCKETS],
            start_time: Instant::now(),
        }
    }

    pub fn record(&mut self, outcome: &RequestOutcome) {
        self.completed += 1;
        match outcome.kind {
            OutcomeKind::Response { status } => {
                self.responses += 1;
                if let Some(class) = (status / 100).checked_sub(1) {
                    if let Some(slot) = self.status_classes.get_mut(class as usize) {
                        *slot += 1;
                    }
                }
                self.record_latency(outcome.latency_ms);
            }
            OutcomeKind::Timeout => self.timeouts += 1,
            OutcomeKind::Failed => self.failed += 1,
            OutcomeKind::Cancelled => self.cancelled += 1,
        }
    }

    fn record_latency(&mut self, latency_ms: u64) {
        let bucket_idx = latency_ms.min((self.latency_buckets.len() - 1) as u64) as usize;
        self.latency_buckets[bucket_idx] += 1;
    }

    /// Percentile over response latencies (integer ms)
    pub fn percentile(&self, p: u64) -> u64 {
        let total: u64 = self.latency_buckets.iter().sum();
        if total == 0 {
            return 0;
        }

        let target = (total * p).div_ceil(100).max(1);
        let mut cumulative = 0u64;

        for (bucket_idx, &count) in self.latency_buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return bucket_idx as u64;
            }
        }

        self.latency_buckets.len() as u64
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            completed: self.completed,
            responses: self.responses,
            status_2xx: self.status_classes[1],
            status_other: self.responses - self.status_classes[1],
            failed: self.failed,
            timeouts: self.timeouts,
            cancelled: self.cancelled,
            latency_p50_ms: self.percentile(50),
            latency_p95_ms: self.percentile(95),
            latency_p99_ms: self.percentile(99),
            duration_ms: self.elapsed_ms(),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub completed: u64,
    pub responses: u64,
    pub status_2xx: u64,
    pub status_other: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub duration_ms: u64,
}

/// Drain `rx` into a collector until every sender is gone.
///
/// `on_progress` is called with the running totals every `progress_every`.
pub async fn collect<F>(
    mut rx: mpsc::Receiver<RequestOutcome>,
    progress_every: Duration,
    mut on_progress: F,
) -> StatsCollector
where
    F: FnMut(&StatsCollector),
{
    let mut stats = StatsCollector::new();
    let mut ticker = tokio::time::interval(progress_every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            outcome = rx.recv() => match outcome {
                Some(outcome) => stats.record(&outcome),
                None => break,
            },
            _ = ticker.tick() => on_progress(&stats),
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, latency_ms: u64) -> RequestOutcome {
        RequestOutcome {
            stage: 0,
            kind: OutcomeKind::Response { status },
            latency_ms,
        }
    }

    #[test]
    fn test_stats_collector_basic() {
        let mut stats = StatsCollector::new();

        stats.record(&response(200, 10));
        stats.record(&response(503, 12));
        stats.record(&RequestOutcome {
            stage: 0,
            kind: OutcomeKind::Timeout,
            latency_ms: 3000,
        });
        stats.record(&RequestOutcome::cancelled(1, Duration::from_millis(4)));

        let summary = stats.summary();
        assert_eq!(summary.completed, 4);
        assert_eq!(summary.responses, 2);
        assert_eq!(summary.status_2xx, 1);
        assert_eq!(summary.status_other, 1);
        assert_eq!(summary.timeouts, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(stats.status_classes[4], 1);
    }

    #[test]
    fn test_percentile_calculation() {
        let mut stats = StatsCollector::new();

        for _ in 0..50 {
            stats.record(&response(200, 10));
        }
        for _ in 0..30 {
            stats.record(&response(200, 20));
        }
        for _ in 0..20 {
            stats.record(&response(200, 50));
        }

        assert_eq!(stats.percentile(50), 10);
        assert_eq!(stats.percentile(80), 20);
        assert_eq!(stats.percentile(95), 50);
        assert_eq!(stats.percentile(0), 10);
    }

    #[test]
    fn test_slow_latency_lands_in_last_bucket() {
        let mut stats = StatsCollector::new();
        stats.record(&response(200, 60_000));
        assert_eq!(stats.percentile(99), (LATENCY_BUCKETS - 1) as u64);
    }

    #[test]
    fn test_outcome_from_result() {
        let timeout: Result<Exchange, TransportError> =
            Err(TransportError::Timeout(Duration::from_millis(500)));
        let outcome = RequestOutcome::new(2, &timeout, Duration::from_millis(500));
        assert_eq!(outcome.kind, OutcomeKind::Timeout);
        assert_eq!(outcome.stage, 2);

        let failed: Result<Exchange, TransportError> = Err(TransportError::Connect("refused".into()));
        assert_eq!(
            RequestOutcome::new(0, &failed, Duration::ZERO).kind,
            OutcomeKind::Failed
        );
    }

    #[tokio::test]
    async fn test_collect_until_senders_drop() {
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(collect(rx, Duration::from_secs(60), |_| {}));
        for i in 0..10 {
            tx.send(response(200, i)).await.unwrap();
        }
        drop(tx);
        let stats = handle.await.unwrap();
        assert_eq!(stats.completed, 10);
    }
}
