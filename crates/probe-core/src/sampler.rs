use crate::accountant::{ConnectionAccountant, ConnectionCounts};
use crate::census::Census;
use crate::driver::DriverState;
use crate::telemetry::{
    CONNECTIONS_CLOSED, CONNECTIONS_OPENED, GOVERNOR_HELD, OPEN_CONNECTIONS, TASK_COUNT,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Values published by one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub tasks: usize,
    pub held: usize,
    pub connections: ConnectionCounts,
}

/// Publishes point-in-time gauges on a fixed interval until cancelled.
pub struct Sampler {
    interval: Duration,
    accountant: Arc<ConnectionAccountant>,
    driver: Option<DriverState>,
    census: Option<Census>,
}

impl Sampler {
    pub fn new(interval: Duration, accountant: Arc<ConnectionAccountant>) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            accountant,
            driver: None,
            census: None,
        }
    }

    pub fn with_driver(mut self, driver: DriverState) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_census(mut self, census: Census) -> Self {
        self.census = Some(census);
        self
    }

    /// Publish the in-process gauges once.
    pub fn emit(&self) -> Snapshot {
        let snapshot = Snapshot {
            tasks: self.driver.as_ref().map_or(0, DriverState::tasks),
            held: self.driver.as_ref().map_or(0, DriverState::held),
            connections: self.accountant.snapshot(),
        };
        metrics::gauge!(TASK_COUNT).set(snapshot.tasks as f64);
        metrics::gauge!(GOVERNOR_HELD).set(snapshot.held as f64);
        metrics::gauge!(OPEN_CONNECTIONS).set(snapshot.connections.open as f64);
        metrics::gauge!(CONNECTIONS_OPENED).set(snapshot.connections.opened as f64);
        metrics::gauge!(CONNECTIONS_CLOSED).set(snapshot.connections.closed as f64);
        snapshot
    }

    fn reset(&self) {
        metrics::gauge!(TASK_COUNT).set(0.0);
        metrics::gauge!(GOVERNOR_HELD).set(0.0);
        metrics::gauge!(OPEN_CONNECTIONS).set(0.0);
        metrics::gauge!(CONNECTIONS_OPENED).set(0.0);
        metrics::gauge!(CONNECTIONS_CLOSED).set(0.0);
        if let Some(census) = &self.census {
            census.reset();
        }
    }

    /// Tick until `cancel` fires. Returns the number of completed ticks.
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let snapshot = self.emit();
            debug!(
                tasks = snapshot.tasks,
                held = snapshot.held,
                open = snapshot.connections.open,
                "sample"
            );

            if let Some(census) = &self.census {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    res = census.count() => {
                        if let Err(e) = res {
                            warn!(error = %e, "connection census failed, skipping sample");
                        }
                    }
                }
            }
            ticks += 1;
        }

        self.reset();
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_stops_when_cancelled() {
        let acct = Arc::new(ConnectionAccountant::new());
        let sampler = Sampler::new(Duration::from_millis(10), acct);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(sampler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(55)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();

        let ticks = handle.await.unwrap();
        assert!(ticks >= 2, "ticks = {ticks}");
        assert!(cancelled_at.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_emit_reads_accountant() {
        let acct = Arc::new(ConnectionAccountant::new());
        acct.connection_opened();
        acct.connection_opened();
        acct.connection_closed();

        let snapshot = Sampler::new(Duration::from_secs(1), acct).emit();
        assert_eq!(snapshot.tasks, 0);
        assert_eq!(snapshot.connections.open, 1);
        assert_eq!(snapshot.connections.opened, 2);
    }

    #[tokio::test]
    async fn test_failing_census_does_not_stop_sampling() {
        let acct = Arc::new(ConnectionAccountant::new());
        let census = Census::from_command(&["no-such-census-binary".to_string()]).unwrap();
        let sampler = Sampler::new(Duration::from_millis(5), acct).with_census(census);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(sampler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        assert!(handle.await.unwrap() >= 2);
    }
}
