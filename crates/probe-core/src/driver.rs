//! Staged load execution.
//!
//! Each stage gets a fresh [`Governor`] sized to its concurrency. The driver
//! admits one request per free slot until the stage deadline passes or the
//! run is cancelled. Request tasks from a finished stage are not awaited:
//! they keep running into the next stage and release their slots on the old
//! governor.

use crate::governor::{AdmissionError, Governor, Slot};
use crate::stage::Stage;
use crate::stats::RequestOutcome;
use crate::telemetry::ITERATIONS;
use crate::transport::Transport;
use http::Uri;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub index: usize,
    pub concurrency: u32,
    pub planned_ms: u64,
    /// Requests admitted while the stage was active
    pub admitted: u64,
    pub elapsed_ms: u64,
    /// Most slots held at once on this stage's governor
    pub peak_in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Requests admitted by this run
    pub iterations: u64,
    pub stages: Vec<StageReport>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

/// Live view of a driver, read by the sampler.
#[derive(Debug, Clone)]
pub struct DriverState {
    tracker: TaskTracker,
    governors: Arc<Mutex<Vec<Governor>>>,
    iterations: Arc<AtomicU64>,
}

impl DriverState {
    /// Request tasks still alive, across stages.
    pub fn tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Slots held across every stage, including requests that outlived
    /// their stage.
    pub fn held(&self) -> usize {
        self.governors.lock().iter().map(Governor::held).sum()
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }
}

pub struct LoadDriver<T> {
    transport: Arc<T>,
    target: Uri,
    cancel: CancellationToken,
    requests: CancellationToken,
    state: DriverState,
    outcomes: Option<mpsc::Sender<RequestOutcome>>,
}

impl<T: Transport + 'static> LoadDriver<T> {
    /// `cancel` stops admission and every in-flight request.
    pub fn new(transport: T, target: Uri, cancel: CancellationToken) -> Self {
        Self {
            transport: Arc::new(transport),
            target,
            requests: cancel.child_token(),
            cancel,
            state: DriverState {
                tracker: TaskTracker::new(),
                governors: Arc::new(Mutex::new(Vec::new())),
                iterations: Arc::new(AtomicU64::new(0)),
            },
            outcomes: None,
        }
    }

    /// Report every finished request on `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::Sender<RequestOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn state(&self) -> DriverState {
        self.state.clone()
    }

    /// Admissions since the driver was built.
    pub fn iterations(&self) -> u64 {
        self.state.iterations()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Drop the outcome sender so the collector can finish once the
    /// in-flight tasks have reported.
    pub fn close_outcomes(&mut self) {
        self.outcomes = None;
    }

    /// Execute `stages` in order. Returns early, with what was admitted so
    /// far, when the run is cancelled.
    pub async fn run(&self, stages: &[Stage]) -> RunReport {
        self.state.tracker.reopen();
        self.state.governors.lock().retain(|g| g.held() > 0);
        let run_start = Instant::now();
        let mut reports = Vec::with_capacity(stages.len());
        let mut cancelled = false;

        for (index, stage) in stages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let governor = Governor::new(stage.concurrency);
            self.state.governors.lock().push(governor.clone());
            let started = Instant::now();
            let deadline = tokio::time::Instant::now() + stage.duration;
            info!(
                stage = index,
                concurrency = stage.concurrency,
                duration = ?stage.duration,
                "stage started"
            );

            let mut admitted = 0u64;
            loop {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }

                let slot = tokio::select! {
                    biased;
                    res = governor.acquire(1, &self.cancel) => match res {
                        Ok(slot) => slot,
                        Err(AdmissionError::Cancelled) => {
                            cancelled = true;
                            break;
                        }
                        Err(e) => {
                            warn!(stage = index, error = %e, "admission failed, ending stage");
                            break;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                };

                self.state.iterations.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(ITERATIONS).increment(1);
                admitted += 1;
                self.spawn_request(index, slot);
            }

            let report = StageReport {
                index,
                concurrency: stage.concurrency,
                planned_ms: stage.duration.as_millis() as u64,
                admitted,
                elapsed_ms: started.elapsed().as_millis() as u64,
                peak_in_flight: governor.peak(),
            };
            info!(
                stage = index,
                admitted = report.admitted,
                peak = report.peak_in_flight,
                elapsed_ms = report.elapsed_ms,
                "stage finished"
            );
            reports.push(report);

            if cancelled {
                info!(stage = index, "run cancelled");
                break;
            }
        }

        RunReport {
            iterations: reports.iter().map(|r| r.admitted).sum(),
            stages: reports,
            cancelled,
            elapsed_ms: run_start.elapsed().as_millis() as u64,
        }
    }

    fn spawn_request(&self, stage: usize, slot: Slot) {
        let transport = self.transport.clone();
        let target = self.target.clone();
        let cancel = self.requests.clone();
        let outcomes = self.outcomes.clone();

        self.state.tracker.spawn(async move {
            let start = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => RequestOutcome::cancelled(stage, start.elapsed()),
                result = transport.send(&target) => {
                    if let Err(e) = &result {
                        warn!(stage, kind = e.kind(), error = %e, "request failed");
                    }
                    RequestOutcome::new(stage, &result, start.elapsed())
                }
            };
            drop(slot);

            if let Some(tx) = outcomes {
                let _ = tx.send(outcome).await;
            }
        });
    }

    /// Wait up to `grace` for in-flight requests, then cancel the rest.
    ///
    /// Returns `true` when everything finished within the grace period.
    pub async fn drain(&self, grace: Duration) -> bool {
        let tracker = &self.state.tracker;
        tracker.close();
        if tokio::time::timeout(grace, tracker.wait()).await.is_ok() {
            return true;
        }

        warn!(
            remaining = tracker.len(),
            grace = ?grace,
            "requests still in flight after grace period, cancelling"
        );
        self.requests.cancel();
        tracker.wait().await;
        false
    }
}
