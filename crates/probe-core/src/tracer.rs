//! Per-request lifecycle tracing.
//!
//! A [`RequestTrace`] is created for every outbound request and installed as
//! a task-local for the duration of that request's future. The connector and
//! the pooled client look it up through [`current`] and report phase
//! boundaries to it. Every phase emits its measurement as soon as it ends, so
//! a request that later fails or hangs still contributes the phases it
//! reached.
//!
//! A trace is never shared between requests. The only state it touches
//! outside itself is the metrics recorder.

use crate::telemetry::{
    ATTR_REUSED, ATTR_WAS_IDLE, CONNECT_DURATION, DNS_DURATION, HTTP_CONNECTION, IDLE_DURATION,
    REQUEST_DURATION, TLS_HANDSHAKE_DURATION, TTFB_DURATION,
};
use metrics::Label;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

tokio::task_local! {
    static CURRENT: Arc<RequestTrace>;
}

/// Run `fut` with `trace` as the current request trace.
pub async fn scope<F>(trace: Arc<RequestTrace>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(trace, fut).await
}

/// The trace of the request being driven by the current task, if any.
pub fn current() -> Option<Arc<RequestTrace>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Like [`current`], but falls back to a detached trace so connection-level
/// phases outside any request are still measured.
pub fn current_or_detached() -> Arc<RequestTrace> {
    current().unwrap_or_else(|| Arc::new(RequestTrace::detached()))
}

/// Phase timestamps of one request. Phases that did not happen stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceRecord {
    pub request_start: Option<Instant>,
    pub dns_start: Option<Instant>,
    pub dns_end: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_end: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_end: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub request_end: Option<Instant>,
    pub reused: bool,
    pub was_idle: bool,
    pub idle: Option<Duration>,
}

impl TraceRecord {
    /// Timestamps that occurred, in lifecycle order.
    pub fn ordered_phases(&self) -> Vec<(&'static str, Instant)> {
        [
            ("request_start", self.request_start),
            ("dns_start", self.dns_start),
            ("dns_end", self.dns_end),
            ("connect_start", self.connect_start),
            ("connect_end", self.connect_end),
            ("tls_start", self.tls_start),
            ("tls_end", self.tls_end),
            ("first_byte", self.first_byte),
            ("request_end", self.request_end),
        ]
        .into_iter()
        .filter_map(|(name, at)| at.map(|at| (name, at)))
        .collect()
    }

    /// True when every recorded phase is at or after the one before it.
    pub fn is_monotonic(&self) -> bool {
        self.ordered_phases().windows(2).all(|w| w[0].1 <= w[1].1)
    }
}

/// Facts about the pooled connection a request was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    pub reused: bool,
    pub was_idle: bool,
    pub idle: Duration,
}

#[derive(Debug)]
pub struct RequestTrace {
    record: Mutex<TraceRecord>,
}

impl Default for RequestTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTrace {
    /// A trace whose request starts now.
    pub fn new() -> Self {
        Self {
            record: Mutex::new(TraceRecord {
                request_start: Some(Instant::now()),
                ..TraceRecord::default()
            }),
        }
    }

    /// A trace not bound to any request (no start, so no TTFB or duration).
    pub fn detached() -> Self {
        Self {
            record: Mutex::new(TraceRecord::default()),
        }
    }

    pub fn record(&self) -> TraceRecord {
        *self.record.lock()
    }

    pub fn dns_start(&self) {
        self.record.lock().dns_start = Some(Instant::now());
    }

    pub fn dns_done(&self) {
        let now = Instant::now();
        let start = {
            let mut rec = self.record.lock();
            rec.dns_end = Some(now);
            // The dialer marks connect_start before it resolves; the socket
            // connect itself only begins once resolution is over.
            if rec.connect_start.is_some_and(|c| c < now) {
                rec.connect_start = Some(now);
            }
            rec.dns_start
        };
        if let Some(start) = start {
            metrics::histogram!(DNS_DURATION).record(now.duration_since(start).as_secs_f64());
        }
    }

    pub fn connect_start(&self) {
        self.record.lock().connect_start = Some(Instant::now());
    }

    pub fn connect_done(&self) {
        let now = Instant::now();
        let start = {
            let mut rec = self.record.lock();
            rec.connect_end = Some(now);
            rec.connect_start
        };
        if let Some(start) = start {
            metrics::histogram!(CONNECT_DURATION).record(now.duration_since(start).as_secs_f64());
        }
    }

    pub fn tls_start(&self) {
        self.record.lock().tls_start = Some(Instant::now());
    }

    pub fn tls_done(&self) {
        let now = Instant::now();
        let start = {
            let mut rec = self.record.lock();
            rec.tls_end = Some(now);
            rec.tls_start
        };
        if let Some(start) = start {
            metrics::histogram!(TLS_HANDSHAKE_DURATION)
                .record(now.duration_since(start).as_secs_f64());
        }
    }

    pub fn got_conn(&self, info: ConnInfo) {
        {
            let mut rec = self.record.lock();
            rec.reused = info.reused;
            rec.was_idle = info.was_idle;
            rec.idle = info.was_idle.then_some(info.idle);
        }
        debug!(reused = info.reused, was_idle = info.was_idle, "got conn");

        metrics::counter!(
            HTTP_CONNECTION,
            ATTR_REUSED => info.reused.to_string(),
            ATTR_WAS_IDLE => info.was_idle.to_string()
        )
        .increment(1);
        if info.was_idle {
            metrics::histogram!(IDLE_DURATION).record(info.idle.as_secs_f64());
        }
    }

    pub fn first_byte(&self) {
        let now = Instant::now();
        let start = {
            let mut rec = self.record.lock();
            if rec.first_byte.is_some() {
                return;
            }
            rec.first_byte = Some(now);
            rec.request_start
        };
        if let Some(start) = start {
            metrics::histogram!(TTFB_DURATION).record(now.duration_since(start).as_secs_f64());
        }
    }

    /// Mark the request finished and emit its duration with `labels`.
    pub fn finish(&self, labels: Vec<Label>) -> Option<Duration> {
        let now = Instant::now();
        let start = {
            let mut rec = self.record.lock();
            rec.request_end = Some(now);
            rec.request_start
        }?;
        let elapsed = now.duration_since(start);
        metrics::histogram!(REQUEST_DURATION, labels).record(elapsed.as_secs_f64());
        Some(elapsed)
    }
}
