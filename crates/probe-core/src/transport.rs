use crate::tracer;
use http::{StatusCode, Uri, Version};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// What came back from one request/response cycle. The body has already
/// been drained by the time an `Exchange` exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub status: StatusCode,
    pub version: Version,
    pub body_bytes: u64,
}

/// Transport-level failure. A non-2xx status is not an error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("failed to drain response body: {0}")]
    Body(String),
    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    /// Short, low-cardinality label for measurements.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::Connect(_) => "connect",
            TransportError::Request(_) => "request",
            TransportError::Body(_) => "body",
            TransportError::Cancelled => "cancelled",
        }
    }
}

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<Exchange, TransportError>> + Send + 'a>>;

/// A mechanism that performs one request against a target and drains the
/// response.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn send<'a>(&'a self, target: &'a Uri) -> SendFuture<'a>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn send<'a>(&'a self, target: &'a Uri) -> SendFuture<'a> {
        (**self).send(target)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn send<'a>(&'a self, target: &'a Uri) -> SendFuture<'a> {
        (**self).send(target)
    }
}

/// Deterministic in-process target: answers 200 after a fixed delay.
///
/// `fail_every(n)` makes every n-th call fail with a connect error, which is
/// how tests simulate transport failures.
#[derive(Debug)]
pub struct StubTransport {
    delay: Duration,
    fail_every: Option<u64>,
    calls: AtomicU64,
}

impl StubTransport {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail_every: None,
            calls: AtomicU64::new(0),
        }
    }

    pub fn fail_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Transport for StubTransport {
    fn name(&self) -> &str {
        "stub"
    }

    fn send<'a>(&'a self, _target: &'a Uri) -> SendFuture<'a> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            } else {
                tokio::task::yield_now().await;
            }

            if self.fail_every.is_some_and(|n| call % n == 0) {
                return Err(TransportError::Connect("stub connection refused".to_string()));
            }

            if let Some(trace) = tracer::current() {
                trace.first_byte();
            }
            Ok(Exchange {
                status: StatusCode::OK,
                version: Version::HTTP_11,
                body_bytes: 0,
            })
        })
    }
}

/// `"1.1"`, `"2"` and so on, as used for the protocol-version attribute.
pub fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "unknown",
    }
}
