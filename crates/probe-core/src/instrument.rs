use crate::telemetry::{ATTR_ERROR_TYPE, ATTR_PROTOCOL_VERSION, ATTR_STATUS_CODE};
use crate::tracer::{self, RequestTrace};
use crate::transport::{version_label, Exchange, SendFuture, Transport, TransportError};
use http::Uri;
use metrics::Label;
use std::sync::Arc;
use tracing::debug;

/// Wraps a transport so every request runs under its own [`RequestTrace`].
///
/// The wrapper never changes what the inner transport returns. It only adds
/// the request-duration measurement and makes the trace visible to the
/// connector hooks for the lifetime of the request future.
#[derive(Debug, Clone)]
pub struct Instrumented<T> {
    inner: T,
}

impl<T: Transport> Instrumented<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

/// Records the request duration exactly once. If the request future is
/// dropped before completing, the duration is recorded as cancelled.
struct Completion {
    trace: Arc<RequestTrace>,
    done: bool,
}

impl Completion {
    fn finish(&mut self, result: &Result<Exchange, TransportError>) {
        self.done = true;
        let labels = match result {
            Ok(exchange) => {
                if exchange.status.is_redirection() {
                    debug!(status = %exchange.status, "redirect response not followed");
                }
                vec![
                    Label::new(ATTR_STATUS_CODE, exchange.status.as_u16().to_string()),
                    Label::new(ATTR_PROTOCOL_VERSION, version_label(exchange.version)),
                ]
            }
            Err(e) => vec![Label::new(ATTR_ERROR_TYPE, e.kind())],
        };
        self.trace.finish(labels);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.done {
            self.trace
                .finish(vec![Label::new(ATTR_ERROR_TYPE, TransportError::Cancelled.kind())]);
        }
    }
}

impl<T: Transport> Transport for Instrumented<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn send<'a>(&'a self, target: &'a Uri) -> SendFuture<'a> {
        let trace = Arc::new(RequestTrace::new());
        let mut completion = Completion {
            trace: trace.clone(),
            done: false,
        };
        Box::pin(async move {
            let result = tracer::scope(trace, self.inner.send(target)).await;
            completion.finish(&result);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StubTransport;
    use http::StatusCode;
    use std::time::Duration;

    #[tokio::test]
    async fn test_result_passes_through_unchanged() {
        let wrapped = Instrumented::new(StubTransport::new(Duration::ZERO).fail_every(2));
        let uri: Uri = "http://stub.local/".parse().unwrap();

        let first = wrapped.send(&uri).await.unwrap();
        assert_eq!(first.status, StatusCode::OK);
        let second = wrapped.send(&uri).await.unwrap_err();
        assert_eq!(second.kind(), "connect");
        assert_eq!(wrapped.inner().calls(), 2);
        assert_eq!(wrapped.name(), "stub");
    }

    #[tokio::test]
    async fn test_no_trace_leaks_out_of_the_request() {
        let wrapped = Instrumented::new(StubTransport::new(Duration::ZERO));
        let uri: Uri = "http://stub.local/".parse().unwrap();
        wrapped.send(&uri).await.unwrap();
        assert!(tracer::current().is_none());
    }

    #[tokio::test]
    async fn test_dropped_request_does_not_panic() {
        let wrapped = Instrumented::new(StubTransport::new(Duration::from_secs(10)));
        let uri: Uri = "http://stub.local/".parse().unwrap();
        let res = tokio::time::timeout(Duration::from_millis(10), wrapped.send(&uri)).await;
        assert!(res.is_err());
    }
}
