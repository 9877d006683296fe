//! Client configuration catalog and the pooled HTTP client it builds.

use crate::accountant::{self, ConnectionAccountant};
use crate::connector::{tls_config, ConnMeta, ConnectorSettings, InUse, TracedConnector};
use crate::tracer::{self, RequestTrace};
use crate::transport::{Exchange, SendFuture, Transport, TransportError};
use anyhow::Context as _;
use bytes::Bytes;
use http::header::CONNECTION;
use http::{Extensions, Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::connect::{capture_connection, CaptureConnection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Which HTTP versions a client may speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// HTTP/1.1 only.
    Http1,
    /// Offer h2 via ALPN, fall back to HTTP/1.1.
    #[default]
    PreferHttp2,
    /// HTTP/2 only, prior knowledge on plain connections.
    Http2Only,
}

impl Protocol {
    pub fn alpn(self) -> Vec<Vec<u8>> {
        match self {
            Protocol::Http1 => vec![b"http/1.1".to_vec()],
            Protocol::PreferHttp2 => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            Protocol::Http2Only => vec![b"h2".to_vec()],
        }
    }
}

/// Everything needed to build one pooled client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientProfile {
    pub name: String,
    /// Reuse connections between requests
    pub keep_alive: bool,
    pub protocol: Protocol,
    /// Idle connections kept per host; ignored when keep-alive is off
    pub max_idle_per_host: usize,
    /// Cap on connections dialed per host (unlimited when absent)
    pub max_conns_per_host: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub tls_handshake_timeout: Duration,
    /// How long an idle pooled connection survives
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Bound on a whole request, body drain included
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Option<Duration>,
    pub verify_tls: bool,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            keep_alive: true,
            protocol: Protocol::PreferHttp2,
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            max_conns_per_host: None,
            connect_timeout: Duration::from_secs(30),
            tls_handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_millis(500),
            tcp_keepalive: None,
            verify_tls: false,
        }
    }
}

/// Idle connections kept per host when nothing else is configured.
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 2;

/// Names accepted by [`preset`].
pub const PRESETS: &[&str] = &[
    "default",
    "http11_keepalive",
    "http11_nokeepalive",
    "http2_keepalive",
    "http2_keepalive_limited",
    "http2_only",
];

/// Look up a named client preset.
pub fn preset(name: &str) -> Option<ClientProfile> {
    let base = ClientProfile {
        name: name.to_string(),
        ..ClientProfile::default()
    };
    let profile = match name {
        "default" => base,
        "http11_keepalive" => ClientProfile {
            protocol: Protocol::Http1,
            max_idle_per_host: 10,
            tcp_keepalive: Some(Duration::from_secs(30)),
            ..base
        },
        "http11_nokeepalive" => ClientProfile {
            keep_alive: false,
            protocol: Protocol::Http1,
            max_idle_per_host: 0,
            ..base
        },
        "http2_keepalive" => ClientProfile {
            max_idle_per_host: 10,
            ..base
        },
        "http2_keepalive_limited" => ClientProfile {
            max_idle_per_host: 10,
            max_conns_per_host: Some(2),
            ..base
        },
        "http2_only" => ClientProfile {
            protocol: Protocol::Http2Only,
            max_idle_per_host: 10,
            ..base
        },
        _ => return None,
    };
    Some(profile)
}

/// A preset plus field overrides, as written in a config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSpec {
    pub preset: Option<String>,
    pub keep_alive: Option<bool>,
    pub protocol: Option<Protocol>,
    pub max_idle_per_host: Option<usize>,
    pub max_conns_per_host: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
    pub verify_tls: Option<bool>,
}

impl ClientSpec {
    pub fn resolve(&self) -> anyhow::Result<ClientProfile> {
        let name = self.preset.as_deref().unwrap_or("default");
        let mut profile = preset(name).with_context(|| {
            format!("unknown client preset '{name}', valid presets: {}", PRESETS.join(", "))
        })?;
        if let Some(v) = self.keep_alive {
            profile.keep_alive = v;
        }
        if let Some(v) = self.protocol {
            profile.protocol = v;
        }
        if let Some(v) = self.max_idle_per_host {
            profile.max_idle_per_host = v;
        }
        if self.max_conns_per_host.is_some() {
            profile.max_conns_per_host = self.max_conns_per_host;
        }
        if let Some(v) = self.request_timeout {
            profile.request_timeout = v;
        }
        if let Some(v) = self.verify_tls {
            profile.verify_tls = v;
        }
        Ok(profile)
    }
}

impl ClientProfile {
    /// Build a client that reports to the process-wide accountant.
    pub fn build(&self) -> anyhow::Result<PooledClient> {
        self.build_with(accountant::global())
    }

    pub fn build_with(&self, accountant: Arc<ConnectionAccountant>) -> anyhow::Result<PooledClient> {
        let tls = tls_config(self.verify_tls, self.protocol.alpn())
            .with_context(|| format!("Failed to build TLS config for client '{}'", self.name))?;
        let connector = TracedConnector::new(
            ConnectorSettings {
                connect_timeout: self.connect_timeout,
                tls_handshake_timeout: self.tls_handshake_timeout,
                tcp_keepalive: self.tcp_keepalive,
                max_conns_per_host: self.max_conns_per_host,
                tls,
            },
            accountant,
        );

        let max_idle = if self.keep_alive { self.max_idle_per_host } else { 0 };
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(self.idle_timeout)
            .pool_max_idle_per_host(max_idle)
            .http2_only(self.protocol == Protocol::Http2Only)
            .build(connector);

        Ok(PooledClient {
            name: self.name.clone(),
            client,
            keep_alive: self.keep_alive,
            request_timeout: self.request_timeout,
        })
    }
}

/// Pooling HTTP client whose connector feeds the lifecycle tracer.
pub struct PooledClient {
    name: String,
    client: Client<TracedConnector, Empty<Bytes>>,
    keep_alive: bool,
    request_timeout: Duration,
}

impl PooledClient {
    async fn exchange(&self, target: &Uri) -> Result<Exchange, TransportError> {
        let trace = tracer::current_or_detached();
        let request_start = trace.record().request_start.unwrap_or_else(Instant::now);

        let mut request = Request::get(target.clone());
        if !self.keep_alive {
            request = request.header(CONNECTION, "close");
        }
        let mut request = request
            .body(Empty::<Bytes>::new())
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let captured = capture_connection(&mut request);

        let response = self.client.request(request);
        let claim = claim_connection(captured, request_start, &trace);
        tokio::pin!(response, claim);

        // The claim resolves before the response whenever a connection was
        // handed out; a request that never got one stops waiting for it.
        let (_in_use, response) = tokio::select! {
            biased;
            claimed = &mut claim => (claimed, (&mut response).await),
            response = &mut response => (None, response),
        };
        let response = response.map_err(|e| {
            let msg = error_chain(&e);
            if e.is_connect() {
                TransportError::Connect(msg)
            } else {
                TransportError::Request(msg)
            }
        })?;
        trace.first_byte();

        let status = response.status();
        let version = response.version();
        let mut body = response.into_body();
        let mut body_bytes = 0u64;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| TransportError::Body(error_chain(&e)))?;
            if let Some(data) = frame.data_ref() {
                body_bytes += data.len() as u64;
            }
        }

        Ok(Exchange {
            status,
            version,
            body_bytes,
        })
    }
}

impl Transport for PooledClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn send<'a>(&'a self, target: &'a Uri) -> SendFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout(self.request_timeout, self.exchange(target)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(client = %self.name, timeout = ?self.request_timeout, "request timed out");
                    Err(TransportError::Timeout(self.request_timeout))
                }
            }
        })
    }
}

/// Wait for the pool to hand the request a connection, then report it.
async fn claim_connection(
    mut captured: CaptureConnection,
    request_start: Instant,
    trace: &RequestTrace,
) -> Option<InUse> {
    let meta = {
        let connected = captured.wait_for_connection_metadata().await;
        let mut extras = Extensions::new();
        connected.as_ref()?.get_extras(&mut extras);
        extras.remove::<ConnMeta>()?
    };
    let (info, in_use) = meta.claim(request_start);
    trace.got_conn(info);
    Some(in_use)
}

/// Error message including every source in the chain.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_preset_resolves() {
        for name in PRESETS {
            let profile = preset(name).unwrap();
            assert_eq!(profile.name, *name);
            assert_eq!(profile.connect_timeout, Duration::from_secs(30));
            assert_eq!(profile.tls_handshake_timeout, Duration::from_secs(10));
            assert!(!profile.verify_tls);
        }
        assert!(preset("http3").is_none());
    }

    #[test]
    fn test_preset_shapes() {
        let no_ka = preset("http11_nokeepalive").unwrap();
        assert!(!no_ka.keep_alive);
        assert_eq!(no_ka.max_idle_per_host, 0);
        assert_eq!(no_ka.protocol, Protocol::Http1);

        assert_eq!(preset("http2_keepalive_limited").unwrap().max_conns_per_host, Some(2));
        assert_eq!(preset("default").unwrap().max_idle_per_host, 2);
        assert_eq!(preset("http11_keepalive").unwrap().max_idle_per_host, 10);
        assert_eq!(preset("http2_keepalive").unwrap().max_idle_per_host, 10);
        assert_eq!(preset("http2_only").unwrap().protocol, Protocol::Http2Only);
    }

    #[test]
    fn test_alpn_per_protocol() {
        assert_eq!(Protocol::Http1.alpn(), vec![b"http/1.1".to_vec()]);
        assert_eq!(Protocol::Http2Only.alpn(), vec![b"h2".to_vec()]);
        assert_eq!(Protocol::PreferHttp2.alpn().len(), 2);
    }

    #[test]
    fn test_spec_overrides_preset() {
        let spec: ClientSpec = toml::from_str(
            r#"
preset = "http11_keepalive"
max_idle_per_host = 100
request_timeout = "3s"
            "#,
        )
        .unwrap();
        let profile = spec.resolve().unwrap();
        assert_eq!(profile.protocol, Protocol::Http1);
        assert_eq!(profile.max_idle_per_host, 100);
        assert_eq!(profile.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_unknown_preset_lists_valid_names() {
        let spec = ClientSpec {
            preset: Some("bogus".to_string()),
            ..ClientSpec::default()
        };
        let err = spec.resolve().unwrap_err().to_string();
        assert!(err.contains("bogus"));
        assert!(err.contains("http2_only"));
    }

    #[tokio::test]
    async fn test_build_every_preset() {
        for name in PRESETS {
            let acct = Arc::new(ConnectionAccountant::new());
            let client = preset(name).unwrap().build_with(acct).unwrap();
            assert_eq!(client.name(), *name);
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_classified() {
        // Nothing listens on port 9 of localhost in the test environment.
        let profile = ClientProfile {
            protocol: Protocol::Http1,
            request_timeout: Duration::from_secs(2),
            ..ClientProfile::default()
        };
        let acct = Arc::new(ConnectionAccountant::new());
        let client = profile.build_with(acct.clone()).unwrap();
        let uri: Uri = "http://127.0.0.1:9/".parse().unwrap();
        let err = client.send(&uri).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
        assert_eq!(acct.snapshot().opened, 0);
    }
}
