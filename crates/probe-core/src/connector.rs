//! Dialing with lifecycle hooks.
//!
//! [`TracedConnector`] is the connector handed to the pooled client. It
//! reports DNS, connect and TLS phases to the current request's trace, keeps
//! the connection accountant up to date and enforces the optional per-host
//! connection cap. Every connection it yields carries a [`ConnMeta`] that the
//! client reads back as soon as the pool hands the connection to a request,
//! to learn whether it was reused and how long it sat idle.

use crate::accountant::ConnectionAccountant;
use crate::tracer::{self, ConnInfo};
use http::uri::Scheme;
use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::dns::Name;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tower_service::Service;
use tracing::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// DNS resolver that reports resolution time to the current trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingResolver;

impl Service<Name> for TracingResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, io::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        Box::pin(async move {
            let trace = tracer::current_or_detached();
            trace.dns_start();
            let resolved = tokio::net::lookup_host((name.as_str(), 0)).await;
            trace.dns_done();
            let addrs: Vec<SocketAddr> = resolved?.collect();
            debug!(host = name.as_str(), addrs = addrs.len(), "resolved");
            Ok(addrs.into_iter())
        })
    }
}

/// Per-connection reuse bookkeeping, shared between the connection and every
/// response served over it.
#[derive(Debug, Clone, Default)]
pub struct ConnMeta(Arc<Mutex<ConnUse>>);

#[derive(Debug, Default)]
struct ConnUse {
    active: usize,
    uses: u64,
    idle_since: Option<Instant>,
}

/// Marks a connection busy until dropped.
#[derive(Debug)]
pub struct InUse(ConnMeta);

impl Drop for InUse {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl ConnMeta {
    /// Take the connection for one request that started at `request_start`.
    pub fn claim(&self, request_start: Instant) -> (ConnInfo, InUse) {
        let mut state = self.0.lock();
        let was_idle = state.active == 0 && state.idle_since.is_some();
        let idle = state
            .idle_since
            .filter(|_| was_idle)
            .map(|since| request_start.saturating_duration_since(since))
            .unwrap_or_default();
        let info = ConnInfo {
            reused: state.uses > 0,
            was_idle,
            idle,
        };
        state.uses += 1;
        state.active += 1;
        state.idle_since = None;
        drop(state);
        (info, InUse(self.clone()))
    }

    fn release(&self) {
        let mut state = self.0.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            state.idle_since = Some(Instant::now());
        }
    }
}

/// Optional cap on dialed connections per `host:port`.
#[derive(Debug, Default)]
pub struct HostLimits {
    max: Option<usize>,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimits {
    pub fn new(max: Option<usize>) -> Self {
        Self {
            max: max.filter(|m| *m > 0),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a connection slot to `key`. Unlimited hosts get `None`.
    pub async fn acquire(&self, key: &str) -> Result<Option<OwnedSemaphorePermit>, BoxError> {
        let Some(max) = self.max else {
            return Ok(None);
        };
        let semaphore = self
            .hosts
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(max)))
            .clone();
        let permit = semaphore.acquire_owned().await?;
        Ok(Some(permit))
    }
}

/// Plain or TLS byte stream underneath a pooled connection.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Plain(s) => s.is_write_vectored(),
            Stream::Tls(s) => s.is_write_vectored(),
        }
    }
}

/// Counts the connection as closed when the pool drops it.
struct OpenConnection(Arc<ConnectionAccountant>);

impl OpenConnection {
    fn new(accountant: Arc<ConnectionAccountant>) -> Self {
        accountant.connection_opened();
        Self(accountant)
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

/// A dialed connection as seen by the pool.
pub struct TracedConn {
    io: TokioIo<Stream>,
    h2: bool,
    meta: ConnMeta,
    _open: OpenConnection,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Connection for TracedConn {
    fn connected(&self) -> Connected {
        let connected = Connected::new().extra(self.meta.clone());
        if self.h2 {
            connected.negotiated_h2()
        } else {
            connected
        }
    }
}

impl Read for TracedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Read::poll_read(Pin::new(&mut self.get_mut().io), cx, buf)
    }
}

impl Write for TracedConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Write::poll_write(Pin::new(&mut self.get_mut().io), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Write::poll_flush(Pin::new(&mut self.get_mut().io), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Write::poll_shutdown(Pin::new(&mut self.get_mut().io), cx)
    }

    fn is_write_vectored(&self) -> bool {
        Write::is_write_vectored(&self.io)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Write::poll_write_vectored(Pin::new(&mut self.get_mut().io), cx, bufs)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
    pub max_conns_per_host: Option<usize>,
    pub tls: Arc<ClientConfig>,
}

#[derive(Clone)]
pub struct TracedConnector {
    http: HttpConnector<TracingResolver>,
    tls: TlsConnector,
    tls_handshake_timeout: Duration,
    limits: Arc<HostLimits>,
    accountant: Arc<ConnectionAccountant>,
}

impl TracedConnector {
    pub fn new(settings: ConnectorSettings, accountant: Arc<ConnectionAccountant>) -> Self {
        let mut http = HttpConnector::new_with_resolver(TracingResolver);
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(settings.connect_timeout));
        http.set_keepalive(settings.tcp_keepalive);

        Self {
            http,
            tls: TlsConnector::from(settings.tls),
            tls_handshake_timeout: settings.tls_handshake_timeout,
            limits: Arc::new(HostLimits::new(settings.max_conns_per_host)),
            accountant,
        }
    }
}

impl Service<Uri> for TracedConnector {
    type Response = TracedConn;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<TracedConn, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let this = self.clone();

        // The trace is looked up on first poll, which happens inside the
        // requesting task's scope.
        Box::pin(async move {
            let trace = tracer::current_or_detached();
            let mut http = this.http.clone();
            let host = dst
                .host()
                .ok_or("target has no host")?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let https = dst.scheme() == Some(&Scheme::HTTPS);
            let port = dst.port_u16().unwrap_or(if https { 443 } else { 80 });

            let permit = this.limits.acquire(&format!("{host}:{port}")).await?;

            trace.connect_start();
            let dialed = tracer::scope(trace.clone(), http.call(dst)).await;
            trace.connect_done();
            let tcp = dialed?.into_inner();
            let open = OpenConnection::new(this.accountant.clone());

            let (stream, h2) = if https {
                let name = ServerName::try_from(host.clone())?;
                trace.tls_start();
                let handshake =
                    tokio::time::timeout(this.tls_handshake_timeout, this.tls.connect(name, tcp)).await;
                trace.tls_done();
                let tls = handshake.map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")
                })??;
                let h2 = tls.get_ref().1.alpn_protocol() == Some(&b"h2"[..]);
                (Stream::Tls(Box::new(tls)), h2)
            } else {
                (Stream::Plain(tcp), false)
            };
            debug!(%host, port, h2, "connection established");

            Ok(TracedConn {
                io: TokioIo::new(stream),
                h2,
                meta: ConnMeta::default(),
                _open: open,
                _permit: permit,
            })
        })
    }
}

/// Accepts any server certificate while still checking handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Build the rustls client configuration.
///
/// With `verify` off any certificate is accepted, since probed hosts are
/// arbitrary. `alpn` lists the protocols offered in the handshake.
pub fn tls_config(verify: bool, alpn: Vec<Vec<u8>>) -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder =
        ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

    let mut config = if verify {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth()
    };
    config.alpn_protocols = alpn;
    Ok(Arc::new(config))
}
