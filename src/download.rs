//! HTTP download helpers (spec §4.8): a direct downloader wrapping a
//! standard HTTP client, a retrying wrapper that falls back to fetching
//! through pool nodes, and an outbound-backed GET used by the prober.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::client::HttpConnector;
use hyper::Client;
use hyper_rustls::HttpsConnector;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::DownloadError;
use crate::node::{BoxedDuplex, Network, Outbound};

pub type ConfigFn<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A node selector consulted by `RetryDownloader` when the direct path
/// fails with a retryable error (spec §4.8).
pub trait NodePicker: Send + Sync {
    fn pick(&self) -> Option<Arc<dyn Outbound>>;
}

/// Wraps a standard HTTP client. Timeout and user-agent are pulled fresh on
/// every request so config hot-reloads apply without reconstructing the
/// client (spec §4.8).
pub struct DirectDownloader {
    client: Client<HttpsConnector<HttpConnector>>,
    timeout: ConfigFn<Duration>,
    user_agent: ConfigFn<String>,
}

impl DirectDownloader {
    pub fn new(timeout: ConfigFn<Duration>, user_agent: ConfigFn<String>) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        DirectDownloader {
            client: Client::builder().build(https),
            timeout,
            user_agent,
        }
    }

    pub fn timeout(&self) -> Duration {
        (self.timeout)()
    }

    /// Fetches `url`. If `deadline` (the caller's context deadline, if any)
    /// is set, it is never overlaid with the configured timeout — the
    /// caller's deadline always wins (spec §5).
    pub async fn fetch(&self, url: &str, deadline: Option<Instant>) -> Result<Vec<u8>, DownloadError> {
        let req = hyper::Request::get(url)
            .header(hyper::header::USER_AGENT, (self.user_agent)())
            .body(hyper::Body::empty())
            .map_err(|e| DownloadError::NonRetryable(Box::new(e)))?;

        let effective_timeout = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()),
            None => self.timeout(),
        };

        let fut = self.client.request(req);
        let resp = match tokio::time::timeout(effective_timeout, fut).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(DownloadError::Transport(Box::new(e))),
            Err(_) => return Err(DownloadError::DeadlineExceeded),
        };

        if !resp.status().is_success() {
            return Err(DownloadError::HttpStatus {
                code: resp.status().as_u16(),
                url: url.to_string(),
            });
        }

        let body = match tokio::time::timeout(effective_timeout, hyper::body::to_bytes(resp.into_body())).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(DownloadError::Transport(Box::new(e))),
            Err(_) => return Err(DownloadError::DeadlineExceeded),
        };
        Ok(body.to_vec())
    }
}

/// Tries the direct path first; on a retryable network-layer error, and
/// only while the caller's deadline hasn't already passed, asks the node
/// picker for up to two proxy fetches. On exhaustion, returns the
/// *original* direct error (spec §4.8).
pub struct RetryDownloader {
    direct: DirectDownloader,
    picker: Option<Arc<dyn NodePicker>>,
    proxy_attempt_timeout: ConfigFn<Option<Duration>>,
}

const MAX_PROXY_ATTEMPTS: usize = 2;
const DEFAULT_PROXY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

impl RetryDownloader {
    pub fn new(direct: DirectDownloader, picker: Option<Arc<dyn NodePicker>>, proxy_attempt_timeout: ConfigFn<Option<Duration>>) -> Self {
        RetryDownloader {
            direct,
            picker,
            proxy_attempt_timeout,
        }
    }

    pub async fn download(&self, url: &str, deadline: Option<Instant>) -> Result<Vec<u8>, DownloadError> {
        let direct_err = match self.direct.fetch(url, deadline).await {
            Ok(body) => return Ok(body),
            Err(e) => e,
        };
        if !direct_err.is_retryable() {
            return Err(direct_err);
        }
        let Some(deadline) = deadline else {
            return self.try_proxies(url, direct_err, None).await;
        };
        if Instant::now() >= deadline {
            return Err(direct_err);
        }
        self.try_proxies(url, direct_err, Some(deadline)).await
    }

    async fn try_proxies(&self, url: &str, direct_err: DownloadError, deadline: Option<Instant>) -> Result<Vec<u8>, DownloadError> {
        let Some(picker) = &self.picker else {
            return Err(direct_err);
        };
        // Configured timeout, then the direct downloader's timeout, then a
        // 30s last resort. Not a ceiling over the first two.
        let direct_timeout = self.direct.timeout();
        let per_attempt_timeout = (self.proxy_attempt_timeout)()
            .or_else(|| if direct_timeout.is_zero() { None } else { Some(direct_timeout) })
            .unwrap_or(DEFAULT_PROXY_ATTEMPT_TIMEOUT);

        for _ in 0..MAX_PROXY_ATTEMPTS {
            let Some(outbound) = picker.pick() else {
                continue;
            };
            let attempt_deadline = match deadline {
                Some(d) => d.min(Instant::now() + per_attempt_timeout),
                None => Instant::now() + per_attempt_timeout,
            };
            let result = with_timeout_at(attempt_deadline, fetch_via_outbound(outbound.as_ref(), url)).await;
            if result.is_ok() {
                return result;
            }
        }
        Err(direct_err)
    }
}

async fn with_timeout_at<F, T>(deadline: Instant, fut: F) -> Result<T, DownloadError>
where
    F: Future<Output = Result<T, DownloadError>>,
{
    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(remaining, fut).await {
        Ok(result) => result,
        Err(_) => Err(DownloadError::DeadlineExceeded),
    }
}

async fn fetch_via_outbound(outbound: &dyn Outbound, url: &str) -> Result<Vec<u8>, DownloadError> {
    let result = http_get_via_outbound(outbound, url, "Resin/1.0", None).await?;
    if !(200..300).contains(&result.status) {
        return Err(DownloadError::HttpStatus {
            code: result.status,
            url: url.to_string(),
        });
    }
    Ok(result.body)
}

/// Result of an outbound-backed HTTP GET (spec §4.8 `httpGetViaOutbound`).
pub struct OutboundFetchResult {
    pub status: u16,
    pub body: Vec<u8>,
    /// TLS handshake latency, if this was an HTTPS fetch and a handshake
    /// was actually observed (not a resumed/reused connection).
    pub tls_handshake: Option<Duration>,
}

/// Invoked exactly once on connection open and once on close, for metrics
/// accounting (spec §4.8 `OnConnLifecycle`). Handlers must be cheap.
pub trait ConnLifecycle: Send + Sync {
    fn on_open(&self) {}
    fn on_close(&self) {}
}

/// Wraps a duplex stream so `on_close` fires exactly once regardless of how
/// many times the wrapper is dropped or polled to EOF.
struct CloseOnceDuplex {
    inner: BoxedDuplex,
    hook: Arc<dyn ConnLifecycle>,
    closed: AtomicBool,
}

impl CloseOnceDuplex {
    fn new(inner: BoxedDuplex, hook: Arc<dyn ConnLifecycle>) -> Self {
        hook.on_open();
        CloseOnceDuplex {
            inner,
            hook,
            closed: AtomicBool::new(false),
        }
    }

    fn fire_close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hook.on_close();
        }
    }
}

impl Drop for CloseOnceDuplex {
    fn drop(&mut self) {
        self.fire_close();
    }
}

impl AsyncRead for CloseOnceDuplex {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CloseOnceDuplex {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        let result = std::pin::Pin::new(&mut self.inner).poll_shutdown(cx);
        if result.is_ready() {
            self.fire_close();
        }
        result
    }
}

fn root_store() -> rustls::RootCertStore {
    let mut store = rustls::RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = store.add(&rustls::Certificate(cert.0));
        }
    }
    store
}

/// Performs a single-use HTTP GET over a connection dialed through `outbound`.
/// Disables keep-alive, attempts HTTP/2 via ALPN negotiation on TLS,
/// instruments TLS handshake latency, and fires `lifecycle` open/close
/// hooks exactly once per connection (spec §4.8).
pub async fn http_get_via_outbound(
    outbound: &dyn Outbound,
    url: &str,
    user_agent: &str,
    lifecycle: Option<Arc<dyn ConnLifecycle>>,
) -> Result<OutboundFetchResult, DownloadError> {
    let parsed = url::Url::parse(url).map_err(|e| DownloadError::NonRetryable(Box::new(e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| DownloadError::NonRetryable(Box::new(std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing host"))))?
        .to_string();
    let https = parsed.scheme() == "https";
    let port = parsed.port_or_known_default().unwrap_or(if https { 443 } else { 80 });
    let addr = format!("{host}:{port}");

    let raw = outbound
        .connect(Network::Tcp, &addr)
        .await
        .map_err(|e| DownloadError::Transport(Box::new(e)))?;

    let lifecycle = lifecycle.unwrap_or_else(|| Arc::new(NoopLifecycle));
    let wrapped = CloseOnceDuplex::new(raw, lifecycle);

    let (status, body, tls_handshake) = if https {
        let mut tls_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store())
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::ServerName::try_from(host.as_str())
            .map_err(|e| DownloadError::NonRetryable(Box::new(e)))?;

        let handshake_start = Instant::now();
        let tls_stream = connector
            .connect(server_name, wrapped)
            .await
            .map_err(|e| DownloadError::Transport(Box::new(e)))?;
        let tls_handshake = handshake_start.elapsed().max(Duration::from_nanos(1));

        let negotiated_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
        let (status, body) = send_one_get(tls_stream, &host, url, user_agent, negotiated_h2).await?;
        (status, body, Some(tls_handshake))
    } else {
        let (status, body) = send_one_get(wrapped, &host, url, user_agent, false).await?;
        (status, body, None)
    };

    Ok(OutboundFetchResult { status, body, tls_handshake })
}

struct NoopLifecycle;
impl ConnLifecycle for NoopLifecycle {}

async fn send_one_get<S>(stream: S, host: &str, url: &str, user_agent: &str, http2: bool) -> Result<(u16, Vec<u8>), DownloadError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let req = hyper::Request::get(url)
        .header(hyper::header::HOST, host)
        .header(hyper::header::USER_AGENT, user_agent)
        .header(hyper::header::CONNECTION, "close")
        .body(hyper::Body::empty())
        .map_err(|e| DownloadError::NonRetryable(Box::new(e)))?;

    let mut builder = hyper::client::conn::Builder::new();
    builder.http2_only(http2);
    let (mut sender, connection) = builder
        .handshake(stream)
        .await
        .map_err(|e| DownloadError::Transport(Box::new(e)))?;
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| DownloadError::Transport(Box::new(e)))?;
    let status = resp.status().as_u16();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .map_err(|e| DownloadError::Transport(Box::new(e)))?;
    Ok((status, body.to_vec()))
}
