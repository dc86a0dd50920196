//! TLS listener and proxy engine
//!
//! Terminates TLS with per-hostname certificate selection (the SNI name
//! is resolved through the certificate orchestrator before the
//! handshake completes), routes requests by Host header, and forwards
//! HTTP/1.1 and WebSocket traffic to the matched app's upstream or
//! serves its static directory. Response headers are rewritten so the
//! browser only ever sees the public host.

use crate::certs::CertManager;
use crate::config::{App, ServeMode, Upstream, UpstreamScheme};
use crate::error::{empty_body, full_body, text_error_response, GatewayBody, GatewayErrorCode};
use crate::health::HealthProber;
use crate::http_server::{bind_with_retry, Delegated, RequestDelegate};
use crate::router::{strip_port, HostRouter};
use crate::supervisor::Supervisor;
use anyhow::Result;
use futures_util::FutureExt;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, HOST, LOCATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};
use url::Url;

/// Cap on the readiness-gate wait per request
const HEALTH_GATE_TIMEOUT: Duration = Duration::from_secs(15);

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Hostnames treated as "the upstream itself" in Location rewriting
const LOOPBACK_HOSTS: &[&str] = &["127.0.0.1", "localhost", "::1"];

/// The HTTPS listener with SNI certificate selection
pub struct TlsProxy {
    bind_addr: SocketAddr,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Shared state for request handling
struct ProxyContext {
    certs: Arc<CertManager>,
    router: Arc<HostRouter>,
    supervisor: Arc<Supervisor>,
    prober: Arc<HealthProber>,
    clients: UpstreamClients,
    delegate: Option<Arc<dyn RequestDelegate>>,
}

impl TlsProxy {
    pub fn new(
        bind_addr: SocketAddr,
        certs: Arc<CertManager>,
        router: Arc<HostRouter>,
        supervisor: Arc<Supervisor>,
        prober: Arc<HealthProber>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context: Arc::new(ProxyContext {
                certs,
                router,
                supervisor,
                prober,
                clients: UpstreamClients::new(),
                delegate: None,
            }),
            shutdown_rx,
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn RequestDelegate>) -> Self {
        let context = Arc::get_mut(&mut self.context)
            .expect("delegate must be set before the proxy is shared");
        context.delegate = Some(delegate);
        self
    }

    pub async fn run(self) -> Result<()> {
        let listener = bind_with_retry(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "TLS proxy listening");
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener (tests bind their own)
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                handle_tls_connection(stream, addr, context).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("TLS proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_tls_connection(stream: TcpStream, addr: SocketAddr, context: Arc<ProxyContext>) {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = match acceptor.await {
        Ok(start) => start,
        Err(e) => {
            debug!(addr = %addr, error = %e, "TLS client hello failed");
            return;
        }
    };

    let sni = start.client_hello().server_name().map(str::to_lowercase);
    let config = match &sni {
        Some(name) => match context.certs.get_context(name).await {
            Ok(config) => config,
            Err(e) => {
                warn!(host = %name, error = %e, "Certificate orchestration failed, using default context");
                match context.certs.default_context().await {
                    Ok(config) => config,
                    Err(e) => {
                        error!(error = %e, "No default TLS context available");
                        return;
                    }
                }
            }
        },
        None => match context.certs.default_context().await {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "No default TLS context available");
                return;
            }
        },
    };

    let tls_stream = match start.into_stream(config).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(addr = %addr, error = %e, "TLS handshake failed");
            return;
        }
    };

    let io = TokioIo::new(tls_stream);
    let service_context = Arc::clone(&context);
    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&service_context);
        async move {
            // A panic inside a handler becomes a 500, never a crash
            match std::panic::AssertUnwindSafe(handle_request(req, context, addr))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    error!(addr = %addr, "Request handler panicked");
                    Ok(text_error_response(
                        GatewayErrorCode::Internal,
                        "Internal server error",
                    ))
                }
            }
        }
    });

    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .serve_connection_with_upgrades(io, service)
        .await
    {
        debug!(addr = %addr, error = %e, "Connection error");
    }
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let req = match &context.delegate {
        Some(delegate) => match delegate.intercept(req).await {
            Delegated::Handled(response) => return Ok(response),
            Delegated::Pass(req) => req,
        },
        None => req,
    };

    let Some(authority) = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
    else {
        return Ok(text_error_response(
            GatewayErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        ));
    };
    let hostname = strip_port(&authority).to_lowercase();

    debug!(host = %hostname, method = %req.method(), uri = %req.uri(), "Incoming request");

    let Some(app) = context.router.lookup(&authority) else {
        return Ok(text_error_response(
            GatewayErrorCode::UnknownHost,
            format!("Unknown host: {hostname}"),
        ));
    };

    if app.start.is_some() && !context.supervisor.is_running(&app.key()) {
        return Ok(text_error_response(
            GatewayErrorCode::AppNotRunning,
            "App process not running",
        ));
    }

    // WebSocket upgrades share routing and upstream derivation but skip
    // the readiness gate
    if is_upgrade_request(&req) {
        if let Some(ServeMode::Proxy(upstream)) = app.serve_mode() {
            return handle_upgrade(req, &app, upstream, hostname, authority).await;
        }
    }

    if let Some(health_url) = &app.health_url {
        if !context
            .prober
            .wait_healthy(&app.key(), health_url, HEALTH_GATE_TIMEOUT)
            .await
        {
            return Ok(text_error_response(
                GatewayErrorCode::UpstreamUnhealthy,
                format!(
                    "Upstream for {hostname} did not become healthy within {} seconds",
                    HEALTH_GATE_TIMEOUT.as_secs()
                ),
            ));
        }
    }

    match app.serve_mode() {
        Some(ServeMode::Static(dir)) => Ok(serve_static(req.uri().path(), &dir).await),
        Some(ServeMode::Proxy(upstream)) => {
            forward_request(req, &context, &app, upstream, &hostname, &authority, client_addr).await
        }
        None => Ok(text_error_response(
            GatewayErrorCode::BadGateway,
            "No upstream or static directory configured",
        )),
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_request(
    mut req: Request<Incoming>,
    context: &ProxyContext,
    app: &App,
    upstream: Upstream,
    hostname: &str,
    authority: &str,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let target: hyper::Uri = match format!(
        "{}://{}:{}{}",
        upstream.scheme, upstream.host, upstream.port, path_and_query
    )
    .parse()
    {
        Ok(uri) => uri,
        Err(e) => {
            error!(host = %hostname, error = %e, "Failed to build upstream URI");
            return Ok(text_error_response(GatewayErrorCode::BadGateway, "Bad gateway"));
        }
    };

    // Overwrite forwarding headers rather than appending: this proxy is
    // the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(authority) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

    if !app.preserve_host {
        if let Ok(value) = HeaderValue::from_str(&upstream.authority()) {
            headers.insert(HOST, value);
        }
    }

    *req.uri_mut() = target;

    match context.clients.request(&upstream, req).await {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            rewrite_response_headers(&mut parts.headers, &upstream, authority);
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Err(e) => {
            error!(host = %hostname, upstream = %upstream.authority(), error = %e, "Upstream request failed");
            Ok(text_error_response(GatewayErrorCode::BadGateway, "Bad gateway"))
        }
    }
}

/// Pooled clients per upstream flavor
struct UpstreamClients {
    http: Client<HttpConnector, Incoming>,
    https: Client<hyper_rustls::HttpsConnector<HttpConnector>, Incoming>,
    https_insecure: Client<hyper_rustls::HttpsConnector<HttpConnector>, Incoming>,
}

impl UpstreamClients {
    fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let http = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector.clone());

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(client_tls_config(false))
            .https_or_http()
            .enable_http1()
            .build();
        let https = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https_connector);

        let insecure_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(client_tls_config(true))
            .https_or_http()
            .enable_http1()
            .build();
        let https_insecure = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(insecure_connector);

        Self {
            http,
            https,
            https_insecure,
        }
    }

    async fn request(
        &self,
        upstream: &Upstream,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        match upstream.scheme {
            UpstreamScheme::Http => self.http.request(req).await,
            UpstreamScheme::Https if upstream.reject_unauthorized == Some(false) => {
                self.https_insecure.request(req).await
            }
            UpstreamScheme::Https => self.https.request(req).await,
        }
    }
}

fn client_tls_config(insecure: bool) -> rustls::ClientConfig {
    if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify::new()))
            .with_no_client_auth()
    } else {
        let roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

/// Accept-anything verifier for upstreams with `rejectUnauthorized: false`
#[derive(Debug)]
struct NoVerify(rustls::crypto::CryptoProvider);

impl NoVerify {
    fn new() -> Self {
        Self(rustls::crypto::aws_lc_rs::default_provider())
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Apply the response-rewriting policy: Location back onto the public
/// authority, callback port injection, and host-only cookies.
pub(crate) fn rewrite_response_headers(
    headers: &mut HeaderMap,
    upstream: &Upstream,
    public_authority: &str,
) {
    if let Some(location) = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    {
        let rewritten = rewrite_location(&location, &upstream.host, public_authority);
        if rewritten != location {
            if let Ok(value) = HeaderValue::from_str(&rewritten) {
                headers.insert(LOCATION, value);
            }
        }
    }

    let cookies: Vec<HeaderValue> = headers
        .get_all(SET_COOKIE)
        .iter()
        .map(|value| {
            let raw = String::from_utf8_lossy(value.as_bytes());
            let scrubbed = scrub_cookie_domain(&raw);
            HeaderValue::from_bytes(scrubbed.as_bytes()).unwrap_or_else(|_| value.clone())
        })
        .collect();
    if !cookies.is_empty() {
        headers.remove(SET_COOKIE);
        for cookie in cookies {
            headers.append(SET_COOKIE, cookie);
        }
    }
}

/// Remove any `Domain=` attribute so cookies become host-only
pub(crate) fn scrub_cookie_domain(value: &str) -> String {
    value
        .split(';')
        .map(str::trim)
        .filter(|part| !part.to_ascii_lowercase().starts_with("domain="))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Rewrite a Location header per the proxy policy.
///
/// Internal targets (the upstream host or a loopback name) move onto
/// `https://<public_authority>` with path, query and fragment kept. In
/// both the internal and external cases, a `callback` query parameter
/// whose host is the public host and which lacks a port gets the
/// incoming request's port injected.
pub(crate) fn rewrite_location(value: &str, upstream_host: &str, public_authority: &str) -> String {
    let (public_host, public_port) = split_authority(public_authority);

    let parsed = match Url::parse(value) {
        Ok(url) if url.has_host() => url,
        _ => return literal_rewrite(value, upstream_host, public_authority),
    };

    let loc_host = parsed.host_str().unwrap_or_default();
    let internal =
        loc_host.eq_ignore_ascii_case(upstream_host) || LOOPBACK_HOSTS.contains(&loc_host);

    let mut out = if internal {
        let Ok(mut rebased) = Url::parse(&format!("https://{public_authority}/")) else {
            return literal_rewrite(value, upstream_host, public_authority);
        };
        rebased.set_path(parsed.path());
        rebased.set_query(parsed.query());
        rebased.set_fragment(parsed.fragment());
        rebased
    } else {
        parsed.clone()
    };

    let injected = inject_callback_port(&mut out, public_host, public_port);

    if internal || injected {
        out.to_string()
    } else {
        value.to_string()
    }
}

fn inject_callback_port(url: &mut Url, public_host: &str, public_port: Option<u16>) -> bool {
    let Some(port) = public_port else { return false };
    if url.query().is_none() {
        return false;
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut changed = false;
    let rewritten: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(key, val)| {
            if key == "callback" {
                if let Ok(mut callback) = Url::parse(&val) {
                    let host_matches = callback
                        .host_str()
                        .map_or(false, |h| h.eq_ignore_ascii_case(public_host));
                    if host_matches && callback.port().is_none() && callback.set_port(Some(port)).is_ok() {
                        changed = true;
                        return (key, callback.to_string());
                    }
                }
            }
            (key, val)
        })
        .collect();

    if changed {
        url.query_pairs_mut().clear().extend_pairs(rewritten);
    }
    changed
}

/// Fallback for Location values the URL parser rejects: replace a
/// recognizable internal prefix literally.
fn literal_rewrite(value: &str, upstream_host: &str, public_authority: &str) -> String {
    for host in [upstream_host, "127.0.0.1", "localhost", "::1"] {
        for scheme in ["http", "https"] {
            let prefix = format!("{scheme}://{host}");
            if let Some(rest) = value.strip_prefix(&prefix) {
                let rest = match rest.strip_prefix(':') {
                    Some(after) => {
                        let trimmed = after.trim_start_matches(|c: char| c.is_ascii_digit());
                        if trimmed.len() < after.len() {
                            trimmed
                        } else {
                            rest
                        }
                    }
                    None => rest,
                };
                return format!("https://{public_authority}{rest}");
            }
        }
    }
    value.to_string()
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals
pub(crate) fn split_authority(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (authority, None);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        None => (authority, None),
    }
}

pub(crate) fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    connection_upgrade && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

async fn connect_upstream(upstream: &Upstream) -> anyhow::Result<Box<dyn Io>> {
    let tcp = TcpStream::connect((upstream.host.as_str(), upstream.port)).await?;
    match upstream.scheme {
        UpstreamScheme::Http => Ok(Box::new(tcp)),
        UpstreamScheme::Https => {
            let config = client_tls_config(upstream.reject_unauthorized == Some(false));
            let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
            let name = rustls::pki_types::ServerName::try_from(upstream.host.clone())?;
            Ok(Box::new(connector.connect(name, tcp).await?))
        }
    }
}

/// Raw HTTP upgrade request forwarded to the upstream
fn build_upgrade_request<B>(req: &Request<B>, upstream: &Upstream, preserve_host: bool, authority: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    let host = if preserve_host {
        authority.to_string()
    } else {
        upstream.authority()
    };
    request.push_str(&format!("Host: {}\r\n", host));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the upstream's upgrade response status line and headers
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response = std::str::from_utf8(data).ok()?;
    let mut lines = response.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    app: &App,
    upstream: Upstream,
    hostname: String,
    authority: String,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(host = %hostname, upgrade_type, "Handling upgrade request");

    let mut backend = match connect_upstream(&upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(host = %hostname, upstream = %upstream.authority(), error = %e, "Failed to connect to upstream for upgrade");
            return Ok(text_error_response(GatewayErrorCode::BadGateway, "Bad gateway"));
        }
    };

    let raw_request = build_upgrade_request(&req, &upstream, app.preserve_host, &authority);
    if let Err(e) = backend.write_all(&raw_request).await {
        error!(host = %hostname, error = %e, "Failed to send upgrade request to upstream");
        return Ok(text_error_response(GatewayErrorCode::BadGateway, "Bad gateway"));
    }

    let mut response_buf = vec![0u8; 8192];
    let n = match backend.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            error!(host = %hostname, "Upstream closed connection before responding to upgrade");
            return Ok(text_error_response(GatewayErrorCode::BadGateway, "Bad gateway"));
        }
        Err(e) => {
            error!(host = %hostname, error = %e, "Failed to read upgrade response from upstream");
            return Ok(text_error_response(GatewayErrorCode::BadGateway, "Bad gateway"));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
        error!(host = %hostname, "Failed to parse upstream upgrade response");
        return Ok(text_error_response(GatewayErrorCode::BadGateway, "Bad gateway"));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(host = %hostname, status = %status, "Upstream rejected upgrade request");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(v) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), v);
            }
        }
        return Ok(response
            .body(empty_body())
            .expect("valid response builder"));
    }

    info!(host = %hostname, upgrade_type, "WebSocket upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let lower = name.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(v) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), v);
        }
    }
    let response = response
        .body(empty_body())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
                    Ok((to_upstream, to_client)) => {
                        debug!(host = %hostname, to_upstream, to_client, "WebSocket connection closed");
                    }
                    Err(e) => {
                        debug!(host = %hostname, error = %e, "WebSocket connection closed with error");
                    }
                }
            }
            Err(e) => {
                error!(host = %hostname, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Serve a file from the app's static directory with the SPA fallback
async fn serve_static(raw_path: &str, dir: &Path) -> Response<GatewayBody> {
    let decoded = decode_percent(raw_path);
    let relative = sanitize_path(&decoded);

    let mut path = dir.join(&relative);
    if tokio::fs::metadata(&path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        path.push("index.html");
    }
    if tokio::fs::metadata(&path).await.is_err() {
        path = dir.join("index.html");
    }

    match tokio::fs::read(&path).await {
        Ok(contents) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, mime_for(&path))
            .header(hyper::header::CACHE_CONTROL, "no-cache")
            .body(full_body(contents))
            .expect("valid response builder"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            text_error_response(GatewayErrorCode::NotFound, "Not found")
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Static file read failed");
            text_error_response(GatewayErrorCode::StaticIo, "Internal server error")
        }
    }
}

/// Drop empty, `.` and `..` components so the resolved path can never
/// escape the static root.
pub(crate) fn sanitize_path(path: &str) -> PathBuf {
    let mut clean = PathBuf::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." | ".." => continue,
            part => clean.push(part),
        }
    }
    clean
}

pub(crate) fn decode_percent(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = |b: u8| match b {
                b'0'..=b'9' => Some(b - b'0'),
                b'a'..=b'f' => Some(b - b'a' + 10),
                b'A'..=b'F' => Some(b - b'A' + 10),
                _ => None,
            };
            if let (Some(high), Some(low)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                out.push(high * 16 + low);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub(crate) fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "text/javascript",
        "css" => "text/css",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        "wasm" => "application/wasm",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}
