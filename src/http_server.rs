//! Plain-HTTP listener: ACME challenges and the HTTPS redirect
//!
//! Requests under `/.well-known/acme-challenge/` are answered from the
//! shared challenge table; everything else gets a 301 to the HTTPS
//! port. A pluggable delegate (the admin collaborator) is consulted
//! before either behavior.

use crate::acme::ChallengeTable;
use crate::error::{full_body, text_error_response, GatewayBody, GatewayErrorCode};
use crate::router::strip_port;
use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const BIND_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Outcome of a delegate consultation
pub enum Delegated {
    /// The delegate produced the response; core routing is skipped
    Handled(Response<GatewayBody>),
    /// The request continues into core routing
    Pass(Request<Incoming>),
}

pub type DelegateFuture = Pin<Box<dyn Future<Output = Delegated> + Send>>;

/// Control-plane hook consulted before core routing on both listeners
pub trait RequestDelegate: Send + Sync {
    fn intercept(&self, req: Request<Incoming>) -> DelegateFuture;
}

/// The plain-HTTP listener
pub struct HttpServer {
    bind_addr: SocketAddr,
    challenges: ChallengeTable,
    https_port: u16,
    shutdown_rx: watch::Receiver<bool>,
    delegate: Option<Arc<dyn RequestDelegate>>,
}

impl HttpServer {
    pub fn new(
        bind_addr: SocketAddr,
        challenges: ChallengeTable,
        https_port: u16,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            challenges,
            https_port,
            shutdown_rx,
            delegate: None,
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn RequestDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub async fn run(self) -> Result<()> {
        let listener = bind_with_retry(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP listener ready (ACME challenges + HTTPS redirect)");
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
                            let challenges = self.challenges.clone();
                            let https_port = self.https_port;
                            let delegate = self.delegate.clone();

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let challenges = challenges.clone();
                                    let delegate = delegate.clone();
                                    async move {
                                        handle_request(req, challenges, https_port, delegate).await
                                    }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .http1()
                                    .preserve_header_case(true)
                                    .http2()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("HTTP listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    challenges: ChallengeTable,
    https_port: u16,
    delegate: Option<Arc<dyn RequestDelegate>>,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let req = match delegate {
        Some(d) => match d.intercept(req).await {
            Delegated::Handled(response) => return Ok(response),
            Delegated::Pass(req) => req,
        },
        None => req,
    };

    if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
        return Ok(match challenges.get(token).await {
            Some(key_authorization) => {
                debug!(token, "Serving ACME HTTP-01 challenge response");
                Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, "text/plain")
                    .body(full_body(key_authorization))
                    .expect("valid response builder")
            }
            None => text_error_response(GatewayErrorCode::NotFound, "Not found"),
        });
    }

    Ok(build_https_redirect(&req, https_port))
}

/// 301 to the HTTPS port, keeping the request path and query
fn build_https_redirect<B>(req: &Request<B>, https_port: u16) -> Response<GatewayBody> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok());
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = redirect_location(host, path, https_port);

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body("Redirecting to HTTPS"))
        .expect("valid response builder")
}

pub(crate) fn redirect_location(host_header: Option<&str>, path: &str, https_port: u16) -> String {
    let host = host_header.map(strip_port).unwrap_or("localhost");
    if https_port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{https_port}{path}")
    }
}

/// Bind with a bounded close-and-retry loop; persistent conflicts are
/// fatal.
pub(crate) async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener> {
    let mut last_error = None;
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(%addr, attempt, "Address in use, retrying");
                last_error = Some(e);
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to bind {addr}"));
            }
        }
    }
    Err(last_error.expect("retry loop always records an error"))
        .with_context(|| format!("failed to bind {addr} after {BIND_ATTEMPTS} attempts"))
}
