//! Periodic health probing and the request-side readiness gate
//!
//! Each app with a `healthUrl` gets a probe task on its configured
//! interval. A probe is a GET that follows at most one redirect and
//! counts any status in [200, 400) as healthy. Results land in the
//! supervisor's per-host runtime and on the event bus.

use crate::events::{now_millis, Event, EventBus, EventKind, SubscriptionGuard};
use crate::router::HostRouter;
use crate::supervisor::Supervisor;
use dashmap::DashMap;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Latest probe outcome for one app
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    pub healthy: bool,
    pub status_code: Option<u16>,
    /// Milliseconds since the Unix epoch
    pub last_checked_at: u64,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ProbeTask {
    url: String,
    interval: Duration,
    handle: JoinHandle<()>,
}

type HealthClient = Client<HttpConnector, Empty<Bytes>>;

/// Schedules probes and answers the proxy's readiness gate
pub struct HealthProber {
    supervisor: Arc<Supervisor>,
    router: Arc<HostRouter>,
    bus: EventBus,
    client: HealthClient,
    tasks: DashMap<String, ProbeTask>,
}

impl HealthProber {
    pub fn new(supervisor: Arc<Supervisor>, router: Arc<HostRouter>, bus: EventBus) -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Arc::new(Self {
            supervisor,
            router,
            bus,
            client,
            tasks: DashMap::new(),
        })
    }

    /// Reconcile probe tasks with the current app map: new apps get a
    /// probe, removed apps lose theirs, and a changed URL or interval
    /// reschedules.
    pub fn sync(self: &Arc<Self>) {
        let mut desired: HashMap<String, (String, Duration)> = HashMap::new();
        for app in self.router.apps_snapshot() {
            if let Some(url) = &app.health_url {
                desired.insert(app.key(), (url.clone(), app.health_interval()));
            }
        }

        let stale: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| {
                desired
                    .get(entry.key())
                    .map_or(true, |(url, interval)| {
                        url != &entry.value().url || *interval != entry.value().interval
                    })
            })
            .map(|entry| entry.key().clone())
            .collect();
        for host in stale {
            if let Some((_, task)) = self.tasks.remove(&host) {
                debug!(host = %host, "Cancelling health probe");
                task.handle.abort();
            }
        }

        for (host, (url, interval)) in desired {
            if !self.tasks.contains_key(&host) {
                self.spawn_probe(host, url, interval);
            }
        }
    }

    /// Keep probe scheduling in step with app mutations
    pub fn watch_events(self: &Arc<Self>, bus: &EventBus) -> SubscriptionGuard {
        let prober = Arc::clone(self);
        bus.subscribe_kinds(
            &[
                EventKind::AppAdded,
                EventKind::AppUpdated,
                EventKind::AppRemoved,
            ],
            move |_| prober.sync(),
        )
    }

    fn spawn_probe(self: &Arc<Self>, host: String, url: String, interval: Duration) {
        debug!(host = %host, url = %url, interval_ms = interval.as_millis() as u64, "Scheduling health probe");
        let prober = Arc::clone(self);
        let probe_host = host.clone();
        let probe_url = url.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let state = probe_once(&prober.client, &probe_url).await;
                if !state.healthy {
                    debug!(host = %probe_host, status = ?state.status_code, error = ?state.error, "Health probe failed");
                }
                prober.supervisor.record_health(&probe_host, state.clone());
                prober.bus.emit(Event::AppHealth {
                    host: probe_host.clone(),
                    state,
                });
            }
        });
        self.tasks.insert(
            host,
            ProbeTask {
                url,
                interval,
                handle,
            },
        );
    }

    /// Readiness gate: wait until the app reports healthy, probing
    /// directly rather than waiting for the next scheduled tick.
    /// Returns false when the deadline passes first.
    pub async fn wait_healthy(&self, host: &str, url: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .supervisor
                .health(host)
                .map_or(false, |state| state.healthy)
            {
                return true;
            }

            let state = probe_once(&self.client, url).await;
            let healthy = state.healthy;
            self.supervisor.record_health(host, state);
            if healthy {
                return true;
            }
            if Instant::now() + GATE_POLL_INTERVAL >= deadline {
                warn!(host, url, "Readiness gate expired");
                return false;
            }
            tokio::time::sleep(GATE_POLL_INTERVAL).await;
        }
    }
}

/// One GET against `url`, following at most one redirect
pub(crate) async fn probe_once(client: &HealthClient, url: &str) -> HealthState {
    let started = Instant::now();
    let result = tokio::time::timeout(PROBE_TIMEOUT, fetch_status(client, url)).await;
    let latency = started.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(status)) => HealthState {
            healthy: (200..400).contains(&status),
            status_code: Some(status),
            last_checked_at: now_millis(),
            latency_ms: Some(latency),
            error: None,
        },
        Ok(Err(e)) => HealthState {
            healthy: false,
            status_code: None,
            last_checked_at: now_millis(),
            latency_ms: None,
            error: Some(e.to_string()),
        },
        Err(_) => HealthState {
            healthy: false,
            status_code: None,
            last_checked_at: now_millis(),
            latency_ms: Some(latency),
            error: Some("health probe timed out".to_string()),
        },
    }
}

async fn fetch_status(client: &HealthClient, url: &str) -> anyhow::Result<u16> {
    let mut target = url.to_string();
    let mut redirects_left = 1;

    loop {
        let uri: hyper::Uri = target
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid health URL '{target}': {e}"))?;
        if uri.scheme_str() != Some("http") {
            anyhow::bail!("health probes support http URLs only: {target}");
        }

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri.clone())
            .body(Empty::<Bytes>::new())?;
        let response = client.request(request).await?;
        let status = response.status();

        if status.is_redirection() && redirects_left > 0 {
            if let Some(location) = response
                .headers()
                .get(hyper::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            {
                redirects_left -= 1;
                target = resolve_redirect(&uri, location);
                continue;
            }
        }
        return Ok(status.as_u16());
    }
}

fn resolve_redirect(base: &hyper::Uri, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_string();
    }
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base.authority().map(|a| a.as_str()).unwrap_or("localhost");
    if location.starts_with('/') {
        format!("{scheme}://{authority}{location}")
    } else {
        format!("{scheme}://{authority}/{location}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_client() -> HealthClient {
        Client::builder(TokioExecutor::new()).build(HttpConnector::new())
    }

    /// Serve a fixed response to every connection on an ephemeral port
    async fn fixed_response_server(response: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn healthy_on_2xx() {
        let addr =
            fixed_response_server("HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        let state = probe_once(&test_client(), &format!("http://{addr}/healthz")).await;
        assert!(state.healthy);
        assert_eq!(state.status_code, Some(200));
        assert!(state.latency_ms.is_some());
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn unhealthy_on_5xx() {
        let addr = fixed_response_server(
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let state = probe_once(&test_client(), &format!("http://{addr}/healthz")).await;
        assert!(!state.healthy);
        assert_eq!(state.status_code, Some(500));
    }

    #[tokio::test]
    async fn follows_one_redirect() {
        let target =
            fixed_response_server("HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n").await;
        // Redirect chain of length one lands on the target
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let response = format!(
                    "HTTP/1.1 302 Found\r\nlocation: http://{target}/ok\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        let state = probe_once(&test_client(), &format!("http://{addr}/healthz")).await;
        assert!(state.healthy);
        assert_eq!(state.status_code, Some(204));
    }

    #[tokio::test]
    async fn unreachable_records_error() {
        let state = probe_once(&test_client(), "http://127.0.0.1:9/healthz").await;
        assert!(!state.healthy);
        assert!(state.error.is_some());
    }

    #[test]
    fn redirect_resolution() {
        let base: hyper::Uri = "http://127.0.0.1:3000/healthz".parse().unwrap();
        assert_eq!(
            resolve_redirect(&base, "/ready"),
            "http://127.0.0.1:3000/ready"
        );
        assert_eq!(
            resolve_redirect(&base, "http://10.0.0.1/x"),
            "http://10.0.0.1/x"
        );
    }
}
