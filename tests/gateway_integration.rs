//! Listener-level integration tests: real sockets, real TLS handshakes.

use hostgate::acme::{AcmeClient, ChallengeTable};
use hostgate::cert_store::{self, CertStore};
use hostgate::certs::CertManager;
use hostgate::config::App;
use hostgate::control::ControlPlane;
use hostgate::events::EventBus;
use hostgate::health::HealthProber;
use hostgate::http_server::HttpServer;
use hostgate::proxy::TlsProxy;
use hostgate::router::HostRouter;
use hostgate::supervisor::Supervisor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn init_crypto() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn app(host: &str) -> App {
    App {
        host: host.to_string(),
        alt_names: Vec::new(),
        preserve_host: false,
        upstream: None,
        port: Some(3000),
        static_dir: None,
        cwd: None,
        start: None,
        health_url: None,
        health_interval_ms: None,
        disabled: false,
        auto_restart: None,
        auto_install: None,
    }
}

async fn raw_http_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

async fn spawn_http_server(challenges: ChallengeTable, https_port: u16) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    // Leak the sender so the listener stays up for the test's lifetime
    std::mem::forget(_shutdown_tx);
    let server = HttpServer::new(addr, challenges, https_port, shutdown_rx);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

#[tokio::test]
async fn acme_challenge_is_served_from_table() {
    let challenges = ChallengeTable::new();
    challenges
        .set("tok123".to_string(), "tok123.keyauth".to_string())
        .await;
    let addr = spawn_http_server(challenges, 4443).await;

    let response = raw_http_request(
        addr,
        "GET /.well-known/acme-challenge/tok123 HTTP/1.1\r\nHost: app.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("tok123.keyauth"), "{response}");
}

#[tokio::test]
async fn unknown_challenge_token_is_404() {
    let addr = spawn_http_server(ChallengeTable::new(), 4443).await;

    let response = raw_http_request(
        addr,
        "GET /.well-known/acme-challenge/missing HTTP/1.1\r\nHost: app.example.com\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
}

#[tokio::test]
async fn other_paths_redirect_to_https() {
    let addr = spawn_http_server(ChallengeTable::new(), 4443).await;

    let response = raw_http_request(
        addr,
        "GET /dashboard?tab=1 HTTP/1.1\r\nHost: app.example.com:8080\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 301"), "{response}");
    assert!(
        response.contains("location: https://app.example.com:4443/dashboard?tab=1")
            || response.contains("Location: https://app.example.com:4443/dashboard?tab=1"),
        "{response}"
    );
}

/// Full gateway stack around a TLS listener on an ephemeral port
struct TestGateway {
    addr: SocketAddr,
    store_dir: tempfile::TempDir,
}

async fn spawn_tls_gateway(apps: Vec<App>) -> TestGateway {
    init_crypto();
    let store_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CertStore::open(store_dir.path()).unwrap());
    let challenges = ChallengeTable::new();
    // Unreachable ACME directory keeps issuance local to the test
    let acme = Arc::new(AcmeClient::new(
        "http://127.0.0.1:9/acme/directory".to_string(),
        Some("ops@example.com".to_string()),
        true,
        Arc::clone(&store),
        challenges,
    ));

    let router = HostRouter::new();
    router.replace_all(&apps);
    let bus = EventBus::new();
    let certs = CertManager::new(store, acme, Arc::clone(&router));
    let supervisor = Supervisor::new(Arc::clone(&router), bus.clone());
    let prober = HealthProber::new(Arc::clone(&supervisor), Arc::clone(&router), bus.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    std::mem::forget(shutdown_tx);

    let proxy = TlsProxy::new(addr, certs, router, supervisor, prober, shutdown_rx);
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });

    TestGateway { addr, store_dir }
}

/// Accept-anything verifier for talking to the gateway's self-signed certs
#[derive(Debug)]
struct TrustAnything(rustls::crypto::CryptoProvider);

impl rustls::client::danger::ServerCertVerifier for TrustAnything {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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

async fn tls_request(addr: SocketAddr, sni: &str, request: &str) -> String {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustAnything(
            rustls::crypto::aws_lc_rs::default_provider(),
        )))
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = rustls::pki_types::ServerName::try_from(sni.to_string()).unwrap();
    let mut stream = connector.connect(name, tcp).await.unwrap();

    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

fn combined_cert_sans(dir: &Path) -> Vec<String> {
    let pem = std::fs::read_to_string(dir.join("local-gateway.crt")).unwrap();
    cert_store::parse_cert(&pem).unwrap().san_dns_names
}

#[tokio::test]
async fn tls_static_serving_and_combined_san_union() {
    let site = tempfile::tempdir().unwrap();
    std::fs::write(site.path().join("index.html"), "<h1>gateway up</h1>").unwrap();
    std::fs::write(site.path().join("hello.txt"), "hello from static").unwrap();

    let mut static_app = app("api.local.console");
    static_app.port = None;
    static_app.static_dir = Some(site.path().to_path_buf());

    let gateway = spawn_tls_gateway(vec![
        app("local.console"),
        app("app.local.console"),
        static_app,
    ])
    .await;

    // First handshake for this host issues the combined certificate
    let response = tls_request(
        gateway.addr,
        "api.local.console",
        "GET /hello.txt HTTP/1.1\r\nHost: api.local.console\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("hello from static"), "{response}");
    assert!(response.contains("no-cache"), "{response}");

    // SPA fallback for unknown paths
    let response = tls_request(
        gateway.addr,
        "api.local.console",
        "GET /deep/route HTTP/1.1\r\nHost: api.local.console\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("gateway up"), "{response}");

    // The emitted combined record covers every local host and wildcard
    let pem = std::fs::read_to_string(gateway.store_dir.path().join("local-gateway.crt")).unwrap();
    let info = cert_store::parse_cert(&pem).unwrap();
    assert_eq!(info.subject_cn.as_deref(), Some("local-gateway"));
    for san in [
        "local.console",
        "app.local.console",
        "api.local.console",
        "*.local.console",
    ] {
        assert!(
            info.san_dns_names.contains(&san.to_string()),
            "missing SAN {san}: {:?}",
            info.san_dns_names
        );
    }
}

#[tokio::test]
async fn adding_local_host_regrows_combined_sans() {
    let gateway = spawn_tls_gateway(vec![app("local.console"), app("app.local.console")]).await;

    let _ = tls_request(
        gateway.addr,
        "app.local.console",
        "GET / HTTP/1.1\r\nHost: app.local.console\r\nConnection: close\r\n\r\n",
    )
    .await;
    let before = combined_cert_sans(gateway.store_dir.path());
    assert!(!before.contains(&"db.local.console".to_string()));

    // A handshake for a new local-like host forces a SAN-superset reissue
    let _ = tls_request(
        gateway.addr,
        "db.local.console",
        "GET / HTTP/1.1\r\nHost: db.local.console\r\nConnection: close\r\n\r\n",
    )
    .await;
    let after = combined_cert_sans(gateway.store_dir.path());
    assert!(after.contains(&"db.local.console".to_string()));
    for san in &before {
        assert!(after.contains(san), "SAN regression: {san}");
    }
}

#[tokio::test]
async fn unknown_host_gets_502_with_successful_handshake() {
    let gateway = spawn_tls_gateway(vec![app("local.console")]).await;

    let response = tls_request(
        gateway.addr,
        "ghost.local.console",
        "GET / HTTP/1.1\r\nHost: ghost.local.console\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    assert!(response.contains("Unknown host"), "{response}");
}

#[tokio::test]
async fn supervised_app_without_process_is_503() {
    let mut supervised = app("svc.local.console");
    supervised.start = Some("definitely-not-a-real-command".to_string());
    let gateway = spawn_tls_gateway(vec![supervised]).await;

    let response = tls_request(
        gateway.addr,
        "svc.local.console",
        "GET / HTTP/1.1\r\nHost: svc.local.console\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 503"), "{response}");
    assert!(response.contains("App process not running"), "{response}");
}

#[tokio::test]
async fn proxy_rewrites_location_and_cookies() {
    // Upstream that answers every request with a redirect and a cookie
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = upstream_listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = stream.read(&mut buf).await;
                let response = "HTTP/1.1 302 Found\r\n\
                    location: http://127.0.0.1:3000/done?callback=https://app.local.console/next\r\n\
                    set-cookie: sid=abc; Domain=backend.internal; Path=/\r\n\
                    content-length: 0\r\n\
                    connection: close\r\n\r\n";
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    let mut proxied = app("app.local.console");
    proxied.port = Some(upstream_addr.port());
    let gateway = spawn_tls_gateway(vec![proxied]).await;

    let response = tls_request(
        gateway.addr,
        "app.local.console",
        "GET /go HTTP/1.1\r\nHost: app.local.console:4443\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 302"), "{response}");
    let lower = response.to_lowercase();
    assert!(
        lower.contains(
            "location: https://app.local.console:4443/done?callback=https%3a%2f%2fapp.local.console%3a4443%2fnext"
        ),
        "{response}"
    );
    assert!(lower.contains("set-cookie: sid=abc; path=/"), "{response}");
    assert!(!lower.contains("domain="), "{response}");
}

#[tokio::test]
async fn control_plane_mutation_reaches_router() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("gateway.json");
    std::fs::write(&config_path, r#"{ "apps": [] }"#).unwrap();

    let config = hostgate::config::Config::load(&config_path).unwrap();
    let router = HostRouter::new();
    let bus = EventBus::new();
    let supervisor = Supervisor::new(Arc::clone(&router), bus.clone());
    let control = ControlPlane::new(config, config_path, supervisor, bus.clone());
    let _subscription = router.attach(&bus, control.shared_config());

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    control.add_app(app("fresh.local.console")).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert!(router.lookup("FRESH.LOCAL.CONSOLE:4443").is_some());
}
