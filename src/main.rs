use hostgate::acme::{AcmeClient, ChallengeTable};
use hostgate::cert_store::CertStore;
use hostgate::certs::CertManager;
use hostgate::config::{self, Config};
use hostgate::control::ControlPlane;
use hostgate::events::EventBus;
use hostgate::health::HealthProber;
use hostgate::http_server::HttpServer;
use hostgate::proxy::TlsProxy;
use hostgate::router::HostRouter;
use hostgate::supervisor::Supervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=info".parse().expect("valid log directive")),
        )
        .init();

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gateway.json"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    let http_port = config::http_port();
    let https_port = config::https_port();
    print_startup_banner(&config, http_port, https_port);

    // Global state, initialized in dependency order: certificate store,
    // challenge table, cert orchestrator, host router
    let store = Arc::new(CertStore::open(&config.acme.config_dir).map_err(|e| {
        error!(dir = %config.acme.config_dir.display(), error = %e, "Certificate store initialization failed");
        e
    })?);

    let bus = EventBus::new();
    let challenges = ChallengeTable::new();
    let acme = Arc::new(AcmeClient::new(
        config.acme.directory_url.clone(),
        config.email.clone(),
        config.agree_to_terms,
        Arc::clone(&store),
        challenges.clone(),
    ));

    let router = HostRouter::new();
    router.replace_all(&config.apps);

    let certs = CertManager::new(store, acme, Arc::clone(&router));
    let supervisor = Supervisor::new(Arc::clone(&router), bus.clone());
    let prober = HealthProber::new(Arc::clone(&supervisor), Arc::clone(&router), bus.clone());
    prober.sync();

    let control = ControlPlane::new(config, config_path.clone(), Arc::clone(&supervisor), bus.clone());
    let _admin_token = control.admin_token();

    // Event-driven coupling: router rebuilds, combined cert pre-issue,
    // probe rescheduling
    let _router_subscription = router.attach(&bus, control.shared_config());
    let _certs_subscription = certs.watch_events(&bus);
    let _prober_subscription = prober.watch_events(&bus);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = certs.spawn_sweeper(shutdown_rx.clone());

    let http_addr: SocketAddr = ([0, 0, 0, 0], http_port).into();
    let http_server = HttpServer::new(http_addr, challenges, https_port, shutdown_rx.clone());
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            error!(error = %e, "HTTP listener error");
        }
    });

    let https_addr: SocketAddr = ([0, 0, 0, 0], https_port).into();
    let tls_proxy = TlsProxy::new(
        https_addr,
        Arc::clone(&certs),
        Arc::clone(&router),
        Arc::clone(&supervisor),
        Arc::clone(&prober),
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = tls_proxy.run().await {
            error!(error = %e, "TLS proxy error");
        }
    });

    // Bring up supervised apps
    let apps = control.shared_config().read().apps.clone();
    for app in apps {
        if app.start.is_some() && !app.disabled {
            if let Err(e) = supervisor.start(&app.key()).await {
                warn!(host = %app.key(), error = %e, "Failed to start app");
            }
        }
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Stop accepting, then terminate children, then exit
    let _ = shutdown_tx.send(true);

    info!("Stopping supervised apps...");
    supervisor.stop_all().await;

    sweeper.abort();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_handle.await;
        let _ = proxy_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, http_port: u16, https_port: u16) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        http_port,
        https_port,
        cert_dir = %config.acme.config_dir.display(),
        acme_directory = %config.acme.directory_url,
        "Listener configuration"
    );
    info!(
        app_count = config.apps.len(),
        apps = ?config.apps.iter().map(|a| a.key()).collect::<Vec<_>>(),
        "Configured apps"
    );
}
