mod config;
mod engine;
mod handlers;
mod health;
mod metrics;
mod mutation;
mod review;
mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use clap::Parser;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "mount-rewriter",
    about = "Mutating admission webhook that moves volume mount paths under a new prefix"
)]
struct Cli {
    /// Optional YAML file with configuration overrides
    #[arg(long, env = "MOUNT_REWRITER_CONFIG")]
    config: Option<String>,
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
                    _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
                }
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("received CTRL+C, starting graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = ctrl_c.await {
            error!("failed to listen for CTRL+C: {e}");
        }
        info!("received CTRL+C, starting graceful shutdown");
    }

    let _ = shutdown_tx.send(());
}

async fn run_https_server(
    listener: TcpListener,
    tls_acceptor: TlsAcceptor,
    router: Router,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        let (tcp_stream, remote_addr) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept TCP connection: {e}");
                        continue;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("webhook server shutting down");
                break;
            }
        };

        let tls_acceptor = tls_acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match tls_acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%remote_addr, "TLS handshake failed: {e}");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(router.into_service());

            if let Err(e) = HttpBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!(%remote_addr, "error serving connection: {e}");
            }
        });
    }
}

async fn run_http_server(
    listener: TcpListener,
    router: Router,
    mut shutdown_rx: watch::Receiver<()>,
) {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("health server shutting down");
        })
        .await
        .unwrap_or_else(|e| error!("health server error: {e}"));
}

async fn bind(addr: SocketAddr, what: &str) -> TcpListener {
    TcpListener::bind(addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind {what} on {addr}: {e}");
        std::process::exit(1);
    })
}

fn fail(message: String) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        fail("Failed to install the ring CryptoProvider".to_string());
    }

    let cli = Cli::parse();

    let config = config::WebhookConfig::load(cli.config.as_deref())
        .unwrap_or_else(|e| fail(format!("Failed to load configuration: {e}")));
    let snapshot = config
        .snapshot()
        .unwrap_or_else(|e| fail(format!("Invalid configuration: {e}")));
    let listen_addr = config
        .listen_socket_addr()
        .unwrap_or_else(|e| fail(e.to_string()));
    let metrics_addr = config
        .metrics_socket_addr()
        .unwrap_or_else(|e| fail(e.to_string()));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(
        %listen_addr,
        %metrics_addr,
        log_level = %config.log_level,
        label = %snapshot.selector,
        rewrite_from = snapshot.rule.from_prefix(),
        rewrite_to = snapshot.rule.to_prefix(),
        init_containers = snapshot.scope.init_containers,
        ephemeral_containers = snapshot.scope.ephemeral_containers,
        debug_requests = snapshot.debug_requests,
        debug_patches = snapshot.debug_patches,
        "mount-rewriter starting"
    );

    let tls_config = tls::load_server_config(&config.tls_cert_path, &config.tls_key_path)
        .unwrap_or_else(|e| fail(format!("Failed to load TLS config: {e}")));
    let tls_acceptor = TlsAcceptor::from(tls_config);

    let mut registry = Registry::default();
    let app_state = Arc::new(handlers::AppState {
        engine: engine::MutationEngine::new(snapshot),
        metrics: metrics::RewriterMetrics::new(&mut registry),
    });
    let webhook_router = handlers::router(app_state);

    let serving = Arc::new(AtomicBool::new(false));
    let health_router = health::router(Arc::new(health::HealthState {
        registry,
        serving: serving.clone(),
    }));

    let https_listener = bind(listen_addr, "webhook listener").await;
    info!(addr = %listen_addr, "HTTPS webhook server listening");
    serving.store(true, Ordering::Relaxed);

    let http_listener = bind(metrics_addr, "health listener").await;
    info!(addr = %metrics_addr, "HTTP metrics/health server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(shutdown_signal(shutdown_tx));

    tokio::join!(
        run_https_server(https_listener, tls_acceptor, webhook_router, shutdown_rx.clone()),
        run_http_server(http_listener, health_router, shutdown_rx),
    );

    info!("mount-rewriter shut down gracefully");
}
