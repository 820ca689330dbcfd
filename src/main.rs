use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use pcd_gateway::config::AppConfig;
use pcd_gateway::infrastructure::{broker, database, storage};
use pcd_gateway::services::broker::CorrelationClient;
use pcd_gateway::services::ingress::IngressService;
use pcd_gateway::services::metadata::SeaOrmMetadataStore;
use pcd_gateway::services::processor::CopyProcessor;
use pcd_gateway::services::worker::ProcessingWorker;
use pcd_gateway::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// HTTP gateway only
    Api,
    /// Processing worker only
    Worker,
    /// Both in one process
    All,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service type to run
    #[arg(short, long, value_enum, default_value_t = Mode::All)]
    mode: Mode,

    /// Port for the API server (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Environment & logging
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pcd_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = AppConfig::from_env();
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("🚀 Starting PCD Gateway [Mode: {:?}]...", args.mode);
    info!(
        "⚙️  Reply timeout={:?}, Worker pool={}, Connect retry={}x{:?}",
        config.broker.reply_timeout,
        config.worker.pool_size,
        config.retry.attempts,
        config.retry.backoff
    );

    // 2. Shared infrastructure
    let blob_store = storage::setup_storage(&config.storage, config.retry).await?;
    let transport = broker::setup_broker(&config.broker, config.retry).await?;

    // 3. Graceful shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    let mut worker_stats = None;

    // 4. Processing worker
    if matches!(args.mode, Mode::Worker | Mode::All) {
        let processor = Arc::new(CopyProcessor::new(
            blob_store.clone(),
            config.worker.output_prefix.clone(),
        ));
        let worker = ProcessingWorker::new(
            transport.clone(),
            processor,
            config.broker.exchange.clone(),
            config.broker.queue.clone(),
            config.worker.clone(),
            shutdown_rx.clone(),
        );
        worker_stats = Some(worker.stats());

        handles.push(tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                error!("❌ Processing worker failed: {}", e);
            }
        }));
        info!("👷 Worker service initialized.");
    }

    // 5. HTTP gateway
    if matches!(args.mode, Mode::Api | Mode::All) {
        let db = database::setup_database(&config.database, config.retry).await?;

        let ingress = Arc::new(IngressService::new(
            blob_store.clone(),
            Arc::new(SeaOrmMetadataStore::new(db.clone())),
            Arc::new(CorrelationClient::new(
                transport.clone(),
                config.broker.exchange.clone(),
            )),
            config.broker.reply_timeout,
        ));

        let state = AppState {
            db,
            ingress,
            config: config.clone(),
            worker_stats,
        };

        // Configure tracing layer for HTTP requests
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            );

        let app = create_app(state).layer(trace_layer);
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("✅ API Server listening on: http://0.0.0.0:{}", config.server.port);
        info!(
            "📖 Swagger UI documentation: http://localhost:{}/swagger-ui",
            config.server.port
        );

        let mut server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await
            {
                error!("❌ Server runtime error: {}", e);
            }
        }));
    }

    // 6. Wait for the signal, then drain
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    info!("🛑 Shutting down gateway services...");
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Service task ended abnormally: {}", e);
        }
    }
    transport.shutdown().await;

    info!("👋 Gateway exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
