use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use region_counter::{config::Config, health::HealthRegistry, service::RegionCountService};

fn setup_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")
}

async fn serve(router: Router, bind: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(|| async { "region counter service" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route("/_liveness", get(move || ready(liveness.get_status())));

    let router = if config.export_prometheus {
        let recorder_handle = setup_metrics()?;
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    };

    let bind = config.bind_address.clone();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Metrics server on {bind} stopped: {e:?}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    // Initialize tracing
    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();

    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting region counter service");
    info!("Configuration loaded: {:?}", config);

    let settings = config
        .resolve()
        .context("Invalid configuration, refusing to start")?;

    let liveness = HealthRegistry::new("liveness");
    let server_handle = start_server(&config, liveness.clone())?;
    info!("Started metrics server on {}", config.bind_address);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, shutting down");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for interrupt: {e:?}"),
        }
    });

    let service = RegionCountService::new(config, settings, liveness)
        .await
        .context("Failed to create region count service")?;

    // Run the service (this blocks until shutdown)
    let result = service.run(shutdown).await;

    // Clean up metrics server
    server_handle.abort();

    result
}
