use anyhow::{Context, Result};
use axum::{routing::get, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use event_archiver::config::Config;
use event_archiver::service::ArchiverService;
use serve_metrics::{serve, setup_metrics_recorder, setup_metrics_routes};

pub async fn index() -> &'static str {
    "event archiver"
}

fn init_tracing(log_format: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = match log_format {
        "json" => fmt::layer().json().flatten_event(true).boxed(),
        _ => fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .init();
}

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let recorder = setup_metrics_recorder().context("Failed to install metrics recorder")?;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        );
    let router = setup_metrics_routes(router, recorder);

    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve metrics on {bind}: {e:#}");
        }
    }))
}

async fn cancel_on_signal(shutdown: CancellationToken) -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = interrupt.recv() => info!("Received SIGINT"),
    };

    shutdown.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env();
    init_tracing(config.as_ref().map_or("text", |c| c.log_format.as_str()));

    let config = config.context(
        "Failed to load configuration from environment variables. Please check your environment setup.",
    )?;
    config.validate().context("Invalid configuration")?;

    info!(
        kafka_hosts = config.kafka_hosts,
        topic = config.kafka_consumer_topic,
        group = config.kafka_consumer_group,
        bucket = config.s3_bucket,
        prefix = config.s3_key_prefix,
        max_batch_size = config.max_batch_size,
        max_batch_age_ms = config.max_batch_age.0.as_millis() as u64,
        compression = %config.parquet_compression,
        "Configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");
    let server_handle = start_server(&config, liveness.clone())?;
    info!("Started metrics server on {}", config.bind());

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = cancel_on_signal(signal_shutdown).await {
            error!("Failed to register signal handlers: {e:#}");
        }
    });

    let result = ArchiverService::new(config, liveness).run(shutdown).await;
    server_handle.abort();

    if let Err(e) = &result {
        error!("Event archiver failed: {e:#}");
    }
    result.map(|_| ())
}
