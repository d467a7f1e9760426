//! Serve stream events and deliver the records they carry to the destination API.
use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use poster_common::metrics::{serve, setup_metrics_routes};
use poster_worker::api::add_routes;
use poster_worker::config::{Config, LogFormat};
use poster_worker::handler::BatchHandler;

fn init_tracing(config: &Config) {
    // RUST_LOG wins over LOG_LEVEL when both are set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let log_layer = match config.log_format {
        LogFormat::Json => fmt::layer()
            .with_target(true)
            .with_level(true)
            .json()
            .with_filter(filter)
            .boxed(),
        LogFormat::Text => fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().wrap_err("invalid configuration")?;

    init_tracing(&config);

    let handler = BatchHandler::from_config(&config)
        .await
        .wrap_err("failed to initialize batch handler")?;

    let router = add_routes(
        Router::new(),
        Arc::new(handler),
        config.max_body_size,
        config.concurrency_limit,
    );
    let router = setup_metrics_routes(router).wrap_err("failed to install metrics recorder")?;

    let bind = config.bind();
    tracing::info!(%bind, "listening");

    serve(router, &bind).await.wrap_err("failed to serve")?;

    Ok(())
}
