//! Tail the input file and append each new line to the stream.
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::{eyre, Result, WrapErr};
use linestream_common::health::{add_health_routes, HealthRegistry, HealthState};
use linestream_common::lifecycle::cancel_on_shutdown_signal;
use linestream_common::metrics::{serve, setup_metrics_routes};
use linestream_common::{LogClient, Producer};
use linestream_reader::config::Config;
use linestream_reader::tail::{ship_lines, tail_file};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("starting up...");

    let config = Config::init_from_env()?;
    let stream = config.log.stream_name.as_str().to_owned();

    let log: Arc<dyn LogClient> = Arc::new(config.log.connect().await?);
    let producer = Producer::new(log.clone());

    let liveness = HealthRegistry::new("liveness");
    let tail_liveness = liveness.register("tail", Duration::from_secs(30));

    let router = add_health_routes(
        Router::new(),
        HealthState {
            service: "linestream reader",
            log,
            probe_timeout: config.health_probe_timeout.0,
            liveness,
        },
    );
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();
    let listener = TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("failed to bind {bind}"))?;
    info!("listening on {}", bind);
    let http_server = tokio::spawn(serve(router, listener));

    let lines = tail_file(&config.input_path).await?;

    let cancel = CancellationToken::new();
    cancel_on_shutdown_signal(cancel.clone());

    let shipping = tokio::spawn(async move {
        ship_lines(lines, &producer, &stream, &tail_liveness, cancel)
            .await
    });

    tokio::select! {
        res = shipping => {
            if let Err(e) = res {
                error!("tail task failed: {}", e);
            }
        }
        res = http_server => {
            match res {
                Ok(Err(e)) => error!("server failed with: {}", e),
                Err(e) => error!("server task failed: {}", e),
                Ok(Ok(())) => {}
            }
            return Err(eyre!("http server exited"));
        }
    }

    info!("exiting");
    Ok(())
}
