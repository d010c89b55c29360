//! Consume the stream as part of a consumer group and append each line to the output file.
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::{eyre, Result, WrapErr};
use linestream_common::health::{add_health_routes, HealthRegistry, HealthState};
use linestream_common::lifecycle::cancel_on_shutdown_signal;
use linestream_common::metrics::{serve, setup_metrics_routes};
use linestream_common::{ensure_group, ConsumerWorker, FileSink, LogClient};
use linestream_writer::config::Config;
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
    let settings = config.worker_settings();

    let log: Arc<dyn LogClient> = Arc::new(config.log.connect().await?);

    // Without a group there is nothing to consume: failing here is fatal.
    ensure_group(log.as_ref(), &settings.stream, &settings.group)
        .await?;

    let sink = FileSink::open(&config.output_path, config.sink_fsync)
        .await
        .wrap_err_with(|| format!("failed to open {}", config.output_path))?;

    let liveness = HealthRegistry::new("liveness");
    // A claim blocks for up to the block timeout, leave room for a slow write and ack too.
    let worker_liveness = liveness.register(
        "worker",
        (settings.block_timeout * 6).max(Duration::from_secs(30)),
    );

    let router = add_health_routes(
        Router::new(),
        HealthState {
            service: "linestream writer",
            log: log.clone(),
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

    let cancel = CancellationToken::new();
    cancel_on_shutdown_signal(cancel.clone());

    info!("consuming as {}", settings.consumer);
    let mut worker = ConsumerWorker::new(log, sink, settings).with_liveness(worker_liveness);
    let consuming = tokio::spawn(async move { worker.run(cancel).await });

    tokio::select! {
        res = consuming => {
            if let Err(e) = res {
                error!("worker task failed: {}", e);
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
