//! Push synthetic lines to the stream from many concurrent tasks and report the throughput.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use linestream_bench::{run_benchmark, Config};
use linestream_common::Producer;
use tracing::info;
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

    let config = Config::init_from_env()?;
    let producer = Producer::new(Arc::new(config.log.connect().await?));

    let report = run_benchmark(
        &producer,
        config.log.stream_name.as_str(),
        config.num_messages,
        config.num_workers,
    )
    .await;

    info!(
        "inserted {} messages ({} failed) with {} workers in {:?}, {:.0} msg/s",
        report.appended,
        report.failed,
        config.num_workers,
        report.elapsed,
        report.per_second()
    );
    Ok(())
}
