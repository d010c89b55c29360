use std::time::{Duration, Instant};

use envconfig::Envconfig;
use linestream_common::config::LogConfig;
use linestream_common::Producer;
use tracing::{error, warn};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "NUM_MESSAGES", default = "100000")]
    pub num_messages: usize,

    #[envconfig(from = "NUM_WORKERS", default = "100")]
    pub num_workers: usize,

    #[envconfig(nested = true)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchReport {
    pub appended: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl BenchReport {
    pub fn per_second(&self) -> f64 {
        self.appended as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }
}

/// Number of messages sent by `worker`: `messages` split evenly, the remainder going to the
/// first workers.
fn share(messages: usize, workers: usize, worker: usize) -> usize {
    messages / workers + usize::from(worker < messages % workers)
}

/// Append `messages` synthetic lines to `stream` from `workers` concurrent tasks.
/// Failed appends are logged and counted, never retried.
pub async fn run_benchmark(
    producer: &Producer,
    stream: &str,
    messages: usize,
    workers: usize,
) -> BenchReport {
    let workers = workers.max(1);
    let start = Instant::now();

    let tasks: Vec<_> = (0..workers)
        .map(|worker| {
            let producer = producer.clone();
            let stream = stream.to_owned();
            tokio::spawn(async move {
                let mut failed: usize = 0;
                for message in 0..share(messages, workers, worker) {
                    let line = format!(
                        "worker-{}-message-{}-{}",
                        worker,
                        message,
                        rand::random::<u32>() % 1_000_000
                    );
                    if let Err(e) = producer.append(&stream, &line).await {
                        warn!("worker {} failed to push: {}", worker, e);
                        failed += 1;
                    }
                }
                failed
            })
        })
        .collect();

    let mut failed = 0;
    for result in futures::future::join_all(tasks).await {
        match result {
            Ok(worker_failed) => failed += worker_failed,
            Err(e) => error!("bench worker panicked: {}", e),
        }
    }

    BenchReport {
        appended: messages - failed.min(messages),
        failed,
        elapsed: start.elapsed(),
    }
}
