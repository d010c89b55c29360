use std::io;
use std::path::PathBuf;
use std::time::Duration;

use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use linemux::MuxedLines;
use linestream_common::health::HealthHandle;
use linestream_common::metrics::TAIL_ERRORS;
use linestream_common::Producer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often the shipping loop reports itself live while the input is quiet.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Follow `path` from its current end, yielding each line appended to it without its newline.
/// The file may not exist yet, but its parent directory must.
pub async fn tail_file(
    path: impl Into<PathBuf>,
) -> io::Result<BoxStream<'static, io::Result<String>>> {
    let mut lines = MuxedLines::new()?;
    let path = lines.add_file(path).await?;
    info!("tailing {}", path.display());

    Ok(lines.map_ok(|line| line.line().to_owned()).boxed())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShipReport {
    pub shipped: u64,
    pub failed: u64,
    pub read_errors: u64,
}

/// Append every line of `lines` to `stream` until the input ends or `cancel` fires.
///
/// Read and append failures are logged and counted, the line is dropped and shipping goes on.
pub async fn ship_lines<S>(
    mut lines: S,
    producer: &Producer,
    stream: &str,
    liveness: &HealthHandle,
    cancel: CancellationToken,
) -> ShipReport
where
    S: Stream<Item = io::Result<String>> + Unpin,
{
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut report = ShipReport::default();
    liveness.report_healthy();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick() => liveness.report_healthy(),
            next = lines.next() => match next {
                Some(Ok(line)) => match producer.append(stream, &line).await {
                    Ok(_) => report.shipped += 1,
                    Err(e) => {
                        error!("dropping line: {}", e);
                        report.failed += 1;
                    }
                },
                Some(Err(e)) => {
                    metrics::counter!(TAIL_ERRORS).increment(1);
                    error!("failed to read input: {}", e);
                    report.read_errors += 1;
                }
                None => {
                    warn!("input closed");
                    break;
                }
            }
        }
    }

    info!(
        "shipped {} lines, {} failed, {} read errors",
        report.shipped, report.failed, report.read_errors
    );
    report
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use linestream_common::health::HealthRegistry;
    use linestream_common::log::FieldLookup;
    use linestream_common::MemoryLog;

    use super::*;

    #[tokio::test]
    async fn test_ship_lines_skips_failures() {
        let log = Arc::new(MemoryLog::new());
        let producer = Producer::new(log.clone());
        let liveness = HealthRegistry::new("liveness");
        let handle = liveness.register("tail", Duration::from_secs(30));

        let lines = futures::stream::iter(vec![
            Ok("a".to_owned()),
            Err(io::Error::other("truncated")),
            Ok("".to_owned()),
            Ok("b".to_owned()),
        ]);
        let report = ship_lines(
            lines,
            &producer,
            "lines",
            &handle,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(
            report,
            ShipReport {
                shipped: 3,
                failed: 0,
                read_errors: 1
            }
        );
        let entries = log.entries("lines");
        assert_eq!(entries[0].line(), FieldLookup::Found("a"));
        assert_eq!(entries[1].line(), FieldLookup::Found(""));
        assert_eq!(entries[2].line(), FieldLookup::Found("b"));
        assert!(liveness.get_status().healthy);
    }

    #[tokio::test]
    async fn test_ship_lines_counts_append_failures() {
        let log = Arc::new(MemoryLog::new());
        log.set_unavailable(true);
        let producer = Producer::new(log.clone());
        let handle = HealthRegistry::new("liveness").register("tail", Duration::from_secs(30));

        let lines = futures::stream::iter(vec![Ok("lost".to_owned())]);
        let cancel = CancellationToken::new();
        let report = ship_lines(lines, &producer, "lines", &handle, cancel)
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.shipped, 0);
    }

    #[tokio::test]
    async fn test_ship_lines_stops_on_cancel() {
        let producer = Producer::new(Arc::new(MemoryLog::new()));
        let handle = HealthRegistry::new("liveness").register("tail", Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            ship_lines(
                futures::stream::pending::<io::Result<String>>(),
                &producer,
                "lines",
                &handle,
                cancel,
            ),
        )
        .await
        .expect("shipping did not stop");
        assert_eq!(report, ShipReport::default());
    }

    #[tokio::test]
    async fn test_tail_file_follows_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "already there\n").unwrap();

        let mut lines = tail_file(&path).await.unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        writeln!(file, "first").unwrap();
        writeln!(file, "second").unwrap();
        file.sync_all().unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let line = tokio::time::timeout(Duration::from_secs(10), lines.next())
                .await
                .expect("no line tailed")
                .expect("tail ended")
                .unwrap();
            seen.push(line);
        }
        assert_eq!(seen, vec!["first", "second"]);
    }
}
