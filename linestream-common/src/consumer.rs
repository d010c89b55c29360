use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EntryError, WorkerError};
use crate::health::HealthHandle;
use crate::log::{Entry, EntryId, FieldLookup, LogClient, LogError};
use crate::metrics::{
    ACK_FAILURES, CLAIM_FAILURES, LINES_WRITTEN, MALFORMED_ENTRIES, POISONED_ENTRIES,
    RECLAIMED_ENTRIES, SINK_WRITE_FAILURES,
};
use crate::sink::LineSink;

/// Page size used when listing the group's pending entries for reclaiming.
const RECLAIM_PAGE_SIZE: usize = 100;

/// Where a worker consumes from and how it paces itself.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub stream: String,
    pub group: String,
    /// Identity of this worker within the group. Must be unique among live workers.
    pub consumer: String,
    /// Maximum number of entries claimed at once.
    pub claim_count: usize,
    /// How long a claim waits for new entries. Also the backoff after a failed claim.
    pub block_timeout: Duration,
    /// How often to look for entries other consumers left pending.
    pub reclaim_interval: Duration,
    /// How long an entry must sit pending before it is taken over.
    pub reclaim_min_idle: Duration,
    /// Entries delivered this many times are no longer reclaimed.
    pub max_deliveries: u64,
}

impl WorkerSettings {
    pub fn new(stream: &str, group: &str, consumer: &str) -> Self {
        Self {
            stream: stream.to_owned(),
            group: group.to_owned(),
            consumer: consumer.to_owned(),
            claim_count: 1,
            block_timeout: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(30),
            reclaim_min_idle: Duration::from_secs(60),
            max_deliveries: 10,
        }
    }
}

/// What happened to a batch of delivered entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub delivered: usize,
    /// Written to the sink and acknowledged.
    pub written: usize,
    pub malformed: usize,
    /// A sink or ack failure stopped the batch; the rest of it is still pending.
    pub interrupted: bool,
}

impl BatchOutcome {
    fn merge(&mut self, other: BatchOutcome) {
        self.delivered += other.delivered;
        self.written += other.written;
        self.malformed += other.malformed;
        self.interrupted |= other.interrupted;
    }
}

/// A consumer of a stream's consumer group, writing each line to its sink.
///
/// An entry is acknowledged only once its line was written and flushed, so every entry reaches
/// the sink at least once. A crash or a failed ack between the write and the ack means the line
/// is written again when the entry is redelivered.
///
/// Redelivery happens in two ways:
/// * own history: entries still pending for this consumer are replayed at startup and after any
///   write or ack failure;
/// * reclaim: entries left pending by any consumer for longer than `reclaim_min_idle` are taken
///   over, unless they already reached `max_deliveries`.
///
/// Malformed entries are never acknowledged. They are reclaimed until they hit the delivery
/// limit and then stay pending, reported by the `entries_poisoned` gauge.
pub struct ConsumerWorker<S> {
    log: Arc<dyn LogClient>,
    sink: S,
    settings: WorkerSettings,
    liveness: Option<HealthHandle>,
    replay_needed: bool,
}

impl<S: LineSink> ConsumerWorker<S> {
    pub fn new(log: Arc<dyn LogClient>, sink: S, settings: WorkerSettings) -> Self {
        Self {
            log,
            sink,
            settings,
            liveness: None,
            replay_needed: true,
        }
    }

    /// Report healthy on `liveness` at every loop iteration.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Consume until `cancel` fires. The token is checked between iterations and while backing
    /// off, never in the middle of a write/ack cycle. The group must already exist.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            consumer = %self.settings.consumer,
            "consuming {} as part of group {}", self.settings.stream, self.settings.group
        );
        let mut next_reclaim = Instant::now();

        while !cancel.is_cancelled() {
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }

            if self.replay_needed {
                if let Err(error) = self.replay_own_pending().await {
                    error!("failed to replay pending entries: {}", error);
                }
            }

            if Instant::now() >= next_reclaim {
                if let Err(error) = self.reclaim_stale().await {
                    error!("failed to reclaim idle entries: {}", error);
                }
                next_reclaim = Instant::now() + self.settings.reclaim_interval;
            }

            if let Err(error) = self.claim_new().await {
                error!("{}", error);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.block_timeout) => {}
                }
            }
        }

        info!(consumer = %self.settings.consumer, "consumer worker stopped");
    }

    /// Claim entries never delivered to the group, waiting up to the block timeout, and process
    /// them. Returns an empty outcome when the wait timed out.
    pub async fn claim_new(&mut self) -> Result<BatchOutcome, WorkerError> {
        let entries = self
            .log
            .read_new(
                &self.settings.stream,
                &self.settings.group,
                &self.settings.consumer,
                self.settings.claim_count,
                self.settings.block_timeout,
            )
            .await
            .map_err(|error| {
                metrics::counter!(CLAIM_FAILURES).increment(1);
                WorkerError::ClaimFailed(error)
            })?;

        Ok(self.process_batch(entries).await)
    }

    /// Process again every entry still pending for this consumer, oldest first.
    pub async fn replay_own_pending(&mut self) -> Result<BatchOutcome, LogError> {
        self.replay_needed = false;
        let mut after = EntryId::ZERO;
        let mut outcome = BatchOutcome::default();

        loop {
            let entries = match self
                .log
                .read_own_pending(
                    &self.settings.stream,
                    &self.settings.group,
                    &self.settings.consumer,
                    after,
                    self.settings.claim_count,
                )
                .await
            {
                Ok(entries) => entries,
                Err(error) => {
                    self.replay_needed = true;
                    return Err(error);
                }
            };
            let Some(last) = entries.last() else {
                break;
            };
            after = last.id;

            let batch = self.process_batch(entries).await;
            outcome.merge(batch);
            if batch.interrupted {
                break;
            }
        }

        if outcome.delivered > 0 {
            info!(
                "replayed {} pending entries, {} written, {} malformed",
                outcome.delivered, outcome.written, outcome.malformed
            );
        }
        Ok(outcome)
    }

    /// Take over and process entries any consumer left pending for at least `reclaim_min_idle`.
    /// Entries already delivered `max_deliveries` times are left where they are.
    pub async fn reclaim_stale(&mut self) -> Result<BatchOutcome, LogError> {
        let mut start = EntryId::ZERO;
        let mut poisoned = 0;
        let mut outcome = BatchOutcome::default();

        loop {
            let page = self
                .log
                .pending(
                    &self.settings.stream,
                    &self.settings.group,
                    self.settings.reclaim_min_idle,
                    start,
                    RECLAIM_PAGE_SIZE,
                )
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            start = last.id.successor();
            let last_page = page.len() < RECLAIM_PAGE_SIZE;

            let mut ids = Vec::with_capacity(page.len());
            for pending in page {
                if pending.deliveries >= self.settings.max_deliveries {
                    poisoned += 1;
                } else {
                    debug!(
                        "reclaiming {} from {} after {:?}",
                        pending.id, pending.consumer, pending.idle
                    );
                    ids.push(pending.id);
                }
            }

            if !ids.is_empty() {
                let entries = self
                    .log
                    .claim(
                        &self.settings.stream,
                        &self.settings.group,
                        &self.settings.consumer,
                        self.settings.reclaim_min_idle,
                        &ids,
                    )
                    .await?;
                metrics::counter!(RECLAIMED_ENTRIES).increment(entries.len() as u64);

                let batch = self.process_batch(entries).await;
                outcome.merge(batch);
                if batch.interrupted {
                    break;
                }
            }

            if last_page {
                break;
            }
        }

        metrics::gauge!(POISONED_ENTRIES).set(poisoned as f64);
        if poisoned > 0 {
            warn!(
                "{} entries reached {} deliveries and stay pending",
                poisoned, self.settings.max_deliveries
            );
        }
        if outcome.delivered > 0 {
            info!(
                "reclaimed {} idle entries, {} written, {} malformed",
                outcome.delivered, outcome.written, outcome.malformed
            );
        }
        Ok(outcome)
    }

    async fn process_batch(&mut self, entries: Vec<Entry>) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            delivered: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            match self.process(&entry).await {
                Ok(()) => outcome.written += 1,
                Err(error @ EntryError::MalformedEntry { .. }) => {
                    metrics::counter!(MALFORMED_ENTRIES).increment(1);
                    warn!("skipping entry: {}", error);
                    outcome.malformed += 1;
                }
                Err(error) => {
                    let counter = match error {
                        EntryError::SinkWriteFailed { .. } => SINK_WRITE_FAILURES,
                        _ => ACK_FAILURES,
                    };
                    metrics::counter!(counter).increment(1);
                    error!("{}", error);

                    // Everything left in this batch stays pending and comes back through replay.
                    self.replay_needed = true;
                    outcome.interrupted = true;
                    break;
                }
            }
        }

        outcome
    }

    async fn process(&mut self, entry: &Entry) -> Result<(), EntryError> {
        let line = match entry.line() {
            FieldLookup::Found(line) => line,
            FieldLookup::Missing => {
                return Err(EntryError::MalformedEntry {
                    id: entry.id,
                    shape: "missing",
                })
            }
            FieldLookup::WrongShape => {
                return Err(EntryError::MalformedEntry {
                    id: entry.id,
                    shape: "not valid UTF-8",
                })
            }
        };

        self.sink
            .write_line(line)
            .await
            .map_err(|error| EntryError::SinkWriteFailed {
                id: entry.id,
                error,
            })?;

        let was_pending = self
            .log
            .ack(&self.settings.stream, &self.settings.group, entry.id)
            .await
            .map_err(|error| EntryError::AckFailed {
                id: entry.id,
                error,
            })?;
        if !was_pending {
            debug!("entry {} was no longer pending when acknowledged", entry.id);
        }

        metrics::counter!(LINES_WRITTEN).increment(1);
        debug!(id = %entry.id, "consumed and acknowledged: {}", line);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use async_trait::async_trait;

    use super::*;
    use crate::group::ensure_group;
    use crate::log::{line_fields, FieldValue, Fields};
    use crate::memory::MemoryLog;

    const STREAM: &str = "lines";
    const GROUP: &str = "cg1";

    #[derive(Default)]
    struct VecSink {
        lines: Vec<String>,
        failures: usize,
    }

    #[async_trait]
    impl LineSink for VecSink {
        async fn write_line(&mut self, line: &str) -> io::Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::other("disk full"));
            }
            self.lines.push(line.to_owned());
            Ok(())
        }
    }

    fn settings(consumer: &str) -> WorkerSettings {
        WorkerSettings {
            claim_count: 10,
            block_timeout: Duration::from_millis(20),
            reclaim_min_idle: Duration::ZERO,
            max_deliveries: 3,
            ..WorkerSettings::new(STREAM, GROUP, consumer)
        }
    }

    async fn setup(lines: &[&str]) -> Arc<MemoryLog> {
        let log = Arc::new(MemoryLog::new());
        ensure_group(log.as_ref(), STREAM, GROUP).await.unwrap();
        for line in lines {
            log.append(STREAM, &line_fields(line)).await.unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_claim_writes_then_acks() {
        let log = setup(&["a", "b"]).await;
        let mut worker = ConsumerWorker::new(log.clone(), VecSink::default(), settings("c1"));

        let outcome = worker.claim_new().await.unwrap();
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.written, 2);
        assert_eq!(worker.sink().lines, vec!["a", "b"]);
        assert_eq!(log.pending_count(STREAM, GROUP).await.unwrap(), 0);

        let idle = worker.claim_new().await.unwrap();
        assert_eq!(idle, BatchOutcome::default());
    }

    #[tokio::test]
    async fn test_claim_failure_is_reported() {
        let log = setup(&[]).await;
        let mut worker = ConsumerWorker::new(log.clone(), VecSink::default(), settings("c1"));

        log.set_unavailable(true);
        assert!(matches!(
            worker.claim_new().await,
            Err(WorkerError::ClaimFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_sink_failure_leaves_rest_of_batch_pending() {
        let log = setup(&["a", "b", "c"]).await;
        let sink = VecSink {
            failures: 1,
            ..Default::default()
        };
        let mut worker = ConsumerWorker::new(log.clone(), sink, settings("c1"));
        worker.replay_needed = false;

        let outcome = worker.claim_new().await.unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.written, 0);
        assert!(worker.replay_needed);
        assert_eq!(log.pending_count(STREAM, GROUP).await.unwrap(), 3);

        let replayed = worker.replay_own_pending().await.unwrap();
        assert_eq!(replayed.written, 3);
        assert_eq!(worker.sink().lines, vec!["a", "b", "c"]);
        assert_eq!(log.pending_count(STREAM, GROUP).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped_not_acked() {
        let log = setup(&["a"]).await;
        log.append(
            STREAM,
            &Fields::from([("text".to_owned(), FieldValue::from("no line"))]),
        )
        .await
        .unwrap();
        log.append(
            STREAM,
            &Fields::from([("line".to_owned(), FieldValue::Binary(vec![0xff]))]),
        )
        .await
        .unwrap();
        log.append(STREAM, &line_fields("b")).await.unwrap();

        let mut worker = ConsumerWorker::new(log.clone(), VecSink::default(), settings("c1"));
        let outcome = worker.claim_new().await.unwrap();

        assert_eq!(outcome.malformed, 2);
        assert_eq!(outcome.written, 2);
        assert!(!outcome.interrupted);
        assert_eq!(worker.sink().lines, vec!["a", "b"]);
        assert_eq!(log.pending_count(STREAM, GROUP).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reclaim_skips_poisoned_entries() {
        let log = setup(&[]).await;
        log.append(STREAM, &Fields::new()).await.unwrap();

        let mut worker = ConsumerWorker::new(log.clone(), VecSink::default(), settings("c1"));
        worker.claim_new().await.unwrap();

        // Delivered once by the claim, then twice more by reclaiming: at the limit.
        assert_eq!(worker.reclaim_stale().await.unwrap().malformed, 1);
        assert_eq!(worker.reclaim_stale().await.unwrap().malformed, 1);
        assert_eq!(worker.reclaim_stale().await.unwrap().delivered, 0);

        let pending = log
            .pending(STREAM, GROUP, Duration::ZERO, EntryId::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].deliveries, 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let log = setup(&["a"]).await;
        let mut worker = ConsumerWorker::new(log.clone(), VecSink::default(), settings("c1"));
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                worker.run(cancel).await;
                worker
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let worker = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert_eq!(worker.into_sink().lines, vec!["a"]);
    }
}
