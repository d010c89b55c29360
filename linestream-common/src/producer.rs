use std::sync::Arc;

use tracing::debug;

use crate::error::ProducerError;
use crate::log::{line_fields, EntryId, LogClient};
use crate::metrics::{LINES_READ, LINE_APPEND_FAILURES};

/// Appends lines to a stream, one entry per line. Holds nothing but the log handle, so it can be
/// cloned freely across tasks; the log orders concurrent appends.
#[derive(Clone)]
pub struct Producer {
    log: Arc<dyn LogClient>,
}

impl Producer {
    pub fn new(log: Arc<dyn LogClient>) -> Self {
        Self { log }
    }

    /// Append `line` as a single entry with a `line` field.
    /// Failures are reported and not retried: whether to try again is up to the caller.
    pub async fn append(&self, stream: &str, line: &str) -> Result<EntryId, ProducerError> {
        match self.log.append(stream, &line_fields(line)).await {
            Ok(id) => {
                metrics::counter!(LINES_READ).increment(1);
                debug!(%id, "produced: {}", line);
                Ok(id)
            }
            Err(error) => {
                metrics::counter!(LINE_APPEND_FAILURES).increment(1);
                Err(ProducerError::AppendFailed {
                    stream: stream.to_owned(),
                    error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::FieldLookup;
    use crate::memory::MemoryLog;

    #[tokio::test]
    async fn test_append_creates_one_line_entry() {
        let log = Arc::new(MemoryLog::new());
        let producer = Producer::new(log.clone());

        let first = producer.append("lines", "hello").await.unwrap();
        let second = producer.append("lines", "").await.unwrap();
        assert!(second > first);

        let entries = log.entries("lines");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].line(), FieldLookup::Found("hello"));
        assert_eq!(entries[0].fields.len(), 1);
        assert_eq!(entries[1].line(), FieldLookup::Found(""));
    }

    #[tokio::test]
    async fn test_append_failure_writes_nothing() {
        let log = Arc::new(MemoryLog::new());
        let producer = Producer::new(log.clone());

        log.set_unavailable(true);
        let result = producer.append("lines", "lost").await;
        assert!(matches!(result, Err(ProducerError::AppendFailed { .. })));

        log.set_unavailable(false);
        assert!(log.entries("lines").is_empty());
    }
}
