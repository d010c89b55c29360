use std::io;

use thiserror::Error;

use crate::log::{EntryId, LogError};

/// Errors appending a line to the stream.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("failed to append line to stream {stream}: {error}")]
    AppendFailed { stream: String, error: LogError },
}

/// Errors creating the consumer group. Without a group a worker cannot consume anything.
#[derive(Error, Debug)]
pub enum GroupError {
    #[error("failed to create consumer group {group} on stream {stream}: {error}")]
    GroupBootstrapFailed {
        stream: String,
        group: String,
        error: LogError,
    },
}

/// Why an entry was seen but is still pending after processing.
#[derive(Error, Debug)]
pub enum EntryError {
    #[error("entry {id} has no text `line` field ({shape})")]
    MalformedEntry { id: EntryId, shape: &'static str },
    #[error("failed to write entry {id} to the sink: {error}")]
    SinkWriteFailed { id: EntryId, error: io::Error },
    #[error("entry {id} was written but could not be acknowledged: {error}")]
    AckFailed { id: EntryId, error: LogError },
}

/// Enumeration of errors related to running a consumer worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to claim entries: {0}")]
    ClaimFailed(LogError),
}
