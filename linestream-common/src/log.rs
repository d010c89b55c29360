use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// The single payload field carried by every entry we produce.
pub const LINE_FIELD: &str = "line";

/// Enumeration of errors returned by a `LogClient`.
/// Redis errors are wrapped so callers can tell transient failures from misconfiguration.
#[derive(Error, Debug, Clone)]
pub enum LogError {
    #[error("timed out waiting for the log")]
    Timeout,
    #[error("log is unavailable: {0}")]
    Unavailable(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("could not parse log reply: {0}")]
    Parse(String),
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for LogError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            LogError::Timeout
        } else {
            LogError::Redis(Arc::new(err))
        }
    }
}

impl LogError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LogError::Timeout | LogError::Unavailable(_) => true,
            LogError::InvalidConfiguration(_) | LogError::Parse(_) => false,
            LogError::Redis(err) => {
                !matches!(
                    err.kind(),
                    redis::ErrorKind::InvalidClientConfig | redis::ErrorKind::AuthenticationFailed
                ) && !err.is_unrecoverable_error()
            }
        }
    }
}

/// Identifier of an entry in a stream, `<millis>-<seq>` on the wire.
/// Ordering follows the stream's total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The smallest id strictly greater than `self`.
    pub fn successor(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => EntryId::new(self.millis, seq),
            None => EntryId::new(self.millis.saturating_add(1), 0),
        }
    }

    /// The smallest id strictly greater than `self` for a given wall clock reading.
    pub fn next_after(&self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            EntryId::new(now_millis, 0)
        } else {
            self.successor()
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid entry id")]
pub struct ParseEntryIdError(pub String);

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEntryIdError(s.to_owned());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };

        Ok(EntryId {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// A field value as stored in the log. Anything that is not valid UTF-8 is kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Binary(Vec<u8>),
}

impl FieldValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FieldValue::Text(text) => text.as_bytes(),
            FieldValue::Binary(bytes) => bytes,
        }
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => FieldValue::Text(text),
            Err(err) => FieldValue::Binary(err.into_bytes()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(text: &str) -> Self {
        FieldValue::Text(text.to_owned())
    }
}

pub type Fields = HashMap<String, FieldValue>;

/// Result of looking up a payload field on an entry.
#[derive(Debug, PartialEq, Eq)]
pub enum FieldLookup<'a> {
    Found(&'a str),
    Missing,
    WrongShape,
}

/// An immutable record read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: EntryId,
    pub fields: Fields,
}

impl Entry {
    pub fn new(id: EntryId, fields: Fields) -> Self {
        Self { id, fields }
    }

    pub fn field(&self, key: &str) -> FieldLookup<'_> {
        match self.fields.get(key) {
            Some(FieldValue::Text(text)) => FieldLookup::Found(text),
            Some(FieldValue::Binary(_)) => FieldLookup::WrongShape,
            None => FieldLookup::Missing,
        }
    }

    pub fn line(&self) -> FieldLookup<'_> {
        self.field(LINE_FIELD)
    }
}

/// Build the payload of a line entry.
pub fn line_fields(line: &str) -> Fields {
    Fields::from([(LINE_FIELD.to_owned(), FieldValue::from(line))])
}

/// Outcome of a group creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// An entry that was delivered to a consumer of a group and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub deliveries: u64,
}

/// The operations we need from a durable, replayable, multi-group log.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), LogError>;

    /// Append one entry, creating the stream if needed. Returns the id assigned by the log.
    async fn append(&self, stream: &str, fields: &Fields) -> Result<EntryId, LogError>;

    /// Create `group` on `stream` positioned at the current end of the stream.
    /// The stream is created empty if it doesn't exist yet.
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, LogError>;

    /// Claim up to `count` entries never delivered to the group, waiting up to `block`.
    /// An empty result means the wait timed out.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Entry>, LogError>;

    /// Re-read up to `count` entries pending for `consumer` with an id greater than `after`.
    async fn read_own_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: EntryId,
        count: usize,
    ) -> Result<Vec<Entry>, LogError>;

    /// List up to `count` pending entries of the group, any consumer, idle for at least
    /// `min_idle`, starting at id `start` (inclusive).
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>, LogError>;

    /// Transfer ownership of pending entries idle for at least `min_idle` to `consumer`.
    /// Entries that were acknowledged or taken meanwhile are left out of the result.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<Entry>, LogError>;

    /// Acknowledge an entry. Returns whether it was pending.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, LogError>;

    /// Number of entries pending in the group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, LogError>;
}
