use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use tracing::warn;

use crate::log::{
    Entry, EntryId, FieldValue, Fields, GroupCreation, LogClient, LogError, ParseEntryIdError,
    PendingEntry,
};

/// Longest wait a blocking group read may ask for. Longer requests are shortened to this.
pub const MAX_BLOCK: Duration = Duration::from_secs(60);

/// `LogClient` backed by Redis streams and consumer groups.
///
/// Both connections are `ConnectionManager`s, which reconnect on their own after Redis restarts
/// or the link drops. Blocking group reads go through their own connection: a connection
/// serializes commands, and we don't want acks or health probes queued behind an
/// `XREADGROUP ... BLOCK`.
pub struct RedisLog {
    client: redis::Client,
    response_timeout: Duration,
    connection_timeout: Duration,
    connection: ConnectionManager,
    blocking: RwLock<ConnectionManager>,
}

impl RedisLog {
    /// Connect to Redis with default timeouts of 5 seconds.
    pub async fn new(url: &str) -> Result<RedisLog, LogError> {
        let timeout = Duration::from_secs(5);
        Self::with_config(url, timeout, timeout).await
    }

    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection string, e.g. `redis://localhost:6379`
    /// * `response_timeout` - Timeout for non-blocking commands. Blocking reads may take up to
    ///   their block duration on top of it.
    /// * `connection_timeout` - Timeout for establishing each connection, reconnects included.
    ///
    /// # Errors
    /// Returns `LogError::InvalidConfiguration` if a zero timeout is passed.
    pub async fn with_config(
        url: &str,
        response_timeout: Duration,
        connection_timeout: Duration,
    ) -> Result<RedisLog, LogError> {
        if response_timeout.is_zero() || connection_timeout.is_zero() {
            return Err(LogError::InvalidConfiguration(
                "Redis timeouts cannot be zero".to_owned(),
            ));
        }

        let client = redis::Client::open(url)?;

        let connection = manager(&client, response_timeout, connection_timeout);
        let blocking = manager(&client, MAX_BLOCK + response_timeout, connection_timeout);
        let (connection, blocking) = tokio::try_join!(connection, blocking)?;

        Ok(RedisLog {
            client,
            response_timeout,
            connection_timeout,
            connection,
            blocking: RwLock::new(blocking),
        })
    }

    fn blocking(&self) -> ConnectionManager {
        match self.blocking.read() {
            Ok(conn) => conn.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the blocking connection. A read that outlived its deadline may still be queued on
    /// the old one, which would hold back every later read.
    async fn reset_blocking(&self) {
        let response_timeout = MAX_BLOCK + self.response_timeout;
        let fresh = manager(&self.client, response_timeout, self.connection_timeout);
        let fresh = match fresh.await {
            Ok(fresh) => fresh,
            Err(error) => {
                warn!("failed to replace the blocking connection: {}", error);
                return;
            }
        };

        let mut conn = match self.blocking.write() {
            Ok(conn) => conn,
            Err(poisoned) => poisoned.into_inner(),
        };
        *conn = fresh;
    }
}

async fn manager(
    client: &redis::Client,
    response_timeout: Duration,
    connection_timeout: Duration,
) -> Result<ConnectionManager, LogError> {
    let config = ConnectionManagerConfig::new()
        .set_response_timeout(response_timeout)
        .set_connection_timeout(connection_timeout);
    let connecting = ConnectionManager::new_with_config(client.clone(), config);
    Ok(connecting.await?)
}

fn parse_id(id: &str) -> Result<EntryId, LogError> {
    id.parse()
        .map_err(|err: ParseEntryIdError| LogError::Parse(err.to_string()))
}

/// Convert a stream entry as returned by Redis into our `Entry`.
/// Field values that aren't strings are kept as raw bytes so the payload accessor reports them.
fn to_entry(stream_id: StreamId) -> Result<Entry, LogError> {
    let id = parse_id(&stream_id.id)?;
    let fields: Fields = stream_id
        .map
        .into_iter()
        .map(|(key, value)| {
            let value = match redis::from_redis_value::<Vec<u8>>(&value) {
                Ok(bytes) => FieldValue::from(bytes),
                Err(err) => {
                    warn!("entry {} has a non-string field {}: {}", id, key, err);
                    FieldValue::Binary(Vec::new())
                }
            };
            (key, value)
        })
        .collect();

    Ok(Entry::new(id, fields))
}

fn to_entries(ids: Vec<StreamId>) -> Result<Vec<Entry>, LogError> {
    ids.into_iter().map(to_entry).collect()
}

fn read_reply_entries(reply: Option<StreamReadReply>) -> Result<Vec<Entry>, LogError> {
    match reply {
        Some(reply) => reply
            .keys
            .into_iter()
            .map(|key| to_entries(key.ids))
            .collect::<Result<Vec<_>, _>>()
            .map(|entries| entries.into_iter().flatten().collect()),
        None => Ok(Vec::new()),
    }
}

#[async_trait]
impl LogClient for RedisLog {
    async fn ping(&self) -> Result<(), LogError> {
        let mut conn = self.connection.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &Fields) -> Result<EntryId, LogError> {
        let mut conn = self.connection.clone();
        let items: Vec<(&str, Vec<u8>)> = fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_bytes().to_vec()))
            .collect();

        let id: String = conn.xadd(stream, "*", items.as_slice()).await?;
        parse_id(&id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, LogError> {
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "$").await;

        match result {
            Ok(()) => Ok(GroupCreation::Created),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Entry>, LogError> {
        let block = block.min(MAX_BLOCK);
        let mut conn = self.blocking();
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        // BLOCK 0 waits forever, a zero duration means don't wait at all.
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }

        let deadline = block + self.response_timeout;
        let streams = [stream];
        let read = conn.xread_options(&streams, &[">"], &options);
        let reply: Option<StreamReadReply> = match tokio::time::timeout(deadline, read).await {
            Ok(reply) => reply?,
            Err(_) => {
                warn!("blocking read got no answer within {:?}", deadline);
                self.reset_blocking().await;
                return Err(LogError::Timeout);
            }
        };
        read_reply_entries(reply)
    }

    async fn read_own_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: EntryId,
        count: usize,
    ) -> Result<Vec<Entry>, LogError> {
        let mut conn = self.connection.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[after.to_string()], &options)
            .await?;
        read_reply_entries(reply)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>, LogError> {
        let mut conn = self.connection.clone();
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle.as_millis() as u64)
            .arg(start.to_string())
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        reply
            .ids
            .into_iter()
            .map(|pending| {
                Ok(PendingEntry {
                    id: parse_id(&pending.id)?,
                    consumer: pending.consumer,
                    idle: Duration::from_millis(pending.last_delivered_ms as u64),
                    deliveries: pending.times_delivered as u64,
                })
            })
            .collect()
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<Entry>, LogError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let ids: Vec<String> = ids.iter().map(EntryId::to_string).collect();
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle.as_millis() as u64, &ids)
            .await?;

        to_entries(reply.ids)
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, LogError> {
        let mut conn = self.connection.clone();
        let acked: u64 = conn.xack(stream, group, &[id.to_string()]).await?;
        Ok(acked > 0)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, LogError> {
        let mut conn = self.connection.clone();
        let reply: StreamPendingReply = conn.xpending(stream, group).await?;
        Ok(reply.count() as u64)
    }
}
