use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::log::{Entry, EntryId, Fields, GroupCreation, LogClient, LogError, PendingEntry};

/// A `LogClient` living in process memory, with the delivery semantics of a Redis stream
/// consumer group: a per-group last-delivered cursor, a pending set with owner and delivery
/// count, history replay and idle-based claiming.
///
/// Faults can be injected to exercise failure paths: the whole log can be marked unavailable,
/// and a number of upcoming acknowledgements can be made to fail.
#[derive(Default)]
pub struct MemoryLog {
    state: Mutex<State>,
    appended: Notify,
    unavailable: AtomicBool,
    failing_acks: AtomicUsize,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
}

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, Delivery>,
}

struct Delivery {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

impl Delivery {
    fn first(consumer: &str) -> Self {
        Self {
            consumer: consumer.to_owned(),
            delivered_at: Instant::now(),
            deliveries: 1,
        }
    }

    fn redeliver_to(&mut self, consumer: &str) {
        consumer.clone_into(&mut self.consumer);
        self.delivered_at = Instant::now();
        self.deliveries += 1;
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `LogError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` acknowledgements fail, leaving the entries pending.
    pub fn fail_next_acks(&self, count: usize) {
        self.failing_acks.store(count, Ordering::SeqCst);
    }

    /// Snapshot of every entry in a stream, in stream order.
    pub fn entries(&self, stream: &str) -> Vec<Entry> {
        self.lock()
            .streams
            .get(stream)
            .map(|stream| {
                stream
                    .entries
                    .iter()
                    .map(|(id, fields)| Entry::new(*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The last-delivered cursor of a group, if the group exists.
    pub fn group_cursor(&self, stream: &str, group: &str) -> Option<EntryId> {
        self.lock()
            .streams
            .get(stream)
            .and_then(|stream| stream.groups.get(group))
            .map(|group| group.last_delivered)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_available(&self) -> Result<(), LogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            let reason = "memory log marked unavailable".to_owned();
            Err(LogError::Unavailable(reason))
        } else {
            Ok(())
        }
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Deliver up to `count` entries past the group cursor, moving it forward.
    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<Entry>, LogError> {
        let mut state = self.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let group_state = stream_state
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let cursor = group_state.last_delivered;
        let delivered: Vec<Entry> = stream_state
            .entries
            .range(cursor..)
            .filter(|(id, _)| **id > cursor)
            .take(count)
            .map(|(id, fields)| Entry::new(*id, fields.clone()))
            .collect();

        for entry in &delivered {
            group_state.last_delivered = entry.id;
            group_state
                .pending
                .insert(entry.id, Delivery::first(consumer));
        }

        Ok(delivered)
    }
}

fn no_group(stream: &str, group: &str) -> LogError {
    LogError::InvalidConfiguration(format!(
        "no such key '{stream}' or consumer group '{group}'"
    ))
}

#[async_trait]
impl LogClient for MemoryLog {
    async fn ping(&self) -> Result<(), LogError> {
        self.check_available()
    }

    async fn append(&self, stream: &str, fields: &Fields) -> Result<EntryId, LogError> {
        self.check_available()?;

        let id = {
            let mut state = self.lock();
            let stream_state = state.streams.entry(stream.to_owned()).or_default();
            let id = stream_state.last_id.next_after(Self::now_millis());
            stream_state.last_id = id;
            stream_state.entries.insert(id, fields.clone());
            id
        };
        self.appended.notify_waiters();

        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreation, LogError> {
        self.check_available()?;

        let mut state = self.lock();
        let stream_state = state.streams.entry(stream.to_owned()).or_default();
        if stream_state.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }

        let last_delivered = stream_state.last_id;
        stream_state.groups.insert(
            group.to_owned(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );

        Ok(GroupCreation::Created)
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Entry>, LogError> {
        let deadline = Instant::now() + block;

        loop {
            self.check_available()?;

            // Register for wakeups before looking, so an append in between isn't missed.
            let appended = self.appended.notified();

            let delivered = self.take_new(stream, group, consumer, count)?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn read_own_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        after: EntryId,
        count: usize,
    ) -> Result<Vec<Entry>, LogError> {
        self.check_available()?;

        let mut state = self.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let group_state = stream_state
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let mut replayed = Vec::new();
        for (id, delivery) in group_state.pending.iter_mut() {
            if replayed.len() >= count {
                break;
            }
            if *id <= after || delivery.consumer != consumer {
                continue;
            }
            if let Some(fields) = stream_state.entries.get(id) {
                delivery.redeliver_to(consumer);
                replayed.push(Entry::new(*id, fields.clone()));
            }
        }

        Ok(replayed)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        start: EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>, LogError> {
        self.check_available()?;

        let state = self.lock();
        let group_state = state
            .streams
            .get(stream)
            .and_then(|stream| stream.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;

        Ok(group_state
            .pending
            .range(start..)
            .filter(|(_, delivery)| delivery.delivered_at.elapsed() >= min_idle)
            .take(count)
            .map(|(id, delivery)| PendingEntry {
                id: *id,
                consumer: delivery.consumer.clone(),
                idle: delivery.delivered_at.elapsed(),
                deliveries: delivery.deliveries,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<Entry>, LogError> {
        self.check_available()?;

        let mut state = self.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let group_state = stream_state
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))?;

        let mut claimed = Vec::new();
        for id in ids {
            let Some(delivery) = group_state.pending.get_mut(id) else {
                continue;
            };
            if delivery.delivered_at.elapsed() < min_idle {
                continue;
            }
            if let Some(fields) = stream_state.entries.get(id) {
                delivery.redeliver_to(consumer);
                claimed.push(Entry::new(*id, fields.clone()));
            }
        }

        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, LogError> {
        self.check_available()?;

        let take_one = |left: usize| left.checked_sub(1);
        let failing = self
            .failing_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, take_one);
        if failing.is_ok() {
            let reason = format!("injected ack failure for {id}");
            return Err(LogError::Unavailable(reason));
        }

        let mut state = self.lock();
        let group_state = state
            .streams
            .get_mut(stream)
            .and_then(|stream| stream.groups.get_mut(group))
            .ok_or_else(|| no_group(stream, group))?;

        Ok(group_state.pending.remove(&id).is_some())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, LogError> {
        self.check_available()?;

        let state = self.lock();
        let group_state = state
            .streams
            .get(stream)
            .and_then(|stream| stream.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;

        Ok(group_state.pending.len() as u64)
    }
}
