pub mod config;
pub mod consumer;
pub mod error;
pub mod group;
pub mod health;
pub mod lifecycle;
pub mod log;
pub mod memory;
pub mod metrics;
pub mod producer;
pub mod redis_log;
pub mod sink;

pub use consumer::{BatchOutcome, ConsumerWorker, WorkerSettings};
pub use group::ensure_group;
pub use log::{Entry, EntryId, LogClient, LogError};
pub use memory::MemoryLog;
pub use producer::Producer;
pub use redis_log::RedisLog;
pub use sink::{FileSink, LineSink};
