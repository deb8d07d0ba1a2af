//! Backing-store port.
//!
//! The dispatcher coordinates exclusively through one store offering ordered
//! append-only streams with consumer groups plus hash maps. [`RedisStore`]
//! is the production implementation; [`MemoryStore`] implements the same
//! contract in-process for the integration test suite.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Stream carrying enqueued jobs.
pub const JOB_STREAM: &str = "jobs:stream";
/// Stream carrying lifecycle events.
pub const EVENT_STREAM: &str = "jobs:events";
/// Consumer group competing over the job stream.
pub const WORKER_GROUP: &str = "workers";
/// Hash holding one `SupervisorStatus` JSON value per consumer.
pub const SUPERVISOR_STATUS_KEY: &str = "supervisors:status";
/// Hash mapping job id to its current state, backing jobs-by-state listings.
pub const JOB_INDEX_KEY: &str = "jobs:index";

/// Key of the metadata hash for one job.
pub fn job_key(job_id: &str) -> String {
    format!("job:{job_id}")
}

/// Position of an entry within a stream; encodes append order.
pub type EntryId = String;

/// Flat field list as carried by stream entries and hashes.
pub type Fields = Vec<(String, String)>;

/// One entry read from a stream.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub entry_id: EntryId,
    pub fields: HashMap<String, String>,
}

impl LogRecord {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Summary of an entry delivered to a consumer but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub entry_id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Ordered-stream + hash store behind the whole pipeline.
///
/// Streams provide at-least-once, exclusive-per-entry delivery through
/// consumer groups; hashes hold job metadata and supervisor statuses.
/// Multi-key writes that must not be partially observable go through
/// [`Store::append_with_hash`].
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn ping(&self) -> Result<()>;

    /// Append an entry to a stream, returning its id.
    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId>;

    /// Append a stream entry and write a metadata hash plus one index field
    /// in a single atomic batch. Either every write lands or none does.
    async fn append_with_hash(
        &self,
        stream: &str,
        fields: Fields,
        hash_key: &str,
        hash_fields: Fields,
        index_key: &str,
        index_field: &str,
        index_value: &str,
    ) -> Result<EntryId>;

    /// Create a consumer group anchored at new messages only. A group that
    /// already exists is not an error.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read one not-yet-delivered entry on behalf of `consumer`, blocking up
    /// to `block`. `None` means the block timed out with nothing to deliver.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<LogRecord>>;

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()>;

    /// Pending entries of the group idle at least `min_idle`, oldest first,
    /// at most `count`.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Transfer ownership of pending entries to `consumer`, returning the
    /// claimed records. Entries no longer pending (or younger than
    /// `min_idle`) are silently skipped.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        entry_ids: &[EntryId],
    ) -> Result<Vec<LogRecord>>;

    /// Fetch a single entry by id without affecting group state.
    async fn entry(&self, stream: &str, entry_id: &str) -> Result<Option<LogRecord>>;

    /// Read entries appended after `after` outside of any group, blocking up
    /// to `block` when the stream is caught up.
    async fn read_stream(&self, stream: &str, after: &str, block: Duration)
        -> Result<Vec<LogRecord>>;

    /// Id of the newest entry, or `"0-0"` for an empty stream.
    async fn latest_entry_id(&self, stream: &str) -> Result<EntryId>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hash_set_all(&self, key: &str, fields: Fields) -> Result<()>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool>;
    async fn delete_key(&self, key: &str) -> Result<()>;
    async fn hash_delete_field(&self, key: &str, field: &str) -> Result<()>;
}
