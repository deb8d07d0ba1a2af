//! In-process store implementing the full [`Store`] contract.
//!
//! Used by the integration test suite so the whole pipeline (scheduler,
//! supervisors, mirror, registry) can run without a Redis server. Streams
//! keep monotone entry ids, groups keep a delivery cursor anchored where
//! the group was created, and pending entries track idle time and delivery
//! counts the way the real consumer groups do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::error::{DispatchError, Result};
use crate::store::{EntryId, Fields, LogRecord, PendingEntry, Store};

/// Granularity of the simulated blocking reads.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct StreamEntry {
    seq: u64,
    fields: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Highest sequence handed out through the group cursor.
    last_delivered: u64,
    pending: HashMap<u64, PendingState>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    last_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    hashes: HashMap<String, HashMap<String, String>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn format_entry_id(seq: u64) -> EntryId {
    format!("{seq}-0")
}

fn parse_seq(entry_id: &str) -> u64 {
    entry_id
        .split('-')
        .next()
        .and_then(|part| part.parse().ok())
        .unwrap_or(0)
}

fn record(entry: &StreamEntry) -> LogRecord {
    LogRecord {
        entry_id: format_entry_id(entry.seq),
        fields: entry.fields.clone(),
    }
}

impl Inner {
    fn append_entry(&mut self, stream: &str, fields: Fields) -> EntryId {
        let state = self.streams.entry(stream.to_string()).or_default();
        state.last_seq += 1;
        let seq = state.last_seq;
        state.entries.push(StreamEntry {
            seq,
            fields: fields.into_iter().collect(),
        });
        format_entry_id(seq)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId> {
        let mut inner = self.inner.lock().await;
        Ok(inner.append_entry(stream, fields))
    }

    async fn append_with_hash(
        &self,
        stream: &str,
        fields: Fields,
        hash_key: &str,
        hash_fields: Fields,
        index_key: &str,
        index_field: &str,
        index_value: &str,
    ) -> Result<EntryId> {
        let mut inner = self.inner.lock().await;
        let entry_id = inner.append_entry(stream, fields);
        inner
            .hashes
            .entry(hash_key.to_string())
            .or_default()
            .extend(hash_fields);
        inner
            .hashes
            .entry(index_key.to_string())
            .or_default()
            .insert(index_field.to_string(), index_value.to_string());
        Ok(entry_id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        let anchor = state.last_seq;
        state.groups.entry(group.to_string()).or_insert(GroupState {
            last_delivered: anchor,
            pending: HashMap::new(),
        });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<LogRecord>> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut inner = self.inner.lock().await;
                let state = inner.streams.entry(stream.to_string()).or_default();
                let Some(cursor) = state.groups.get(group).map(|g| g.last_delivered) else {
                    return Err(DispatchError::Internal(format!(
                        "no consumer group {group} on stream {stream}"
                    )));
                };
                let next = state.entries.iter().find(|e| e.seq > cursor).cloned();
                if let Some(entry) = next {
                    if let Some(group_state) = state.groups.get_mut(group) {
                        group_state.last_delivered = entry.seq;
                        group_state.pending.insert(
                            entry.seq,
                            PendingState {
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                                delivery_count: 1,
                            },
                        );
                    }
                    return Ok(Some(record(&entry)));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(&parse_seq(entry_id));
            }
        }
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let inner = self.inner.lock().await;
        let Some(group_state) = inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
        else {
            return Ok(Vec::new());
        };

        let mut entries: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .filter(|(_, p)| p.delivered_at.elapsed() >= min_idle)
            .map(|(seq, p)| PendingEntry {
                entry_id: format_entry_id(*seq),
                consumer: p.consumer.clone(),
                idle: p.delivered_at.elapsed(),
                delivery_count: p.delivery_count,
            })
            .collect();
        entries.sort_by_key(|e| parse_seq(&e.entry_id));
        entries.truncate(count);
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        entry_ids: &[EntryId],
    ) -> Result<Vec<LogRecord>> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let mut claimed = Vec::new();
        for entry_id in entry_ids {
            let seq = parse_seq(entry_id);
            let Some(group_state) = state.groups.get_mut(group) else {
                break;
            };
            let eligible = group_state
                .pending
                .get(&seq)
                .is_some_and(|p| p.delivered_at.elapsed() >= min_idle);
            if !eligible {
                continue;
            }
            if let Some(pending) = group_state.pending.get_mut(&seq) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = Instant::now();
                pending.delivery_count += 1;
            }
            if let Some(entry) = state.entries.iter().find(|e| e.seq == seq) {
                claimed.push(record(entry));
            }
        }
        Ok(claimed)
    }

    async fn entry(&self, stream: &str, entry_id: &str) -> Result<Option<LogRecord>> {
        let inner = self.inner.lock().await;
        let seq = parse_seq(entry_id);
        Ok(inner
            .streams
            .get(stream)
            .and_then(|s| s.entries.iter().find(|e| e.seq == seq))
            .map(record))
    }

    async fn read_stream(
        &self,
        stream: &str,
        after: &str,
        block: Duration,
    ) -> Result<Vec<LogRecord>> {
        let deadline = Instant::now() + block;
        let mut after_seq: Option<u64> = if after == "$" {
            None
        } else {
            Some(parse_seq(after))
        };
        loop {
            {
                let inner = self.inner.lock().await;
                let state = inner.streams.get(stream);
                let cursor = *after_seq
                    .get_or_insert_with(|| state.map(|s| s.last_seq).unwrap_or(0));
                if let Some(state) = state {
                    let found: Vec<LogRecord> = state
                        .entries
                        .iter()
                        .filter(|e| e.seq > cursor)
                        .take(64)
                        .map(record)
                        .collect();
                    if !found.is_empty() {
                        return Ok(found);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn latest_entry_id(&self, stream: &str) -> Result<EntryId> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(stream)
            .map(|s| s.last_seq)
            .filter(|seq| *seq > 0)
            .map(format_entry_id)
            .unwrap_or_else(|| "0-0".to_string()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_set_all(&self, key: &str, fields: Fields) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .extend(fields);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get(key)
            .is_some_and(|h| h.contains_key(field)))
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.hashes.remove(key);
        Ok(())
    }

    async fn hash_delete_field(&self, key: &str, field: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(hash) = inner.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }
}
