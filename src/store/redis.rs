//! Redis-backed store.
//!
//! Streams map onto Redis streams (XADD / XREADGROUP / XACK / XPENDING /
//! XCLAIM), hashes onto Redis hashes, and the atomic enqueue batch onto a
//! MULTI/EXEC pipeline. The connection manager reconnects on its own, so
//! loop-level callers only see transient command errors.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client};

use crate::error::Result;
use crate::store::{EntryId, Fields, LogRecord, PendingEntry, Store};

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to the store at `addr` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = Client::open(addr)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    fn record_from_stream_id(id: StreamId) -> LogRecord {
        let mut fields = HashMap::with_capacity(id.map.len());
        for (name, value) in id.map {
            if let Ok(text) = redis::from_redis_value::<String>(&value) {
                fields.insert(name, text);
            }
        }
        LogRecord {
            entry_id: id.id,
            fields,
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut con = self.manager.clone();
        redis::cmd("PING").query_async::<_, String>(&mut con).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId> {
        let mut con = self.manager.clone();
        let entry_id: String = con.xadd(stream, "*", &fields).await?;
        Ok(entry_id)
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
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();

        {
            let cmd = pipe.cmd("XADD").arg(stream).arg("*");
            for (name, value) in &fields {
                cmd.arg(name).arg(value);
            }
        }
        {
            let cmd = pipe.cmd("HSET").arg(hash_key);
            for (name, value) in &hash_fields {
                cmd.arg(name).arg(value);
            }
            cmd.ignore();
        }
        pipe.cmd("HSET")
            .arg(index_key)
            .arg(index_field)
            .arg(index_value)
            .ignore();

        let (entry_id,): (String,) = pipe.query_async(&mut con).await?;
        Ok(entry_id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let created: std::result::Result<(), redis::RedisError> =
            con.xgroup_create_mkstream(stream, group, "$").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<LogRecord>> {
        let mut con = self.manager.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(block.as_millis() as usize);
        let reply: Option<StreamReadReply> =
            con.xread_options(&[stream], &[">"], &options).await?;

        let Some(reply) = reply else {
            return Ok(None);
        };
        let record = reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .next()
            .map(Self::record_from_stream_id);
        Ok(record)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: u64 = con.xack(stream, group, &[entry_id]).await?;
        Ok(())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut con = self.manager.clone();
        let reply: StreamPendingCountReply = con
            .xpending_count(stream, group, "-", "+", count as u64)
            .await?;

        let entries = reply
            .ids
            .into_iter()
            .filter(|id| id.last_delivered_ms as u128 >= min_idle.as_millis())
            .map(|id| PendingEntry {
                entry_id: id.id,
                consumer: id.consumer,
                idle: Duration::from_millis(id.last_delivered_ms as u64),
                delivery_count: id.times_delivered as u64,
            })
            .collect();
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
        if entry_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut con = self.manager.clone();
        let reply: StreamClaimReply = con
            .xclaim(
                stream,
                group,
                consumer,
                min_idle.as_millis() as usize,
                entry_ids,
            )
            .await?;
        Ok(reply
            .ids
            .into_iter()
            .map(Self::record_from_stream_id)
            .collect())
    }

    async fn entry(&self, stream: &str, entry_id: &str) -> Result<Option<LogRecord>> {
        let mut con = self.manager.clone();
        let reply: StreamRangeReply = con.xrange(stream, entry_id, entry_id).await?;
        Ok(reply.ids.into_iter().next().map(Self::record_from_stream_id))
    }

    async fn read_stream(
        &self,
        stream: &str,
        after: &str,
        block: Duration,
    ) -> Result<Vec<LogRecord>> {
        let mut con = self.manager.clone();
        let options = StreamReadOptions::default()
            .count(64)
            .block(block.as_millis() as usize);
        let reply: Option<StreamReadReply> =
            con.xread_options(&[stream], &[after], &options).await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(Self::record_from_stream_id)
            .collect())
    }

    async fn latest_entry_id(&self, stream: &str) -> Result<EntryId> {
        let mut con = self.manager.clone();
        let reply: StreamRangeReply = con.xrevrange_count(stream, "+", "-", 1).await?;
        Ok(reply
            .ids
            .into_iter()
            .next()
            .map(|id| id.id)
            .unwrap_or_else(|| "0-0".to_string()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_set_all(&self, key: &str, fields: Fields) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        let _: () = con.hset_multiple(key, &fields).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut con = self.manager.clone();
        let value: Option<String> = con.hget(key, field).await?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut con = self.manager.clone();
        let map: HashMap<String, String> = con.hgetall(key).await?;
        Ok(map)
    }

    async fn hash_exists(&self, key: &str, field: &str) -> Result<bool> {
        let mut con = self.manager.clone();
        let exists: bool = con.hexists(key, field).await?;
        Ok(exists)
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: u64 = con.del(key).await?;
        Ok(())
    }

    async fn hash_delete_field(&self, key: &str, field: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: u64 = con.hdel(key, field).await?;
        Ok(())
    }
}
