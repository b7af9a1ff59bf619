//! The partition flow is the coordination engine for one assigned
//! partition: it keeps a lazily-populated cache of per-key state, fans each
//! record batch out to its keys in parallel while preserving per-key order,
//! drives the per-key timer registries in lock-step with the batches, and
//! arbitrates the highest offset that is safe to commit from the keys'
//! hold offsets. No offset is ever returned for commit while any cached key
//! still holds work at or before it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::cache::LoadingCache;
use crate::clock::Clock;
use crate::context::KeyContext;
use crate::error::{Error, Result};
use crate::flow::{KeyFlow, KeyStateOf};
use crate::message::{Offset, Record, Timestamp, TopicPartition, offset_to_commit};
use crate::timer::Timers;

/// Everything one cached key owns: its flow, its timer registry, and the
/// context it vetoes commits and removes itself through. Never shared
/// across partitions.
pub struct PartitionKey {
    pub(crate) flow: tokio::sync::Mutex<Box<dyn KeyFlow>>,
    pub(crate) timers: Arc<Timers>,
    pub(crate) context: Arc<KeyContext>,
}

pub struct PartitionFlow {
    topic_partition: TopicPartition,
    clock: Arc<dyn Clock>,
    key_state_of: Arc<dyn KeyStateOf>,
    cache: LoadingCache<PartitionKey>,
    committed_offset: AtomicI64,
    current_timestamp: Mutex<Timestamp>,
}

impl PartitionFlow {
    /// Creates the flow for a freshly assigned partition and recovers the
    /// known keys before any batch is processed.
    pub async fn new(
        topic_partition: TopicPartition,
        assigned_at: Offset,
        key_state_of: Arc<dyn KeyStateOf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cache = LoadingCache::new(Some(Box::new(|entry: &Arc<PartitionKey>| {
            debug!(key = ?entry.context.key(), "Released partition key");
        })));
        let flow = Self {
            topic_partition,
            current_timestamp: Mutex::new(Timestamp::new(clock.now(), None, assigned_at)),
            clock,
            key_state_of,
            cache,
            committed_offset: AtomicI64::new(assigned_at),
        };
        flow.recover().await?;
        Ok(flow)
    }

    /// Materializes every key the state factory knows for this partition,
    /// sequentially. Recovery never moves the committed offset.
    async fn recover(&self) -> Result<()> {
        let created_at = Timestamp::new(
            self.clock.now(),
            None,
            self.committed_offset.load(Ordering::SeqCst),
        );
        let mut keys = self.key_state_of.all_keys(&self.topic_partition)?;
        let mut recovered = 0usize;
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| Error::Recovery(e.to_string()))?;
            Self::materialize(&self.cache, &self.key_state_of, key, created_at).await?;
            recovered += 1;
        }
        info!(
            topic_partition = %self.topic_partition,
            recovered,
            "Recovered partition keys"
        );
        Ok(())
    }

    /// Fetch-or-create the key's cache entry; concurrent callers for the
    /// same key share one construction.
    async fn materialize(
        cache: &LoadingCache<PartitionKey>,
        key_state_of: &Arc<dyn KeyStateOf>,
        key: Bytes,
        created_at: Timestamp,
    ) -> Result<Arc<PartitionKey>> {
        let weak = cache.downgrade();
        let key_state_of = key_state_of.clone();
        let builder_key = key.clone();
        cache
            .get_or_create(&key, move || async move {
                let remove_key = builder_key.clone();
                let context = Arc::new(KeyContext::new(
                    builder_key.clone(),
                    Box::new(move || weak.remove(&remove_key)),
                ));
                let state = key_state_of
                    .key_state(&builder_key, created_at, context.clone())
                    .await?;
                Ok(PartitionKey {
                    flow: tokio::sync::Mutex::new(state.flow),
                    timers: state.timers,
                    context,
                })
            })
            .await
    }

    /// Feeds one batch through the engine and returns the offset that just
    /// became safe to commit, if any. Batches must arrive in log order; the
    /// host never issues two `apply` calls concurrently.
    ///
    /// Dropping the returned future cancels all in-flight per-key work and
    /// leaves the committed offset and current timestamp untouched.
    pub async fn apply(&self, records: Vec<Record>) -> Result<Option<Offset>> {
        let mut current = *self.current_timestamp.lock().expect("failed to acquire lock");

        if !records.is_empty() {
            let batch_clock = self.clock.now();
            let (groups, last) = group_by_key(records);
            // A batch of only unkeyed records leaves the current timestamp
            // alone: there is no representative record to attribute it to.
            if let Some((last_offset, last_watermark)) = last {
                let mut tasks = JoinSet::new();
                for (key, key_records) in groups {
                    let cache = self.cache.clone();
                    let key_state_of = self.key_state_of.clone();
                    let head = &key_records[0];
                    let batch_at = Timestamp::new(batch_clock, head.timestamp, head.offset);
                    tasks.spawn(async move {
                        let partition_key =
                            Self::materialize(&cache, &key_state_of, key, batch_at).await?;
                        partition_key.timers.set(batch_at);
                        let mut flow = partition_key.flow.lock().await;
                        flow.apply(&key_records).await?;
                        partition_key.timers.on_processed(flow.as_mut()).await
                    });
                }
                while let Some(joined) = tasks.join_next().await {
                    joined.map_err(|e| Error::Flow(format!("key task failed: {e}")))??;
                }
                current = Timestamp::new(batch_clock, last_watermark, offset_to_commit(last_offset)?);
            }
        }

        current.clock = self.clock.now();
        let cached = self.cache.values().await?;
        let mut tasks = JoinSet::new();
        for partition_key in cached {
            let tick_at = current;
            tasks.spawn(async move {
                partition_key.timers.set(tick_at);
                let mut flow = partition_key.flow.lock().await;
                partition_key.timers.trigger(flow.as_mut()).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| Error::Timer(format!("timer task failed: {e}")))??;
        }

        let cached = self.cache.values().await?;
        let min_hold = cached
            .iter()
            .filter_map(|partition_key| partition_key.context.held())
            .min();
        let allowed = min_hold.unwrap_or(current.offset);
        let committed = self.committed_offset.load(Ordering::SeqCst);

        // Last mutation of shared state; no suspension point past here, so
        // a cancelled call never leaves a half-applied commit.
        *self.current_timestamp.lock().expect("failed to acquire lock") = current;
        if allowed > committed {
            self.committed_offset.store(allowed, Ordering::SeqCst);
            debug!(
                topic_partition = %self.topic_partition,
                from = committed,
                to = allowed,
                delta = allowed - committed,
                "Advancing committed offset"
            );
            Ok(Some(allowed))
        } else {
            Ok(None)
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// Highest offset handed back for commit so far; `assigned_at` until
    /// the first advance.
    pub fn committed_offset(&self) -> Offset {
        self.committed_offset.load(Ordering::SeqCst)
    }

    pub fn current_timestamp(&self) -> Timestamp {
        *self.current_timestamp.lock().expect("failed to acquire lock")
    }

    /// Releases the cache and every live key. The flow rejects further use.
    pub fn close(&self) {
        info!(topic_partition = %self.topic_partition, "Closing partition flow");
        self.cache.close();
    }
}

impl Drop for PartitionFlow {
    fn drop(&mut self) {
        // Keys are released even when the host tears the partition down
        // without an explicit close. Closing twice is a no-op.
        self.cache.close();
    }
}

/// Groups a batch by key, preserving input order within each key and
/// discarding unkeyed records. Also reports the offset and watermark of the
/// last keyed record, the batch's representative for the current timestamp.
#[allow(clippy::type_complexity)]
fn group_by_key(
    records: Vec<Record>,
) -> (
    Vec<(Bytes, Vec<Record>)>,
    Option<(Offset, Option<DateTime<Utc>>)>,
) {
    let mut groups: Vec<(Bytes, Vec<Record>)> = Vec::new();
    let mut index: HashMap<Bytes, usize> = HashMap::new();
    let mut last = None;
    for record in records {
        let Some(key) = record.key.clone() else {
            continue;
        };
        last = Some((record.offset, record.timestamp));
        let at = *index.entry(key.clone()).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[at].1.push(record);
    }
    (groups, last)
}
