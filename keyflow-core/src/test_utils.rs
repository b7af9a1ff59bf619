//! In-memory collaborator implementations shared by the unit tests: a
//! freezable clock, a snapshot store backed by a map, and a key state
//! factory producing fold flows that collect the offsets they saw.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::clock::Clock;
use crate::config::KeyFlowConfig;
use crate::context::KeyContext;
use crate::error::Result;
use crate::flow::{FoldFlow, KeyState, KeyStateOf, SnapshotStore};
use crate::journal::KafkaSnapshot;
use crate::message::{Offset, Record, Timestamp, TopicPartition};

pub(crate) fn keyed_record(key: &'static str, offset: Offset) -> Record {
    Record {
        key: Some(Bytes::from_static(key.as_bytes())),
        offset,
        ..Default::default()
    }
}

/// Wall clock that only moves when told to.
pub(crate) struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("failed to acquire lock");
        *now = *now + by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("failed to acquire lock")
    }
}

/// Snapshot store backed by a map; the latest persisted snapshot per key.
pub(crate) struct InMemorySnapshotStore<S> {
    snapshots: Mutex<HashMap<Bytes, KafkaSnapshot<S>>>,
}

impl<S> Default for InMemorySnapshotStore<S> {
    fn default() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: Clone> InMemorySnapshotStore<S> {
    pub(crate) fn get(&self, key: &Bytes) -> Option<KafkaSnapshot<S>> {
        self.snapshots
            .lock()
            .expect("failed to acquire lock")
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> SnapshotStore<S> for InMemorySnapshotStore<S> {
    async fn persist(&self, key: &Bytes, snapshot: &KafkaSnapshot<S>) -> Result<()> {
        self.snapshots
            .lock()
            .expect("failed to acquire lock")
            .insert(key.clone(), snapshot.clone());
        Ok(())
    }
}

/// Key state factory producing fold flows that collect record offsets into
/// a `Vec<Offset>`, persisted to an [InMemorySnapshotStore].
pub(crate) struct InMemoryKeyStateOf {
    store: Arc<InMemorySnapshotStore<Vec<Offset>>>,
    config: KeyFlowConfig,
    key_configs: HashMap<Bytes, KeyFlowConfig>,
    recovered_keys: Vec<Bytes>,
}

impl InMemoryKeyStateOf {
    pub(crate) fn new(store: Arc<InMemorySnapshotStore<Vec<Offset>>>, config: KeyFlowConfig) -> Self {
        Self {
            store,
            config,
            key_configs: HashMap::new(),
            recovered_keys: Vec::new(),
        }
    }

    /// Overrides the persistence discipline for one key.
    pub(crate) fn with_key_config(mut self, key: Bytes, config: KeyFlowConfig) -> Self {
        self.key_configs.insert(key, config);
        self
    }

    /// Keys `all_keys` enumerates for recovery.
    pub(crate) fn with_recovered_keys(mut self, keys: Vec<Bytes>) -> Self {
        self.recovered_keys = keys;
        self
    }
}

#[async_trait]
impl KeyStateOf for InMemoryKeyStateOf {
    async fn key_state(
        &self,
        key: &Bytes,
        created_at: Timestamp,
        context: Arc<KeyContext>,
    ) -> Result<KeyState> {
        let config = self
            .key_configs
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.config.clone());
        Ok(FoldFlow::key_state(
            Vec::new(),
            Box::new(|state: &mut Vec<Offset>, record: &Record| {
                state.push(record.offset);
                Ok(())
            }),
            self.store.clone(),
            config,
            context,
            created_at,
        ))
    }

    fn all_keys(
        &self,
        _topic_partition: &TopicPartition,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let keys: Vec<Result<Bytes>> = self.recovered_keys.iter().cloned().map(Ok).collect();
        Ok(Box::pin(tokio_stream::iter(keys)))
    }
}
