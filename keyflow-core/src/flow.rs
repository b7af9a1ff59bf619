//! Collaborator seams between the engine and user state: [KeyFlow] is the
//! user fold a batch of one key's records is applied to, [KeyStateOf] is
//! the factory producing a key's `{flow, timers}` pair and enumerating the
//! keys to recover for a partition. [FoldFlow] is the canonical flow built
//! on those seams: it folds records into state, pins the commit watermark
//! while state is unpersisted, persists eagerly or on a periodic timer, and
//! can retire idle keys from the cache.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tracing::debug;

use crate::config::KeyFlowConfig;
use crate::context::KeyContext;
use crate::error::Result;
use crate::journal::KafkaSnapshot;
use crate::message::{Offset, Record, Timestamp, TopicPartition, offset_to_commit};
use crate::timer::{Timer, Timers};

/// User-supplied fold over one key's records. `records` is non-empty and in
/// strictly increasing offset order when delivered for a batch; it is empty
/// exactly when a timer fired for this key.
#[async_trait]
pub trait KeyFlow: Send + 'static {
    async fn apply(&mut self, records: &[Record]) -> Result<()>;

    /// Called once after each batch this key participated in; the place to
    /// snapshot or persist accumulated state.
    async fn on_processed(&mut self, _timers: &Timers) -> Result<()> {
        Ok(())
    }
}

/// A key's flow together with the timer registry it registers into.
pub struct KeyState {
    pub flow: Box<dyn KeyFlow>,
    pub timers: Arc<Timers>,
}

/// Factory for per-key state. `key_state` may perform I/O (loading a
/// snapshot, replaying a journal); `all_keys` enumerates the keys recovery
/// materializes for a freshly assigned partition.
#[async_trait]
pub trait KeyStateOf: Send + Sync + 'static {
    async fn key_state(
        &self,
        key: &Bytes,
        created_at: Timestamp,
        context: Arc<KeyContext>,
    ) -> Result<KeyState>;

    /// Lazy, finite enumeration; iteration order is irrelevant. Drivable
    /// from a database cursor or an in-memory list.
    fn all_keys(&self, topic_partition: &TopicPartition) -> Result<BoxStream<'static, Result<Bytes>>>;
}

/// Persistence seam for [FoldFlow] snapshots.
#[async_trait]
pub trait SnapshotStore<S>: Send + Sync + 'static {
    async fn persist(&self, key: &Bytes, snapshot: &KafkaSnapshot<S>) -> Result<()>;
}

type FoldFn<S> = Box<dyn FnMut(&mut S, &Record) -> Result<()> + Send>;

/// Fold-backed key flow. While any folded record is unpersisted the flow
/// holds that record's offset through its [KeyContext], so the partition
/// never commits past work that would be lost on a crash; persisting
/// releases the hold.
pub struct FoldFlow<S> {
    key: Bytes,
    context: Arc<KeyContext>,
    timers: Arc<Timers>,
    store: Arc<dyn SnapshotStore<S>>,
    fold: FoldFn<S>,
    state: S,
    config: KeyFlowConfig,
    /// First unpersisted offset; mirrors the context hold.
    pending_since: Option<Offset>,
    /// Offset of the last folded record.
    last_offset: Option<Offset>,
    /// Wall clock of the last non-empty batch.
    last_batch_at: DateTime<Utc>,
    next_persist_at: Option<DateTime<Utc>>,
    next_idle_check_at: Option<DateTime<Utc>>,
}

impl<S: Clone + Send + 'static> FoldFlow<S> {
    pub fn new(
        state: S,
        fold: FoldFn<S>,
        store: Arc<dyn SnapshotStore<S>>,
        config: KeyFlowConfig,
        context: Arc<KeyContext>,
        timers: Arc<Timers>,
    ) -> Self {
        let now = timers.current().clock;
        let next_persist_at = config.persist_interval.map(|interval| {
            let at = now + interval;
            timers.register(Timer::Clock(at));
            at
        });
        let next_idle_check_at = config.idle_timeout.map(|idle| {
            let at = now + idle;
            timers.register(Timer::Clock(at));
            at
        });
        Self {
            key: context.key().clone(),
            context,
            timers,
            store,
            fold,
            state,
            config,
            pending_since: None,
            last_offset: None,
            last_batch_at: now,
            next_persist_at,
            next_idle_check_at,
        }
    }

    /// Assembles a [KeyState] around a fresh timer registry.
    pub fn key_state(
        state: S,
        fold: FoldFn<S>,
        store: Arc<dyn SnapshotStore<S>>,
        config: KeyFlowConfig,
        context: Arc<KeyContext>,
        created_at: Timestamp,
    ) -> KeyState {
        let timers = Arc::new(Timers::new(created_at));
        let flow = FoldFlow::new(state, fold, store, config, context, timers.clone());
        KeyState {
            flow: Box::new(flow),
            timers,
        }
    }

    async fn persist(&mut self) -> Result<()> {
        if self.pending_since.is_none() {
            return Ok(());
        }
        let Some(last_offset) = self.last_offset else {
            return Ok(());
        };
        let snapshot = KafkaSnapshot {
            offset: offset_to_commit(last_offset)?,
            value: self.state.clone(),
        };
        self.store.persist(&self.key, &snapshot).await?;
        self.context.release();
        self.pending_since = None;
        debug!(key = ?self.key, offset = snapshot.offset, "Persisted key snapshot");
        Ok(())
    }

    async fn on_timer(&mut self) -> Result<()> {
        let now = self.timers.current().clock;

        if let (Some(interval), Some(due)) = (self.config.persist_interval, self.next_persist_at)
            && now >= due
        {
            self.persist().await?;
            let next = now + interval;
            self.timers.register(Timer::Clock(next));
            self.next_persist_at = Some(next);
        }

        if let (Some(idle), Some(due)) = (self.config.idle_timeout, self.next_idle_check_at)
            && now >= due
        {
            if self.pending_since.is_none() && now >= self.last_batch_at + idle {
                debug!(key = ?self.key, "Removing idle key");
                self.context.remove_self()?;
                self.next_idle_check_at = None;
                return Ok(());
            }
            let next = now + idle;
            self.timers.register(Timer::Clock(next));
            self.next_idle_check_at = Some(next);
        }

        Ok(())
    }
}

#[async_trait]
impl<S: Clone + Send + 'static> KeyFlow for FoldFlow<S> {
    async fn apply(&mut self, records: &[Record]) -> Result<()> {
        let Some(head) = records.first() else {
            return self.on_timer().await;
        };
        if self.pending_since.is_none() {
            self.context.hold(head.offset);
            self.pending_since = Some(head.offset);
        }
        for record in records {
            (self.fold)(&mut self.state, record)?;
            self.last_offset = Some(record.offset);
        }
        self.last_batch_at = self.timers.current().clock;
        Ok(())
    }

    async fn on_processed(&mut self, _timers: &Timers) -> Result<()> {
        // With a persist interval the periodic timer owns persistence;
        // without one every processed batch is persisted right away.
        if self.config.persist_interval.is_none() {
            self.persist().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::test_utils::InMemorySnapshotStore;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(offset: Offset) -> Record {
        Record {
            key: Some(Bytes::from_static(b"k")),
            offset,
            ..Default::default()
        }
    }

    struct Fixture {
        context: Arc<KeyContext>,
        timers: Arc<Timers>,
        store: Arc<InMemorySnapshotStore<Vec<Offset>>>,
    }

    fn fold_flow(config: KeyFlowConfig) -> (FoldFlow<Vec<Offset>>, Fixture) {
        let context = Arc::new(KeyContext::new(
            Bytes::from_static(b"k"),
            Box::new(|| Ok(())),
        ));
        let timers = Arc::new(Timers::new(Timestamp::new(at(0), None, 0)));
        let store = Arc::new(InMemorySnapshotStore::default());
        let flow = FoldFlow::new(
            Vec::new(),
            Box::new(|state: &mut Vec<Offset>, record: &Record| {
                state.push(record.offset);
                Ok(())
            }),
            store.clone(),
            config,
            context.clone(),
            timers.clone(),
        );
        (flow, Fixture {
            context,
            timers,
            store,
        })
    }

    #[tokio::test]
    async fn test_eager_flow_holds_then_persists_on_processed() {
        let (mut flow, fx) = fold_flow(KeyFlowConfig::eager());

        flow.apply(&[record(10), record(11)]).await.unwrap();
        assert_eq!(fx.context.held(), Some(10), "head offset held while dirty");

        fx.timers.on_processed(&mut flow).await.unwrap();
        assert_eq!(fx.context.held(), None, "persisting releases the hold");

        let snapshot = fx.store.get(&Bytes::from_static(b"k")).unwrap();
        assert_eq!(snapshot.offset, 12);
        assert_eq!(snapshot.value, vec![10, 11]);
    }

    #[tokio::test]
    async fn test_periodic_flow_keeps_hold_until_interval_elapses() {
        let config = KeyFlowConfig {
            persist_interval: Some(Duration::from_secs(60)),
            idle_timeout: None,
        };
        let (mut flow, fx) = fold_flow(config);

        fx.timers.set(Timestamp::new(at(10), None, 5));
        flow.apply(&[record(5)]).await.unwrap();
        fx.timers.on_processed(&mut flow).await.unwrap();
        assert_eq!(fx.context.held(), Some(5), "hold survives until persist");
        assert!(fx.store.get(&Bytes::from_static(b"k")).is_none());

        // Advance past the interval; the registered timer fires the flow.
        fx.timers.set(Timestamp::new(at(61), None, 6));
        fx.timers.trigger(&mut flow).await.unwrap();
        assert_eq!(fx.context.held(), None);
        let snapshot = fx.store.get(&Bytes::from_static(b"k")).unwrap();
        assert_eq!(snapshot.offset, 6);

        // The discipline re-armed itself for the next interval.
        fx.timers.set(Timestamp::new(at(125), None, 9));
        flow.apply(&[record(9)]).await.unwrap();
        fx.timers.trigger(&mut flow).await.unwrap();
        assert_eq!(fx.store.get(&Bytes::from_static(b"k")).unwrap().offset, 10);
    }

    #[tokio::test]
    async fn test_idle_key_removes_itself() {
        let removed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let context = {
            let removed = removed.clone();
            Arc::new(KeyContext::new(
                Bytes::from_static(b"k"),
                Box::new(move || {
                    removed.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }),
            ))
        };
        let timers = Arc::new(Timers::new(Timestamp::new(at(0), None, 0)));
        let store: Arc<InMemorySnapshotStore<Vec<Offset>>> =
            Arc::new(InMemorySnapshotStore::default());
        let mut flow = FoldFlow::new(
            Vec::new(),
            Box::new(|state: &mut Vec<Offset>, record: &Record| {
                state.push(record.offset);
                Ok(())
            }),
            store,
            KeyFlowConfig {
                persist_interval: None,
                idle_timeout: Some(Duration::from_secs(30)),
            },
            context.clone(),
            timers.clone(),
        );

        // Active key with a pending hold is never evicted.
        timers.set(Timestamp::new(at(10), None, 1));
        flow.apply(&[record(1)]).await.unwrap();
        timers.set(Timestamp::new(at(45), None, 2));
        timers.trigger(&mut flow).await.unwrap();
        assert!(!removed.load(std::sync::atomic::Ordering::SeqCst));

        // Persisted and quiet past the timeout: the key retires itself.
        timers.on_processed(&mut flow).await.unwrap();
        timers.set(Timestamp::new(at(120), None, 3));
        timers.trigger(&mut flow).await.unwrap();
        assert!(removed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_fold_failure_propagates() {
        let context = Arc::new(KeyContext::new(
            Bytes::from_static(b"k"),
            Box::new(|| Ok(())),
        ));
        let timers = Arc::new(Timers::new(Timestamp::new(at(0), None, 0)));
        let store: Arc<InMemorySnapshotStore<Vec<Offset>>> =
            Arc::new(InMemorySnapshotStore::default());
        let mut flow = FoldFlow::new(
            Vec::new(),
            Box::new(|_: &mut Vec<Offset>, _: &Record| {
                Err(crate::error::Error::Flow("bad record".into()))
            }),
            store,
            KeyFlowConfig::eager(),
            context,
            timers,
        );

        let err = flow.apply(&[record(1)]).await.unwrap_err();
        assert_eq!(err, crate::error::Error::Flow("bad record".into()));
    }
}
