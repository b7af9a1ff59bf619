//! Stateful per-key stream processing over a partitioned log. For each
//! assigned partition a [PartitionFlow] feeds record batches to keyed state
//! machines in log order, drives per-key timers in lock-step with the
//! batches, and arbitrates, batch by batch, the highest offset that is
//! safe to commit back to the broker. The broker client, wire codecs, and
//! persistent stores stay on the host side, injected through the
//! [flow::KeyStateOf] and [flow::SnapshotStore] seams.

pub use self::error::{Error, Result};

mod error;

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod flow;
pub mod journal;
pub mod message;
pub mod partition_flow;
pub mod timer;

#[cfg(test)]
mod test_utils;

pub use clock::{Clock, SystemClock};
pub use config::KeyFlowConfig;
pub use context::KeyContext;
pub use flow::{FoldFlow, KeyFlow, KeyState, KeyStateOf, SnapshotStore};
pub use journal::{JournalFold, KafkaSnapshot, SeqNr, SeqRange};
pub use message::{Offset, Record, Timestamp, TopicPartition, offset_to_commit};
pub use partition_flow::{PartitionFlow, PartitionKey};
pub use timer::{Timer, Timers};
