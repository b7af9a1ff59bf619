//! Record is the unit read from one partition of the log and passed through
//! the partition flow until its offset is safe to commit. Alongside it lives
//! [Timestamp], the `(clock, watermark, offset)` triple the engine threads
//! through batch processing and timer ticks.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Position within a partition. Monotone, never negative for a live record;
/// `-1` is reserved as the "absent" sentinel in atomics.
pub type Offset = i64;

/// The offset the consumer resumes from: one past a processed record.
pub fn offset_to_commit(offset: Offset) -> Result<Offset> {
    offset.checked_add(1).ok_or(Error::OffsetOverflow(offset))
}

/// A totally-ordered shard of a log topic; the unit of assignment.
#[derive(Debug, Clone, Hash, Serialize, Deserialize, Eq, PartialEq)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// One consumed record. Records without a key are legal input; the engine
/// skips them when grouping a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// key of the record, absent for unkeyed records
    pub key: Option<Bytes>,
    /// actual payload of the record
    pub value: Bytes,
    /// headers of the record
    pub headers: HashMap<String, String>,
    /// offset the record was read at
    pub offset: Offset,
    /// broker-assigned event time, absent when the record carried none
    pub timestamp: Option<DateTime<Utc>>,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            key: None,
            value: Bytes::new(),
            headers: HashMap::new(),
            offset: 0,
            timestamp: None,
        }
    }
}

/// The triple passed through the pipeline: wall clock of the driving batch
/// or tick, the watermark of the record that produced it, and the offset the
/// partition has reached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamp {
    pub clock: DateTime<Utc>,
    pub watermark: Option<DateTime<Utc>>,
    pub offset: Offset,
}

impl Timestamp {
    pub fn new(clock: DateTime<Utc>, watermark: Option<DateTime<Utc>>, offset: Offset) -> Self {
        Self {
            clock,
            watermark,
            offset,
        }
    }
}
