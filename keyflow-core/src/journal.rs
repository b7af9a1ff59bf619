//! Dedup-and-fold of journal records into a per-key snapshot. The fold is
//! what recovery runs over a compacted snapshot topic: it keeps the latest
//! summary while dropping records that replay an already-covered offset or
//! a non-monotone sequence number. Duplicates are expected input here, not
//! errors.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::{Offset, Record};

/// Monotone per-key sequence number carried in record headers; independent
/// of partition offsets. Always positive.
pub type SeqNr = i64;

/// Inclusive range of sequence numbers covered by one journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    pub from: SeqNr,
    pub to: SeqNr,
}

impl SeqRange {
    pub fn new(from: SeqNr, to: SeqNr) -> Result<Self> {
        if from < 1 || to < from {
            return Err(Error::Journal(format!(
                "invalid sequence range [{from}, {to}]"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn single(seq_nr: SeqNr) -> Result<Self> {
        Self::new(seq_nr, seq_nr)
    }
}

/// Persisted summary of a key's journal at a point in time. Monotone in
/// `offset` and in the sequence number of `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KafkaSnapshot<V> {
    pub offset: Offset,
    pub value: V,
}

/// Sequence number a folded value answers dedup questions with. For a range
/// that is its upper bound: a record only advances the snapshot when it
/// carries sequence numbers past everything already covered.
pub trait HasSeqNr {
    fn seq_nr(&self) -> SeqNr;
}

impl HasSeqNr for SeqRange {
    fn seq_nr(&self) -> SeqNr {
        self.to
    }
}

impl HasSeqNr for SeqNr {
    fn seq_nr(&self) -> SeqNr {
        *self
    }
}

/// Folds records into `Option<KafkaSnapshot<V>>` given an extractor for the
/// record's sequence range and a projection into the snapshot value.
/// Records without a parseable range leave the snapshot unchanged;
/// extractor failures propagate.
pub struct JournalFold<E, P> {
    extract: E,
    project: P,
}

impl<V, E, P> JournalFold<E, P>
where
    V: HasSeqNr,
    E: Fn(&Record) -> Result<Option<SeqRange>>,
    P: Fn(SeqRange) -> V,
{
    pub fn new(extract: E, project: P) -> Self {
        Self { extract, project }
    }

    pub fn fold(
        &self,
        snapshot: Option<KafkaSnapshot<V>>,
        record: &Record,
    ) -> Result<Option<KafkaSnapshot<V>>> {
        let Some(range) = (self.extract)(record)? else {
            return Ok(snapshot);
        };

        let Some(prior) = snapshot else {
            return Ok(Some(KafkaSnapshot {
                offset: record.offset,
                value: (self.project)(range),
            }));
        };

        // Replays of an already-covered offset, and records whose sequence
        // numbers do not move past the snapshot, are no-ops.
        if record.offset <= prior.offset || range.seq_nr() <= prior.value.seq_nr() {
            return Ok(Some(prior));
        }

        Ok(Some(KafkaSnapshot {
            offset: record.offset,
            value: (self.project)(range),
        }))
    }

    pub fn fold_all<'a>(
        &self,
        snapshot: Option<KafkaSnapshot<V>>,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> Result<Option<KafkaSnapshot<V>>> {
        let mut snapshot = snapshot;
        for record in records {
            snapshot = self.fold(snapshot, record)?;
        }
        Ok(snapshot)
    }
}
