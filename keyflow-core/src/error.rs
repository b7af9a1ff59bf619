use thiserror::Error;

use crate::message::Offset;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the partition flow engine. `Clone` is required because
/// a single key-state build failure is delivered to every caller awaiting
/// the same cache slot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Key State Error - {0}")]
    KeyState(String),

    #[error("Flow Error - {0}")]
    Flow(String),

    #[error("Timer Error - {0}")]
    Timer(String),

    #[error("Journal Error - {0}")]
    Journal(String),

    #[error("Recovery Error - {0}")]
    Recovery(String),

    #[error("offset-to-commit overflows past offset {0}")]
    OffsetOverflow(Offset),

    #[error("cache is closed")]
    CacheClosed,
}
