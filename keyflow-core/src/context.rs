//! Per-key handle handed to user state at construction. The hold offset is
//! the key's veto over commit arbitration: while set, the partition flow
//! will not commit past it. The removal hook lets a key retire itself from
//! the cache; it captures only a weak handle to the cache, so a live entry
//! never keeps its own cache alive.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;

use crate::error::Result;
use crate::message::Offset;

/// Sentinel for "no hold"; live offsets are never negative.
const NO_HOLD: i64 = -1;

type RemoveFn = Box<dyn Fn() -> Result<()> + Send + Sync>;

pub struct KeyContext {
    key: Bytes,
    hold: AtomicI64,
    remove: RemoveFn,
}

impl KeyContext {
    pub(crate) fn new(key: Bytes, remove: RemoveFn) -> Self {
        Self {
            key,
            hold: AtomicI64::new(NO_HOLD),
            remove,
        }
    }

    /// Key this context belongs to.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Pin the commit watermark: the smallest offset whose processing is
    /// still outstanding for this key.
    pub fn hold(&self, offset: Offset) {
        debug_assert!(offset >= 0, "hold offset must not be negative");
        self.hold.store(offset, Ordering::SeqCst);
    }

    /// Clear the hold; the key no longer blocks commits.
    pub fn release(&self) {
        self.hold.store(NO_HOLD, Ordering::SeqCst);
    }

    /// Current hold, if any.
    pub fn held(&self) -> Option<Offset> {
        match self.hold.load(Ordering::SeqCst) {
            NO_HOLD => None,
            offset => Some(offset),
        }
    }

    /// Drop this key's entry from the partition cache and release its
    /// resources. Idempotent; a no-op once the cache itself is gone.
    pub fn remove_self(&self) -> Result<()> {
        (self.remove)()
    }
}

impl fmt::Debug for KeyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyContext")
            .field("key", &self.key)
            .field("hold", &self.held())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> KeyContext {
        KeyContext::new(Bytes::from_static(b"k"), Box::new(|| Ok(())))
    }

    #[test]
    fn test_hold_release() {
        let ctx = context();
        assert_eq!(ctx.held(), None);

        ctx.hold(42);
        assert_eq!(ctx.held(), Some(42));

        ctx.release();
        assert_eq!(ctx.held(), None);
    }

    #[test]
    fn test_hold_zero_is_a_hold() {
        let ctx = context();
        ctx.hold(0);
        assert_eq!(ctx.held(), Some(0));
    }
}
