//! Per-key timer registry. Timers are an explicit model driven by the
//! engine's current [Timestamp]: `set` advances the key's view of now from
//! batch heads and idle ticks, and `trigger` fires whatever became due. No
//! background scheduler is involved; a timer only fires when the partition
//! flow drives the registry.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::flow::KeyFlow;
use crate::message::{Offset, Timestamp};

/// A pending firing condition, matched against the current [Timestamp].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timer {
    /// Fires once the wall clock reaches the instant.
    Clock(DateTime<Utc>),
    /// Fires once the watermark reaches the instant. A key that never sees
    /// a watermark never fires these.
    Watermark(DateTime<Utc>),
    /// Fires once the partition has reached the offset.
    Offset(Offset),
}

impl Timer {
    fn is_due(&self, current: &Timestamp) -> bool {
        match self {
            Timer::Clock(at) => current.clock >= *at,
            Timer::Watermark(at) => current.watermark.is_some_and(|watermark| watermark >= *at),
            Timer::Offset(at) => current.offset >= *at,
        }
    }
}

struct TimerState {
    current: Timestamp,
    pending: Vec<Timer>,
}

/// Registry of pending timers for one key, shared between the engine and
/// the key's flow (which registers timers through it).
pub struct Timers {
    state: Mutex<TimerState>,
}

impl Timers {
    pub fn new(created_at: Timestamp) -> Self {
        Self {
            state: Mutex::new(TimerState {
                current: created_at,
                pending: Vec::new(),
            }),
        }
    }

    /// Registers a timer. Timers already due fire on the next `trigger`.
    pub fn register(&self, timer: Timer) {
        let mut state = self.state.lock().expect("failed to acquire lock");
        state.pending.push(timer);
    }

    /// The key's current view of now.
    pub fn current(&self) -> Timestamp {
        self.state.lock().expect("failed to acquire lock").current
    }

    /// Advances the key's view of now. Non-monotone calls (clock or offset
    /// regressing) are ignored; the watermark never regresses within an
    /// accepted advance.
    pub(crate) fn set(&self, timestamp: Timestamp) {
        let mut state = self.state.lock().expect("failed to acquire lock");
        let current = &mut state.current;
        if timestamp.clock < current.clock || timestamp.offset < current.offset {
            return;
        }
        current.clock = timestamp.clock;
        current.offset = timestamp.offset;
        current.watermark = match (current.watermark, timestamp.watermark) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => new.or(old),
        };
    }

    /// Notifies the key that a batch it participated in just finished;
    /// the flow snapshots or persists here.
    pub(crate) async fn on_processed(&self, flow: &mut dyn KeyFlow) -> Result<()> {
        flow.on_processed(self).await
    }

    /// Fires every pending timer that became due and, if any did, invokes
    /// the flow once with a synthetic empty batch. Fired timers are gone;
    /// recurring disciplines re-register from inside the flow.
    pub(crate) async fn trigger(&self, flow: &mut dyn KeyFlow) -> Result<()> {
        let fired = {
            let mut state = self.state.lock().expect("failed to acquire lock");
            let current = state.current;
            let before = state.pending.len();
            state.pending.retain(|timer| !timer.is_due(&current));
            before - state.pending.len()
        };
        if fired == 0 {
            return Ok(());
        }
        flow.apply(&[]).await
    }
}
