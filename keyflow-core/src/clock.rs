use chrono::{DateTime, Utc};

/// Source of "now" for the engine. Injected so tests can freeze time; the
/// engine never spawns background schedulers off it.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
