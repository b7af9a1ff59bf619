use std::time::Duration;

const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(60);

/// Persistence discipline for a fold-backed key flow.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFlowConfig {
    /// How often to persist accumulated state. `None` persists after every
    /// batch the key participates in.
    pub persist_interval: Option<Duration>,
    /// Remove the key from the cache once it has been idle (no records, no
    /// unpersisted work) for this long. `None` keeps keys cached until the
    /// partition flow is closed.
    pub idle_timeout: Option<Duration>,
}

impl Default for KeyFlowConfig {
    fn default() -> Self {
        Self {
            persist_interval: Some(DEFAULT_PERSIST_INTERVAL),
            idle_timeout: None,
        }
    }
}

impl KeyFlowConfig {
    /// Persist on every processed batch, never evict.
    pub fn eager() -> Self {
        Self {
            persist_interval: None,
            idle_timeout: None,
        }
    }
}
