//! Concurrent key → entry map with at-most-one construction per key. All
//! callers racing on an absent key await the same build; a build failure is
//! delivered to every waiter and clears the slot so the next batch can
//! retry. Removal is idempotent and runs the entry's release hook; removing
//! a key whose build is still in flight does not abort the build, and the
//! just-built entry is released immediately after it is published to the
//! waiters. An entry constructed after a removal is a new generation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};

type ReleaseFn<V> = Box<dyn Fn(&Arc<V>) + Send + Sync>;

/// `None` until the build publishes; then the build outcome.
type LoadResult<V> = Option<Result<Arc<V>>>;

enum Slot<V> {
    Loading {
        rx: watch::Receiver<LoadResult<V>>,
        generation: u64,
    },
    Ready {
        value: Arc<V>,
    },
}

struct State<V> {
    slots: HashMap<Bytes, Slot<V>>,
    closed: bool,
    next_generation: u64,
}

struct Inner<V> {
    state: Mutex<State<V>>,
    on_release: Option<ReleaseFn<V>>,
}

impl<V> Inner<V> {
    fn release(&self, value: &Arc<V>) {
        if let Some(on_release) = &self.on_release {
            on_release(value);
        }
    }

    fn remove(&self, key: &Bytes) -> Result<()> {
        let removed = {
            let mut state = self.state.lock().expect("failed to acquire lock");
            if state.closed {
                return Err(Error::CacheClosed);
            }
            state.slots.remove(key)
        };
        match removed {
            Some(Slot::Ready { value }) => self.release(&value),
            // A loading slot is dropped from the map without running the
            // hook; the builder observes the missing slot on publication
            // and releases the freshly built entry itself.
            Some(Slot::Loading { .. }) | None => {}
        }
        Ok(())
    }
}

/// Cheap to clone; all clones share the same slots.
pub struct LoadingCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for LoadingCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Weak handle used by per-key removal hooks so that an entry never keeps
/// its own cache alive. Removal through a dead cache is a no-op.
pub struct WeakLoadingCache<V> {
    inner: Weak<Inner<V>>,
}

impl<V> WeakLoadingCache<V> {
    pub fn remove(&self, key: &Bytes) -> Result<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.remove(key),
            None => Ok(()),
        }
    }
}

/// Clears a loading slot if its build never publishes (the caller was
/// cancelled mid-build), so waiters retry instead of hanging.
struct LoadGuard<'a, V> {
    inner: &'a Inner<V>,
    key: &'a Bytes,
    generation: u64,
    armed: bool,
}

impl<V> Drop for LoadGuard<'_, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.lock().expect("failed to acquire lock");
        if let Some(Slot::Loading { generation, .. }) = state.slots.get(self.key)
            && *generation == self.generation
        {
            state.slots.remove(self.key);
        }
    }
}

enum Access<V> {
    Hit(Arc<V>),
    Wait(watch::Receiver<LoadResult<V>>),
    Build {
        tx: watch::Sender<LoadResult<V>>,
        generation: u64,
    },
}

impl<V: Send + Sync + 'static> LoadingCache<V> {
    pub fn new(on_release: Option<ReleaseFn<V>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    slots: HashMap::new(),
                    closed: false,
                    next_generation: 0,
                }),
                on_release,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakLoadingCache<V> {
        WeakLoadingCache {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns the entry for `key`, running `build` if the slot is absent.
    /// Concurrent callers for the same key observe the same construction and
    /// the same failure.
    pub async fn get_or_create<F, Fut>(&self, key: &Bytes, build: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut build = Some(build);
        loop {
            let access = {
                let mut state = self.inner.state.lock().expect("failed to acquire lock");
                if state.closed {
                    return Err(Error::CacheClosed);
                }
                match state.slots.get(key) {
                    Some(Slot::Ready { value }) => Access::Hit(value.clone()),
                    Some(Slot::Loading { rx, .. }) => Access::Wait(rx.clone()),
                    None => {
                        let generation = state.next_generation;
                        state.next_generation += 1;
                        let (tx, rx) = watch::channel(None);
                        state
                            .slots
                            .insert(key.clone(), Slot::Loading { rx, generation });
                        Access::Build { tx, generation }
                    }
                }
            };

            match access {
                Access::Hit(value) => return Ok(value),
                Access::Wait(mut rx) => {
                    loop {
                        if let Some(result) = rx.borrow_and_update().clone() {
                            return result;
                        }
                        if rx.changed().await.is_err() {
                            // The builder was cancelled before publishing;
                            // the slot is cleared, so race for it again.
                            break;
                        }
                    }
                }
                Access::Build { tx, generation } => {
                    let build = build.take().expect("build ran more than once");
                    let mut guard = LoadGuard {
                        inner: &self.inner,
                        key,
                        generation,
                        armed: true,
                    };
                    let built = build().await;
                    guard.armed = false;

                    return match built {
                        Ok(value) => {
                            let value = Arc::new(value);
                            let installed = {
                                let mut state =
                                    self.inner.state.lock().expect("failed to acquire lock");
                                let still_mine = matches!(
                                    state.slots.get(key),
                                    Some(Slot::Loading { generation: g, .. }) if *g == generation
                                );
                                if still_mine && !state.closed {
                                    state.slots.insert(
                                        key.clone(),
                                        Slot::Ready {
                                            value: value.clone(),
                                        },
                                    );
                                    true
                                } else {
                                    if still_mine {
                                        state.slots.remove(key);
                                    }
                                    false
                                }
                            };
                            let _ = tx.send(Some(Ok(value.clone())));
                            if !installed {
                                // Removed (or closed) while loading: publish
                                // to the waiters, then release right away.
                                debug!(?key, "Releasing entry removed while loading");
                                self.inner.release(&value);
                            }
                            Ok(value)
                        }
                        Err(e) => {
                            {
                                let mut state =
                                    self.inner.state.lock().expect("failed to acquire lock");
                                if matches!(
                                    state.slots.get(key),
                                    Some(Slot::Loading { generation: g, .. }) if *g == generation
                                ) {
                                    state.slots.remove(key);
                                }
                            }
                            let _ = tx.send(Some(Err(e.clone())));
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Drops the slot and releases its entry. Idempotent.
    pub fn remove(&self, key: &Bytes) -> Result<()> {
        self.inner.remove(key)
    }

    /// Snapshot of the entries live at the time of the call. Loads observed
    /// in flight are awaited; entries created afterwards are not observed,
    /// and loads that fail are skipped.
    pub async fn values(&self) -> Result<Vec<Arc<V>>> {
        enum Observed<V> {
            Ready(Arc<V>),
            Loading(watch::Receiver<LoadResult<V>>),
        }

        let snapshot: Vec<_> = {
            let state = self.inner.state.lock().expect("failed to acquire lock");
            if state.closed {
                return Err(Error::CacheClosed);
            }
            state
                .slots
                .values()
                .map(|slot| match slot {
                    Slot::Ready { value } => Observed::Ready(value.clone()),
                    Slot::Loading { rx, .. } => Observed::Loading(rx.clone()),
                })
                .collect()
        };

        let mut values = Vec::with_capacity(snapshot.len());
        for entry in snapshot {
            match entry {
                Observed::Ready(value) => values.push(value),
                Observed::Loading(mut rx) => loop {
                    let current = rx.borrow_and_update().clone();
                    match current {
                        Some(Ok(value)) => {
                            values.push(value);
                            break;
                        }
                        Some(Err(_)) => break,
                        None => {
                            if rx.changed().await.is_err() {
                                break;
                            }
                        }
                    }
                },
            }
        }
        Ok(values)
    }

    /// Marks the cache closed and releases every ready entry. Entries still
    /// loading are released by their builders after publication. All
    /// subsequent operations fail with [Error::CacheClosed].
    pub fn close(&self) {
        let slots = {
            let mut state = self.inner.state.lock().expect("failed to acquire lock");
            state.closed = true;
            std::mem::take(&mut state.slots)
        };
        for slot in slots.into_values() {
            if let Slot::Ready { value } = slot {
                self.inner.release(&value);
            }
        }
    }
}
