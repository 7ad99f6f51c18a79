//! Watch-synchronized local cache of cluster objects
//!
//! A mirror has exactly one [`MirrorWriter`], driven by a watch stream, and any
//! number of cheap [`MirrorReader`] clones. Readers never mutate.

use crate::cluster::{WatchEvent, WatchStream};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use strand_types::{ObjectKey, Resource};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type Store<T> = Arc<RwLock<HashMap<ObjectKey, T>>>;

/// A change applied to the mirror
#[derive(Debug, Clone)]
pub enum Change<T> {
    Upserted(T),
    Removed(T),
}

impl<T: Resource> Change<T> {
    pub fn object(&self) -> &T {
        match self {
            Change::Upserted(obj) | Change::Removed(obj) => obj,
        }
    }
}

/// Create an empty, unsynced mirror
pub fn mirror<T: Resource>() -> (MirrorWriter<T>, MirrorReader<T>) {
    let store: Store<T> = Arc::new(RwLock::new(HashMap::new()));
    let (synced_tx, synced_rx) = watch::channel(false);
    (
        MirrorWriter {
            store: Arc::clone(&store),
            synced: synced_tx,
        },
        MirrorReader {
            store,
            synced: synced_rx,
        },
    )
}

/// Read side of a mirror
#[derive(Debug, Clone)]
pub struct MirrorReader<T> {
    store: Store<T>,
    synced: watch::Receiver<bool>,
}

impl<T: Resource> MirrorReader<T> {
    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.store.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.store.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the first full listing has been applied
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Block until the first full listing is applied.
    ///
    /// Returns `false` if the writer went away before syncing.
    pub async fn wait_for_sync(&self) -> bool {
        let mut synced = self.synced.clone();
        let reached = synced.wait_for(|s| *s).await.is_ok();
        reached
    }
}

/// Write side of a mirror; owned by the task consuming the watch
#[derive(Debug)]
pub struct MirrorWriter<T> {
    store: Store<T>,
    synced: watch::Sender<bool>,
}

impl<T: Resource> MirrorWriter<T> {
    /// Apply one watch event and report what changed
    pub fn apply(&mut self, event: WatchEvent<T>) -> Vec<Change<T>> {
        let changes = match event {
            WatchEvent::Restarted(objects) => {
                let mut fresh: HashMap<ObjectKey, T> =
                    objects.into_iter().map(|obj| (obj.key(), obj)).collect();
                let mut store = self.store.write();
                let mut changes: Vec<Change<T>> = store
                    .drain()
                    .filter(|(key, _)| !fresh.contains_key(key))
                    .map(|(_, obj)| Change::Removed(obj))
                    .collect();
                changes.extend(fresh.values().cloned().map(Change::Upserted));
                std::mem::swap(&mut *store, &mut fresh);
                changes
            }
            WatchEvent::Applied(obj) => {
                self.store.write().insert(obj.key(), obj.clone());
                vec![Change::Upserted(obj)]
            }
            WatchEvent::Deleted(obj) => {
                self.store.write().remove(&obj.key());
                vec![Change::Removed(obj)]
            }
        };
        if !*self.synced.borrow() {
            self.synced.send_replace(true);
        }
        changes
    }

    /// Drive the mirror from `events` until the stream ends or `cancel` fires
    pub async fn run<F>(mut self, mut events: WatchStream<T>, cancel: CancellationToken, mut on_change: F)
    where
        F: FnMut(Change<T>) + Send,
    {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => {
                        for change in self.apply(event) {
                            on_change(change);
                        }
                    }
                    None => {
                        tracing::warn!(kind = T::KIND, "Watch stream ended");
                        break;
                    }
                },
            }
        }
        tracing::debug!(kind = T::KIND, "Mirror stopped");
    }
}
