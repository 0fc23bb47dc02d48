//! Shared CA root watch.
//!
//! Every refresh that blocks waiting for its certificate to expire also wants
//! to hear about root rotations. Rather than one upstream stream per entry, a
//! single background loop watches the roots and fans an edge-trigger out to the
//! subscribed refreshes. The loop starts with the first subscriber and stops
//! with the last one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::IndexedCaRoots;
use crate::errors::Result;

/// Correlation id tagging the root watch stream.
pub const ROOTS_CORRELATION_ID: &str = "roots";

/// One push from a [`RootsReader`] stream.
#[derive(Debug, Clone)]
pub struct RootsUpdateEvent {
    pub correlation_id: String,
    pub index: u64,
    /// `Ok(None)` is a reply that carried no root set.
    pub result: Result<Option<Arc<IndexedCaRoots>>>,
}

/// Source of the cluster's CA roots.
#[async_trait]
pub trait RootsReader: Send + Sync {
    /// Current root set.
    async fn get(&self) -> Result<Option<Arc<IndexedCaRoots>>>;

    /// Register a push stream of root updates tagged with `correlation_id`.
    ///
    /// Returns once the stream is set up. Events keep flowing into `updates`
    /// until `cancel` fires.
    async fn notify(
        &self,
        cancel: CancellationToken,
        correlation_id: &str,
        updates: mpsc::Sender<RootsUpdateEvent>,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
struct WatchState {
    subscribers: HashMap<u64, mpsc::Sender<()>>,
    next_subscriber_id: u64,
    /// Cancel handle of the running loop, tagged with its generation.
    running: Option<(u64, CancellationToken)>,
    generation: u64,
}

struct Shared {
    roots_reader: Arc<dyn RootsReader>,
    shutdown: CancellationToken,
    state: Mutex<WatchState>,
    start_count: AtomicU32,
    stop_count: AtomicU32,
}

#[derive(Clone)]
pub(crate) struct RootWatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RootWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootWatcher")
            .field("start_count", &self.start_count())
            .field("stop_count", &self.stop_count())
            .finish_non_exhaustive()
    }
}

impl RootWatcher {
    /// The watch loop runs on a child of `shutdown`.
    pub(crate) fn new(roots_reader: Arc<dyn RootsReader>, shutdown: CancellationToken) -> Self {
        Self {
            shared: Arc::new(Shared {
                roots_reader,
                shutdown,
                state: Mutex::new(WatchState::default()),
                start_count: AtomicU32::new(0),
                stop_count: AtomicU32::new(0),
            }),
        }
    }

    /// Register a one-slot channel for change signals, starting the watch loop
    /// if it is not running. Unsubscribes when the returned guard drops.
    pub(crate) fn subscribe(&self, tx: mpsc::Sender<()>) -> Subscription {
        let mut state = self.shared.state.lock().expect("root watcher lock poisoned");
        if state.running.is_none() {
            state.generation += 1;
            let generation = state.generation;
            let cancel = self.shared.shutdown.child_token();
            state.running = Some((generation, cancel.clone()));
            tokio::spawn(watch_roots(Arc::clone(&self.shared), cancel, generation));
        }

        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.insert(id, tx);
        Subscription { shared: Arc::clone(&self.shared), id }
    }

    pub(crate) fn start_count(&self) -> u32 {
        self.shared.start_count.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_count(&self) -> u32 {
        self.shared.stop_count.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.shared.state.lock().expect("root watcher lock poisoned").subscribers.len()
    }
}

/// Registration returned by [`RootWatcher::subscribe`].
pub(crate) struct Subscription {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().expect("root watcher lock poisoned");
        state.subscribers.remove(&self.id);
        if state.subscribers.is_empty() {
            if let Some((_, cancel)) = state.running.take() {
                cancel.cancel();
            }
        }
    }
}

impl Shared {
    /// Non-blocking send to every subscriber. A full slot already holds a
    /// pending wake-up.
    fn notify_change(&self) {
        let state = self.state.lock().expect("root watcher lock poisoned");
        for tx in state.subscribers.values() {
            let _ = tx.try_send(());
        }
    }
}

/// Counts the loop's exit and frees its slot so the next subscriber starts a
/// new loop after an abnormal exit.
struct LoopExit {
    shared: Arc<Shared>,
    generation: u64,
}

impl Drop for LoopExit {
    fn drop(&mut self) {
        self.shared.stop_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state.lock().expect("root watcher lock poisoned");
        if state.running.as_ref().is_some_and(|(generation, _)| *generation == self.generation) {
            state.running = None;
        }
    }
}

async fn watch_roots(shared: Arc<Shared>, cancel: CancellationToken, generation: u64) {
    shared.start_count.fetch_add(1, Ordering::SeqCst);
    let _exit = LoopExit { shared: Arc::clone(&shared), generation };
    debug!(generation, "root watch started");

    let (tx, mut rx) = mpsc::channel(1);
    if let Err(err) = shared.roots_reader.notify(cancel.clone(), ROOTS_CORRELATION_ID, tx).await {
        // Subscribers re-read the roots and observe the failure themselves
        warn!(error = %err, "failed to watch CA roots");
        shared.notify_change();
        return;
    }

    let mut active_root_id: Option<String> = None;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(generation, "root watch stopped");
                return;
            }
            event = rx.recv() => event,
        };

        let Some(event) = event else {
            warn!("CA root watch stream closed");
            shared.notify_change();
            return;
        };
        if event.correlation_id != ROOTS_CORRELATION_ID {
            debug!(correlation_id = %event.correlation_id, "ignoring unrelated root event");
            continue;
        }

        match event.result {
            Err(err) => {
                warn!(error = %err, index = event.index, "CA root watch returned an error");
                shared.notify_change();
            }
            Ok(None) => {
                warn!(index = event.index, "CA root watch returned no roots");
                shared.notify_change();
            }
            Ok(Some(roots)) => {
                if active_root_id.as_deref() == Some(roots.active_root_id.as_str()) {
                    continue;
                }
                info!(active_root_id = %roots.active_root_id, index = event.index, "active CA root changed");
                shared.notify_change();
                active_root_id = Some(roots.active_root_id.clone());
            }
        }
    }
}
