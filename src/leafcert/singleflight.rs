//! Keyed coalescing of background refreshes.
//!
//! One flight per key runs as its own task; late callers attach to the
//! running flight's completion signal instead of starting another. The flight
//! keeps running when every waiter has gone away.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

/// Completion signal of one flight. Resolves once the flight finished.
#[derive(Debug, Clone)]
pub(crate) struct FlightDone {
    rx: watch::Receiver<bool>,
}

impl FlightDone {
    pub(crate) async fn wait(mut self) {
        // A dropped sender also means the flight is over
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Group {
    flights: Arc<DashMap<String, watch::Receiver<bool>>>,
}

impl Group {
    /// Run `work` for `key` unless a flight for `key` is already running.
    pub(crate) fn do_chan<F>(&self, key: &str, work: F) -> FlightDone
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(flight) => {
                debug!(key = %key, "joining in-flight refresh");
                FlightDone { rx: flight.get().clone() }
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(false);
                slot.insert(rx.clone());

                let landing = Landing { flights: Arc::clone(&self.flights), key: key.to_string(), tx };
                tokio::spawn(async move {
                    let _landing = landing;
                    work.await;
                });
                FlightDone { rx }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// Unregisters the flight and wakes its waiters, also when the work panics
/// or is dropped with the runtime.
struct Landing {
    flights: Arc<DashMap<String, watch::Receiver<bool>>>,
    key: String,
    tx: watch::Sender<bool>,
}

impl Drop for Landing {
    fn drop(&mut self) {
        self.flights.remove(&self.key);
        self.tx.send_replace(true);
    }
}
