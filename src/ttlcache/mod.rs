//! # Expiry heap
//!
//! A binary min-heap of keys ordered by expiry time. `add`, `update` and
//! `remove` are O(log n). Whenever the soonest-expiring entry changes, the heap
//! wakes its [`Notify`] so a sweeper waiting on an older [`ExpiryTimer`] can
//! recompute.
//!
//! The heap does no locking of its own; callers guard it together with
//! whatever map its keys index.

use std::future;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Index value of an entry that is no longer in the heap.
pub const NOT_IN_HEAP: isize = -1;

/// Handle to an entry in an [`ExpiryHeap`].
///
/// The index is written only by the heap. Holders read it to address the entry
/// in `update`/`remove` and must treat [`NOT_IN_HEAP`] as "already evicted".
#[derive(Debug)]
pub struct ExpiryEntry {
    key: String,
    heap_index: AtomicIsize,
}

impl ExpiryEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current position in the heap, or [`NOT_IN_HEAP`].
    pub fn index(&self) -> isize {
        self.heap_index.load(Ordering::Acquire)
    }

    fn set_index(&self, index: isize) {
        self.heap_index.store(index, Ordering::Release);
    }
}

#[derive(Debug)]
struct Slot {
    entry: Arc<ExpiryEntry>,
    expiry: Instant,
}

#[derive(Debug)]
pub struct ExpiryHeap {
    slots: Vec<Slot>,
    notify: Arc<Notify>,
}

impl Default for ExpiryHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiryHeap {
    pub fn new() -> Self {
        Self { slots: Vec::new(), notify: Arc::new(Notify::new()) }
    }

    /// Signalled (coalesced, at most one stored wake-up) whenever the root changes.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert `key` expiring `ttl` from now.
    pub fn add(&mut self, key: impl Into<String>, ttl: Duration) -> Arc<ExpiryEntry> {
        let entry = Arc::new(ExpiryEntry { key: key.into(), heap_index: AtomicIsize::new(NOT_IN_HEAP) });
        let index = self.slots.len();
        entry.set_index(index as isize);
        self.slots.push(Slot { entry: Arc::clone(&entry), expiry: Instant::now() + ttl });

        if self.sift_up(index) == 0 {
            self.notify.notify_one();
        }
        entry
    }

    /// Reset the expiry of the entry at `index` to `ttl` from now.
    ///
    /// Stale indexes (evicted entries) are ignored.
    pub fn update(&mut self, index: isize, ttl: Duration) {
        let Some(position) = self.position(index) else {
            return;
        };
        self.slots[position].expiry = Instant::now() + ttl;
        let new_position = self.fix(position);

        if position == 0 || new_position == 0 {
            self.notify.notify_one();
        }
    }

    /// Remove the entry at `index`, marking its handle [`NOT_IN_HEAP`].
    pub fn remove(&mut self, index: isize) {
        let Some(position) = self.position(index) else {
            return;
        };
        if position == 0 {
            self.notify.notify_one();
        }

        let last = self.slots.len() - 1;
        if position != last {
            self.swap(position, last);
        }
        if let Some(slot) = self.slots.pop() {
            slot.entry.set_index(NOT_IN_HEAP);
        }
        if position < self.slots.len() {
            self.fix(position);
        }
    }

    /// Timer for the current soonest-expiring entry.
    ///
    /// The timer is a snapshot: mutations after this call are signalled via
    /// [`ExpiryHeap::notifier`], not reflected in the timer.
    pub fn next(&self) -> ExpiryTimer {
        match self.slots.first() {
            Some(slot) => ExpiryTimer { entry: Some(Arc::clone(&slot.entry)), deadline: Some(slot.expiry) },
            None => ExpiryTimer { entry: None, deadline: None },
        }
    }

    /// Whether `entry` is live in this heap and its expiry is at or before `now`.
    pub fn is_expired(&self, entry: &Arc<ExpiryEntry>, now: Instant) -> bool {
        self.position(entry.index())
            .map(|position| &self.slots[position])
            .is_some_and(|slot| Arc::ptr_eq(&slot.entry, entry) && slot.expiry <= now)
    }

    /// Expiry of the entry at `index`.
    pub fn expiry_at(&self, index: isize) -> Option<Instant> {
        self.position(index).map(|position| self.slots[position].expiry)
    }

    fn position(&self, index: isize) -> Option<usize> {
        usize::try_from(index).ok().filter(|position| *position < self.slots.len())
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
        self.slots[a].entry.set_index(a as isize);
        self.slots[b].entry.set_index(b as isize);
    }

    fn sift_up(&mut self, mut position: usize) -> usize {
        while position > 0 {
            let parent = (position - 1) / 2;
            if self.slots[position].expiry >= self.slots[parent].expiry {
                break;
            }
            self.swap(position, parent);
            position = parent;
        }
        position
    }

    fn sift_down(&mut self, mut position: usize) -> usize {
        let len = self.slots.len();
        loop {
            let left = 2 * position + 1;
            if left >= len {
                return position;
            }
            let right = left + 1;
            let smallest =
                if right < len && self.slots[right].expiry < self.slots[left].expiry { right } else { left };
            if self.slots[smallest].expiry >= self.slots[position].expiry {
                return position;
            }
            self.swap(position, smallest);
            position = smallest;
        }
    }

    fn fix(&mut self, position: usize) -> usize {
        let moved = self.sift_up(position);
        if moved != position {
            return moved;
        }
        self.sift_down(position)
    }
}

/// One-shot timer returned by [`ExpiryHeap::next`].
#[derive(Debug)]
pub struct ExpiryTimer {
    entry: Option<Arc<ExpiryEntry>>,
    deadline: Option<Instant>,
}

impl ExpiryTimer {
    /// Entry the timer fires for; `None` when the heap was empty.
    pub fn entry(&self) -> Option<&Arc<ExpiryEntry>> {
        self.entry.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolve at the deadline. Never resolves for an empty heap.
    pub async fn wait(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_heap_invariant(heap: &ExpiryHeap) {
        for (position, slot) in heap.slots.iter().enumerate() {
            assert_eq!(slot.entry.index(), position as isize, "index of {}", slot.entry.key());
            if position > 0 {
                let parent = (position - 1) / 2;
                assert!(heap.slots[parent].expiry <= slot.expiry);
            }
        }
    }

    fn root_key(heap: &ExpiryHeap) -> Option<String> {
        heap.next().entry().map(|entry| entry.key().to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn add_orders_by_expiry() {
        let mut heap = ExpiryHeap::new();
        heap.add("c", Duration::from_secs(30));
        heap.add("a", Duration::from_secs(10));
        heap.add("b", Duration::from_secs(20));

        assert_eq!(heap.len(), 3);
        assert_eq!(root_key(&heap).as_deref(), Some("a"));
        assert_heap_invariant(&heap);
    }

    #[tokio::test(start_paused = true)]
    async fn update_moves_entry_and_keeps_indexes_consistent() {
        let mut heap = ExpiryHeap::new();
        let a = heap.add("a", Duration::from_secs(10));
        heap.add("b", Duration::from_secs(20));
        heap.add("c", Duration::from_secs(30));

        heap.update(a.index(), Duration::from_secs(40));
        assert_eq!(root_key(&heap).as_deref(), Some("b"));
        assert_heap_invariant(&heap);

        heap.update(a.index(), Duration::from_secs(1));
        assert_eq!(root_key(&heap).as_deref(), Some("a"));
        assert_eq!(a.index(), 0);
        assert_heap_invariant(&heap);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_marks_entry_as_not_in_heap() {
        let mut heap = ExpiryHeap::new();
        let a = heap.add("a", Duration::from_secs(10));
        let b = heap.add("b", Duration::from_secs(20));
        let c = heap.add("c", Duration::from_secs(30));

        heap.remove(b.index());
        assert_eq!(b.index(), NOT_IN_HEAP);
        assert_heap_invariant(&heap);

        heap.remove(a.index());
        assert_eq!(a.index(), NOT_IN_HEAP);
        assert_eq!(c.index(), 0);
        assert_eq!(heap.len(), 1);

        // Stale handles are ignored
        heap.update(a.index(), Duration::from_secs(1));
        heap.remove(b.index());
        assert_eq!(heap.len(), 1);
        assert_eq!(root_key(&heap).as_deref(), Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn notifies_only_when_root_changes() {
        let mut heap = ExpiryHeap::new();
        let notify = heap.notifier();

        heap.add("a", Duration::from_secs(10));
        // The stored permit resolves immediately
        notify.notified().await;

        // Not the root: no permit stored
        let b = heap.add("b", Duration::from_secs(20));
        assert!(tokio::time::timeout(Duration::from_millis(1), notify.notified()).await.is_err());

        // Updating a non-root entry that stays non-root does not notify
        heap.update(b.index(), Duration::from_secs(25));
        assert!(tokio::time::timeout(Duration::from_millis(1), notify.notified()).await.is_err());

        // Updating the root notifies even when it stays the root
        heap.update(0, Duration::from_secs(11));
        notify.notified().await;

        // Removing the root notifies
        heap.remove(0);
        notify.notified().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_at_root_expiry() {
        let mut heap = ExpiryHeap::new();
        let empty = heap.next();
        assert!(empty.entry().is_none());
        assert!(tokio::time::timeout(Duration::from_secs(3600), empty.wait()).await.is_err());

        let a = heap.add("a", Duration::from_secs(5));
        let timer = heap.next();
        let start = Instant::now();
        timer.wait().await;
        assert!(Instant::now() - start >= Duration::from_secs(5));
        assert!(heap.is_expired(&a, Instant::now()));
        assert!(timer.entry().is_some_and(|entry| Arc::ptr_eq(entry, &a)));

        heap.update(a.index(), Duration::from_secs(5));
        assert!(!heap.is_expired(&a, Instant::now()));
        assert!(heap.expiry_at(a.index()).is_some());
    }
}
