//! Property tests for the expiry heap: arbitrary add/update/remove sequences
//! keep handle indexes and heap order consistent.

use std::sync::Arc;
use std::time::Duration;

use flowplane_leafcert::ttlcache::{ExpiryEntry, ExpiryHeap, NOT_IN_HEAP};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Add(u64),
    Update(usize, u64),
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..10_000).prop_map(Op::Add),
        (any::<usize>(), 1u64..10_000).prop_map(|(pick, ttl)| Op::Update(pick, ttl)),
        any::<usize>().prop_map(Op::Remove),
    ]
}

fn check_invariants(heap: &ExpiryHeap, live: &[Arc<ExpiryEntry>], removed: &[Arc<ExpiryEntry>]) {
    assert_eq!(heap.len(), live.len());

    let mut seen = vec![false; live.len()];
    for entry in live {
        let index = entry.index();
        assert!(index >= 0 && (index as usize) < heap.len(), "index {index} out of range");
        assert!(!seen[index as usize], "index {index} shared");
        seen[index as usize] = true;

        if index > 0 {
            let parent = (index - 1) / 2;
            assert!(heap.expiry_at(parent) <= heap.expiry_at(index), "heap order broken at {index}");
        }
    }
    for entry in removed {
        assert_eq!(entry.index(), NOT_IN_HEAP);
    }

    let soonest = live.iter().filter_map(|entry| heap.expiry_at(entry.index())).min();
    assert_eq!(heap.next().deadline(), soonest);
}

proptest! {
    #[test]
    fn operations_preserve_heap_invariants(ops in prop::collection::vec(op(), 1..64)) {
        let mut heap = ExpiryHeap::new();
        let mut live: Vec<Arc<ExpiryEntry>> = Vec::new();
        let mut removed = Vec::new();

        for (n, op) in ops.into_iter().enumerate() {
            match op {
                Op::Add(ttl) => live.push(heap.add(format!("key-{n}"), Duration::from_millis(ttl))),
                Op::Update(pick, ttl) if !live.is_empty() => {
                    let entry = &live[pick % live.len()];
                    heap.update(entry.index(), Duration::from_millis(ttl));
                }
                Op::Remove(pick) if !live.is_empty() => {
                    let entry = live.swap_remove(pick % live.len());
                    heap.remove(entry.index());
                    removed.push(entry);
                }
                _ => {}
            }
            check_invariants(&heap, &live, &removed);
        }
    }

    #[test]
    fn stale_handles_are_ignored(ttls in prop::collection::vec(1u64..1_000, 2..16)) {
        let mut heap = ExpiryHeap::new();
        let entries: Vec<_> = ttls
            .iter()
            .enumerate()
            .map(|(n, ttl)| heap.add(format!("key-{n}"), Duration::from_millis(*ttl)))
            .collect();

        let first = &entries[0];
        heap.remove(first.index());
        prop_assert_eq!(first.index(), NOT_IN_HEAP);

        // Using the evicted handle again must not touch anything
        heap.update(first.index(), Duration::from_millis(1));
        heap.remove(first.index());
        prop_assert_eq!(heap.len(), entries.len() - 1);
        check_invariants(&heap, &entries[1..], &entries[..1]);
    }
}
