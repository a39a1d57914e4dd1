use std::collections::BTreeSet;
use std::sync::Arc;

use collectord::collection::MARK_EXPIRE;
use collectord::command::*;
use collectord::housekeeper::Housekeeper;
use collectord::liveness::LogNotifier;
use collectord::{Ad, AdType, IdentityKey, InvalidationPolicy, QuerySpec, RegistryStore, StoreConfig};
use proptest::prelude::*;

fn worker(i: usize, memory: i64) -> Ad {
    Ad::new()
        .with("MyType", "Machine")
        .with("Name", format!("slot{}@host", i))
        .with("StartdIpAddr", "<10.3.0.1:9618>")
        .with("Memory", memory)
}

fn key(i: usize) -> IdentityKey {
    IdentityKey::with_addr(format!("slot{}@host", i), "10.3.0.1")
}

fn requirements(src: &str) -> Ad {
    let mut q = Ad::new();
    q.parse_insert("Requirements", src).unwrap();
    q
}

fn populated(policy: InvalidationPolicy, memories: &[i64]) -> RegistryStore {
    let store = RegistryStore::new(StoreConfig {
        invalidation: policy,
        ..StoreConfig::default()
    });
    for (i, m) in memories.iter().enumerate() {
        let pvt = Ad::new().with("Capability", format!("cap{}", i));
        store.ingest_at(UPDATE_STARTD_AD, worker(i, *m), Some(pvt), None, 1000);
    }
    store
}

fn names_in(store: &RegistryStore, t: AdType) -> BTreeSet<String> {
    store
        .collection(t)
        .unwrap()
        .snapshot()
        .into_iter()
        .map(|(k, _, _)| k.name)
        .collect()
}

const TOGGLES: [Option<bool>; 3] = [None, Some(true), Some(false)];

proptest! {
    /// Any sequence of updates for one identity leaves one entry holding
    /// the latest content.
    #[test]
    fn updates_for_one_key_collapse(
        steps in prop::collection::vec((0u64..50, 0i64..100_000), 1..30),
    ) {
        let store = RegistryStore::new(StoreConfig::default());
        let workers = store.collection(AdType::WorkerNode).unwrap();
        let mut now = 0;
        let mut last_seen = 0;
        for (dt, memory) in &steps {
            now += dt;
            store.ingest_at(UPDATE_STARTD_AD, worker(0, *memory), None, None, now);
            prop_assert_eq!(workers.len(), 1);
            let seen = workers.last_seen(&key(0)).unwrap();
            prop_assert!(seen >= last_seen);
            last_seen = seen;
        }
        let stored = workers.lookup(&key(0)).unwrap();
        prop_assert_eq!(stored.lookup_int("Memory"), Some(steps.last().unwrap().1));
    }

    /// An ad is in the result exactly when the requirements hold for it.
    #[test]
    fn query_matches_predicate(
        memories in prop::collection::vec(0i64..8192, 0..40),
        threshold in 0i64..8192,
    ) {
        let store = populated(InvalidationPolicy::Remove, &memories);
        let spec = QuerySpec::from_query_ad(requirements(&format!("Memory >= {}", threshold))).unwrap();
        let got: BTreeSet<String> = store
            .evaluate(AdType::WorkerNode, &spec)
            .filter_map(|ad| ad.lookup_string("Name"))
            .collect();
        let want: BTreeSet<String> = memories
            .iter()
            .enumerate()
            .filter(|(_, m)| **m >= threshold)
            .map(|(i, _)| format!("slot{}@host", i))
            .collect();
        prop_assert_eq!(got, want);
    }

    /// Invalidation removes exactly the matching ads and their private ads;
    /// repeating it removes nothing.
    #[test]
    fn invalidate_removes_matching_set(
        memories in prop::collection::vec(0i64..8192, 0..40),
        threshold in 0i64..8192,
        sweep in any::<bool>(),
    ) {
        let policy = if sweep { InvalidationPolicy::MarkAndSweep } else { InvalidationPolicy::Remove };
        let store = populated(policy, &memories);
        let q = requirements(&format!("Memory < {}", threshold));
        let expected = memories.iter().filter(|m| **m < threshold).count();

        prop_assert_eq!(store.invalidate(AdType::WorkerNode, &q).unwrap(), expected);
        let left = names_in(&store, AdType::WorkerNode);
        let want: BTreeSet<String> = memories
            .iter()
            .enumerate()
            .filter(|(_, m)| **m >= threshold)
            .map(|(i, _)| format!("slot{}@host", i))
            .collect();
        prop_assert_eq!(&left, &want);
        prop_assert_eq!(&names_in(&store, AdType::WorkerNodePrivate), &want);
        prop_assert_eq!(store.invalidate(AdType::WorkerNode, &q).unwrap(), 0);
    }
}

/// All nine toggle combinations, over both the scan and direct-key paths.
#[test]
fn every_toggle_combination_invalidates() {
    for expire in TOGGLES {
        for housekeeping in TOGGLES {
            let policy = InvalidationPolicy::resolve(expire, housekeeping);
            let ctx = format!("expire={:?} housekeeping={:?}", expire, housekeeping);

            // scan
            let store = Arc::new(populated(policy, &[100, 200, 300]));
            let n = store
                .invalidate(AdType::WorkerNode, &requirements("Memory <= 200"))
                .unwrap();
            assert_eq!(n, 2, "{}", ctx);
            check_outcome(&store, policy, &[0, 1], &ctx);

            // direct key
            let store = Arc::new(populated(policy, &[100, 200, 300]));
            let q = Ad::new()
                .with("Name", "slot2@host")
                .with("StartdIpAddr", "<10.3.0.1:9618>");
            assert_eq!(store.invalidate(AdType::WorkerNode, &q).unwrap(), 1, "{}", ctx);
            check_outcome(&store, policy, &[2], &ctx);
        }
    }
}

fn check_outcome(store: &Arc<RegistryStore>, policy: InvalidationPolicy, hit: &[usize], ctx: &str) {
    let workers = store.collection(AdType::WorkerNode).unwrap();
    let privates = store.collection(AdType::WorkerNodePrivate).unwrap();
    match policy {
        InvalidationPolicy::Expire => {
            for i in hit {
                assert_eq!(workers.last_seen(&key(*i)), Some(MARK_EXPIRE), "{}", ctx);
            }
            assert_eq!(workers.len(), 3, "{}", ctx);
            let hk = Housekeeper::new(Arc::clone(store), Arc::new(LogNotifier));
            // well inside every TTL for the untouched ads
            hk.sweep_at(1001);
        }
        InvalidationPolicy::MarkAndSweep | InvalidationPolicy::Remove => {}
    }
    assert_eq!(workers.len(), 3 - hit.len(), "{}", ctx);
    assert_eq!(privates.len(), 3 - hit.len(), "{}", ctx);
    for i in hit {
        assert!(workers.lookup(&key(*i)).is_none(), "{}", ctx);
        assert!(privates.lookup(&key(*i)).is_none(), "{}", ctx);
    }
}
