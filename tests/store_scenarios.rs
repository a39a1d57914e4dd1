/// Integration tests for the registry store: update, query and invalidate
/// through the public library API.
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use collectord::command::*;
use collectord::housekeeper::Housekeeper;
use collectord::liveness::LogNotifier;
use collectord::{Ad, AdType, IdentityKey, IngestOutcome, QuerySpec, RegistryStore, StoreConfig};

fn worker(name: &str, memory: i64) -> Ad {
    Ad::new()
        .with("MyType", "Machine")
        .with("Name", name)
        .with("StartdIpAddr", "<10.1.1.1:9999>")
        .with("Memory", memory)
}

fn requirements(src: &str) -> Ad {
    let mut q = Ad::new();
    q.parse_insert("Requirements", src).unwrap();
    q
}

#[test]
fn repeated_update_keeps_one_entry() {
    let store = RegistryStore::new(StoreConfig::default());
    let first = store.ingest_at(UPDATE_STARTD_AD, worker("slot1@hostA", 512), None, None, 10);
    assert_eq!(first.outcome, IngestOutcome::Inserted);
    let second = store.ingest_at(UPDATE_STARTD_AD, worker("slot1@hostA", 512), None, None, 20);
    assert_eq!(second.outcome, IngestOutcome::Updated);

    let workers = store.collection(AdType::WorkerNode).unwrap();
    assert_eq!(workers.len(), 1);
    let key = IdentityKey::with_addr("slot1@hostA", "10.1.1.1");
    assert_eq!(workers.last_seen(&key), Some(20));
    assert_eq!(workers.lookup(&key).unwrap().lookup_int("LastHeardFrom"), Some(20));
}

#[test]
fn query_returns_exactly_matching_ads() {
    let store = RegistryStore::new(StoreConfig::default());
    store.ingest_at(UPDATE_STARTD_AD, worker("slot1@hostA", 512), None, None, 1);
    store.ingest_at(UPDATE_STARTD_AD, worker("slot1@hostB", 2048), None, None, 1);

    let spec = QuerySpec::from_query_ad(requirements("Memory >= 1024")).unwrap();
    let result: Vec<_> = store.evaluate(AdType::WorkerNode, &spec).collect();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].lookup_string("Name").as_deref(), Some("slot1@hostB"));
}

#[test]
fn invalidation_takes_private_ad_along() {
    let store = RegistryStore::new(StoreConfig::default());
    for name in ["slot1@hostA", "slot2@hostA"] {
        let pvt = Ad::new().with("Capability", name);
        store.ingest_at(UPDATE_STARTD_AD, worker(name, 512), Some(pvt), None, 1);
    }

    let n = store
        .invalidate(AdType::WorkerNode, &requirements("Name == \"slot1@hostA\""))
        .unwrap();
    assert_eq!(n, 1);

    let gone = IdentityKey::with_addr("slot1@hostA", "10.1.1.1");
    let kept = IdentityKey::with_addr("slot2@hostA", "10.1.1.1");
    let workers = store.collection(AdType::WorkerNode).unwrap();
    let privates = store.collection(AdType::WorkerNodePrivate).unwrap();
    assert!(workers.lookup(&gone).is_none());
    assert!(privates.lookup(&gone).is_none());
    assert!(workers.lookup(&kept).is_some());
    assert!(privates.lookup(&kept).is_some());
}

#[test]
fn update_without_name_is_rejected() {
    let store = RegistryStore::new(StoreConfig::default());
    let ad = Ad::new()
        .with("MyType", "Machine")
        .with("StartdIpAddr", "<10.1.1.1:9999>");
    let r = store.ingest_at(UPDATE_STARTD_AD, ad, None, None, 1);
    assert_eq!(r.outcome, IngestOutcome::RejectedNoKey);
    assert!(r.stored.is_none());
    assert_eq!(store.collection(AdType::WorkerNode).unwrap().len(), 0);
}

#[test]
fn machine_attribute_stands_in_for_name() {
    let store = RegistryStore::new(StoreConfig::default());
    let ad = Ad::new()
        .with("Machine", "hostA")
        .with("ScheddIpAddr", "<10.1.1.2:1>");
    let r = store.ingest_at(UPDATE_SCHEDD_AD, ad, None, None, 1);
    assert_eq!(r.key, Some(IdentityKey::with_addr("hostA", "10.1.1.2")));
}

#[test]
fn sequence_gaps_count_as_lost() {
    let store = RegistryStore::new(StoreConfig::default());
    let seq = |n: i64| {
        worker("slot1@hostA", 512)
            .with("UpdateSequenceNumber", n)
            .with("DaemonStartTime", 1000)
    };
    store.ingest_at(UPDATE_STARTD_AD, seq(5), None, None, 1);
    store.ingest_at(UPDATE_STARTD_AD, seq(6), None, None, 2);
    let stats = store.stats().get("Machine").unwrap();
    assert_eq!(stats.lost, 0);

    store.ingest_at(UPDATE_STARTD_AD, seq(9), None, None, 3);
    let stats = store.stats().get("Machine").unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.lost, 2);
    assert_eq!(stats.history.lost(), 2);
}

#[test]
fn restarted_advertiser_is_not_a_gap() {
    let store = RegistryStore::new(StoreConfig::default());
    let first = worker("slot1@hostA", 512)
        .with("UpdateSequenceNumber", 40)
        .with("DaemonStartTime", 1000);
    let restarted = worker("slot1@hostA", 512)
        .with("UpdateSequenceNumber", 1)
        .with("DaemonStartTime", 2000);
    store.ingest_at(UPDATE_STARTD_AD, first, None, None, 1);
    store.ingest_at(UPDATE_STARTD_AD, restarted, None, None, 2);
    assert_eq!(store.stats().get("Machine").unwrap().lost, 0);
}

#[test]
fn extreme_sequence_jump_is_counted() {
    let store = RegistryStore::new(StoreConfig::default());
    let master = |n: i64| {
        Ad::new()
            .with("Name", "cm")
            .with("UpdateSequenceNumber", n)
            .with("DaemonStartTime", 1)
    };
    store.ingest_at(UPDATE_MASTER_AD, master(-9_000_000_000_000_000_000), None, None, 1);
    let r = store.ingest_at(UPDATE_MASTER_AD, master(9_000_000_000_000_000_000), None, None, 2);
    assert_eq!(r.outcome, IngestOutcome::Updated);
    let stats = store.stats().get("DaemonMaster").unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.lost, 17_999_999_999_999_999_999);
}

#[test]
fn generic_query_by_target_type() {
    let store = RegistryStore::new(StoreConfig::default());
    for (my_type, name) in [("Accounting", "group_a"), ("Accounting", "group_b"), ("Defrag", "d1")] {
        let ad = Ad::new().with("MyType", my_type).with("Name", name);
        store.ingest_at(UPDATE_AD_GENERIC, ad, None, None, 1);
    }
    let spec = QuerySpec::from_query_ad(requirements("true").with("TargetType", "accounting")).unwrap();
    assert_eq!(store.evaluate(AdType::Generic, &spec).count(), 2);
    let spec = QuerySpec::from_query_ad(requirements("true")).unwrap();
    assert_eq!(store.evaluate(AdType::Generic, &spec).count(), 3);
}

/// Writers, invalidations, sweeps and scans all running at once. Time is
/// pinned at 1000 so only ads written at 100 are stale.
#[test]
fn concurrent_writers_sweeps_and_scans() {
    const HOT: usize = 64;
    const DOOMED: usize = 32;
    const MANAGERS: usize = 8;
    let store = Arc::new(RegistryStore::new(StoreConfig {
        classad_lifetime: 60,
        ..StoreConfig::default()
    }));
    let hk = Housekeeper::new(Arc::clone(&store), Arc::new(LogNotifier));
    let hot = |i: usize| format!("hot{}@a", i);
    let manager = |name: String| Ad::new().with("Name", name);

    for i in 0..HOT {
        store.ingest_at(UPDATE_STARTD_AD, worker(&hot(i), 0), Some(Ad::new()), None, 100);
    }
    for i in 0..DOOMED {
        let ad = worker(&format!("doomed{}@a", i), 0).with("Doomed", true);
        store.ingest_at(UPDATE_STARTD_AD, ad, Some(Ad::new()), None, 1000);
    }
    for i in 0..MANAGERS {
        store.ingest_at(UPDATE_MASTER_AD, manager(format!("live{}", i)), None, None, 100);
        store.ingest_at(UPDATE_MASTER_AD, manager(format!("dead{}", i)), None, None, 100);
    }

    let workers = store.collection(AdType::WorkerNode).unwrap();
    let managers = store.collection(AdType::Manager).unwrap();
    let everything = QuerySpec::from_query_ad(requirements("true")).unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for round in 0..50 {
                    for i in 0..HOT {
                        let ad = worker(&hot(i), round);
                        store.ingest_at(UPDATE_STARTD_AD, ad, Some(Ad::new()), None, 1000);
                        // fresh, so no sweep may take it
                        let key = IdentityKey::with_addr(hot(i), "10.1.1.1");
                        assert!(workers.lookup(&key).is_some());
                    }
                    for i in 0..MANAGERS {
                        store.ingest_at(UPDATE_MASTER_AD, manager(format!("live{}", i)), None, None, 1000);
                    }
                }
            });
        }
        s.spawn(|| {
            for _ in 0..200 {
                hk.sweep_at(1000);
            }
        });
        s.spawn(|| {
            for _ in 0..50 {
                store.invalidate(AdType::WorkerNode, &requirements("Doomed =?= true")).unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..200 {
                let mut seen = HashSet::new();
                for ad in store.evaluate(AdType::WorkerNode, &everything) {
                    let name = ad.lookup_string("Name").unwrap();
                    assert!(ad.lookup_int("Memory").is_some(), "{}", name);
                    assert!(ad.lookup_int("LastHeardFrom").is_some(), "{}", name);
                    assert!(seen.insert(name));
                }
                assert!(seen.len() <= HOT + DOOMED);
                for ad in store.evaluate(AdType::Manager, &everything) {
                    assert!(ad.lookup_string("Name").is_some());
                }
            }
        });
    });

    // walk departed managers through to removal
    for _ in 0..4 {
        hk.sweep_at(1000);
    }
    assert_eq!(workers.len(), HOT);
    assert_eq!(store.collection(AdType::WorkerNodePrivate).unwrap().len(), HOT);
    for i in 0..HOT {
        assert!(workers.lookup(&IdentityKey::with_addr(hot(i), "10.1.1.1")).is_some());
    }
    assert_eq!(managers.len(), MANAGERS);
    for i in 0..MANAGERS {
        assert!(managers.lookup(&IdentityKey::named(format!("live{}", i))).is_some());
    }
}
