//! Runs against a local etcd at http://127.0.0.1:2379:
//! `cargo test --test etcd_discovery -- --ignored`

use discovery_rs::{
    LeaseRegistrar, Membership, MembershipWatcher, NodeData, Operation, RegistryOption,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

const ETCD_URL: &str = "http://127.0.0.1:2379";
const SERVICE_NAME: &str = "query";

fn endpoints() -> Vec<String> {
    vec![ETCD_URL.to_string()]
}

fn registry_dir() -> String {
    format!("/discovery-test-{}", Uuid::new_v4())
}

fn node_id(seq: u16) -> String {
    format!("127.0.0.1:{}", 8000 + seq)
}

fn new_registry(
    registry_dir: &str,
    seq: u16,
) -> (Arc<LeaseRegistrar>, JoinHandle<discovery_rs::Result<()>>) {
    let option = RegistryOption::new(endpoints(), registry_dir, SERVICE_NAME, node_id(seq))
        .with_node_data(NodeData::from([("foo".to_string(), "bar".to_string())]))
        .with_ttl(10);
    let registry = Arc::new(LeaseRegistrar::new(option).expect("Failed to create registry"));
    let handle = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move { registry.run_loop().await }
    });
    (registry, handle)
}

/// Apply batches until `membership` matches `want` or `within` elapses.
async fn converge(
    watcher: &mut MembershipWatcher,
    membership: &mut Membership,
    want: &[String],
    within: Duration,
) {
    let deadline = tokio::time::Instant::now() + within;
    while membership.addrs() != want {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let updates = timeout(remaining, watcher.next())
            .await
            .unwrap_or_else(|_| panic!("backends {:?}, want {:?}", membership.addrs(), want))
            .expect("watch failed");
        membership.apply(&updates);
    }
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_watcher_follows_registrations() {
    let registry_dir = registry_dir();
    let mut watcher = MembershipWatcher::new(&registry_dir, SERVICE_NAME, &endpoints())
        .await
        .expect("Failed to create watcher");
    let mut membership = Membership::new();
    membership.apply(&watcher.next().await.unwrap());
    assert!(membership.is_empty());

    let mut regs = HashMap::new();
    let mut want = Vec::new();
    for seq in 0..5 {
        regs.insert(seq, new_registry(&registry_dir, seq));
        want.push(node_id(seq));
    }
    want.sort();
    converge(&mut watcher, &mut membership, &want, Duration::from_secs(10)).await;
    for addr in &want {
        assert_eq!(membership.get(addr).and_then(|d| d.get("foo")).map(String::as_str), Some("bar"));
    }

    let (registry, handle) = regs.remove(&2).unwrap();
    registry.close();
    handle.await.unwrap().expect("clean shutdown");
    want.retain(|addr| *addr != node_id(2));
    converge(&mut watcher, &mut membership, &want, Duration::from_secs(15)).await;

    for (registry, handle) in regs.into_values() {
        registry.close();
        handle.await.unwrap().unwrap();
    }
    watcher.close();
    assert!(watcher.next().await.unwrap_err().is_cancelled());
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_snapshot_then_crash_leave() {
    let registry_dir = registry_dir();
    let (a, a_handle) = new_registry(&registry_dir, 0);
    let (b, b_handle) = new_registry(&registry_dir, 1);
    sleep(Duration::from_secs(2)).await;
    assert!(a.lease_id().is_some() && b.lease_id().is_some());

    let mut watcher = MembershipWatcher::new(&registry_dir, SERVICE_NAME, &endpoints())
        .await
        .unwrap();
    let snapshot = watcher.next().await.unwrap();
    let mut addrs: Vec<String> = snapshot.iter().map(|u| u.addr.clone()).collect();
    addrs.sort();
    assert_eq!(addrs, vec![node_id(0), node_id(1)]);
    assert!(snapshot.iter().all(|u| u.op == Operation::Add));

    // Stop renewing A without revoking its lease.
    a_handle.abort();
    let updates = timeout(Duration::from_secs(15), watcher.next())
        .await
        .expect("A expires within its ttl")
        .unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].op, Operation::Delete);
    assert_eq!(updates[0].addr, node_id(0));

    b.close();
    b_handle.await.unwrap().unwrap();
}

#[tokio::test]
#[ignore = "requires a running etcd"]
async fn test_unreachable_endpoint() {
    let endpoints = vec!["http://127.0.0.1:1".to_string()];
    let result = MembershipWatcher::new("/discovery", SERVICE_NAME, &endpoints).await;
    assert!(matches!(result, Err(discovery_rs::DiscoveryError::Connection { .. })));
}
