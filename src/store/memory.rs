//! In-process store with etcd's revision, lease and watch semantics.
//!
//! Every mutation bumps the store revision and is published as one
//! [`WatchBatch`]. Leases expire on the tokio clock, so tests running with
//! paused time see expiry without waiting in real time. Only the most recent
//! [`DEFAULT_HISTORY_LIMIT`] batches are kept for watches; older revisions
//! are compacted automatically.

use super::{
    Connector, EventKind, KeepAliveStream, KeyValue, LeaseAck, LeaseId, PrefixSnapshot, Revision,
    Store, WatchBatch, WatchEvent, WatchStream, NO_LEASE,
};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const EVENT_CAPACITY: usize = 1024;

/// Watch history retained before the oldest revisions are compacted.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// Store operation that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    GrantLease,
    Put,
    /// Opening a keepalive stream
    KeepAlive,
    /// Renewals on an open keepalive stream
    Renew,
    RevokeLease,
}

struct Entry {
    value: Vec<u8>,
    lease: LeaseId,
}

struct LeaseEntry {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct State {
    revision: Revision,
    compacted: Revision,
    next_lease: LeaseId,
    reachable: bool,
    fail_points: HashSet<FailPoint>,
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseEntry>,
    history: VecDeque<WatchBatch>,
    history_limit: usize,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<WatchBatch>,
}

/// Cheaply cloneable handle; clones share one keyspace.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn filter_batch(batch: &WatchBatch, prefix: &str) -> Option<WatchBatch> {
    let events: Vec<WatchEvent> = batch
        .events
        .iter()
        .filter(|e| e.key.starts_with(prefix))
        .cloned()
        .collect();
    (!events.is_empty()).then(|| WatchBatch {
        revision: batch.revision,
        events,
    })
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `events` as one revision and publish them. No-op when empty.
    fn commit(&self, state: &mut State, mut events: Vec<WatchEvent>) -> Revision {
        if events.is_empty() {
            return state.revision;
        }
        state.revision += 1;
        for event in &mut events {
            event.revision = state.revision;
        }
        let batch = WatchBatch {
            revision: state.revision,
            events,
        };
        state.history.push_back(batch.clone());
        while state.history.len() > state.history_limit {
            if let Some(oldest) = state.history.pop_front() {
                state.compacted = oldest.revision;
            }
        }
        // No receivers is fine.
        let _ = self.events.send(batch);
        state.revision
    }

    fn check(&self, point: FailPoint) -> StoreResult<()> {
        if self.lock().fail_points.contains(&point) {
            return Err(StoreError::unavailable(format!("{:?} failed", point)));
        }
        Ok(())
    }

    /// Push the lease deadline one TTL out. `None` if the lease is gone.
    fn renew(&self, lease: LeaseId) -> Option<i64> {
        let mut state = self.lock();
        let entry = state.leases.get_mut(&lease)?;
        entry.deadline = Instant::now() + Duration::from_secs(entry.ttl as u64);
        Some(entry.ttl)
    }

    fn remove_lease(&self, state: &mut State, lease: LeaseId) -> StoreResult<Revision> {
        let entry = state
            .leases
            .remove(&lease)
            .ok_or(StoreError::LeaseNotFound { lease_id: lease })?;
        let mut events = Vec::with_capacity(entry.keys.len());
        for key in entry.keys {
            if state.kvs.remove(&key).is_some() {
                events.push(WatchEvent {
                    kind: EventKind::Delete,
                    key,
                    value: Vec::new(),
                    revision: 0,
                });
            }
        }
        Ok(self.commit(state, events))
    }
}

async fn reap_lease(inner: Weak<Inner>, lease: LeaseId) {
    loop {
        let deadline = {
            let Some(inner) = inner.upgrade() else { return };
            let state = inner.lock();
            let Some(entry) = state.leases.get(&lease) else { return };
            entry.deadline
        };
        tokio::time::sleep_until(deadline).await;

        let Some(inner) = inner.upgrade() else { return };
        let mut state = inner.lock();
        let expired = match state.leases.get(&lease) {
            Some(entry) => entry.deadline <= Instant::now(),
            None => return,
        };
        if expired {
            let revision = inner.remove_lease(&mut state, lease);
            debug!(lease_id = lease, revision = ?revision, "Lease expired");
            return;
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Store that keeps at most `limit` batches of watch history.
    pub fn with_history_limit(limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    revision: 1,
                    compacted: 0,
                    next_lease: 1,
                    reachable: true,
                    fail_points: HashSet::new(),
                    kvs: BTreeMap::new(),
                    leases: HashMap::new(),
                    history: VecDeque::new(),
                    history_limit: limit.max(1),
                }),
                events,
            }),
        }
    }

    /// Make `connect` fail, as if no endpoint answered.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// Make every later call of `point` fail with `Unavailable` until disabled.
    pub fn set_fail_point(&self, point: FailPoint, enabled: bool) {
        let mut state = self.inner.lock();
        if enabled {
            state.fail_points.insert(point);
        } else {
            state.fail_points.remove(&point);
        }
    }

    pub fn revision(&self) -> Revision {
        self.inner.lock().revision
    }

    /// Delete a key regardless of its lease.
    pub fn delete(&self, key: &str) -> Revision {
        let mut state = self.inner.lock();
        let Some(entry) = state.kvs.remove(key) else {
            return state.revision;
        };
        if let Some(lease) = state.leases.get_mut(&entry.lease) {
            lease.keys.remove(key);
        }
        let event = WatchEvent {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: Vec::new(),
            revision: 0,
        };
        self.inner.commit(&mut state, vec![event])
    }

    /// Discard history up to and including `revision`.
    pub fn compact(&self, revision: Revision) {
        let mut state = self.inner.lock();
        let revision = revision.min(state.revision);
        state.history.retain(|b| b.revision > revision);
        state.compacted = state.compacted.max(revision);
    }

    pub fn lease_exists(&self, lease: LeaseId) -> bool {
        self.inner.lock().leases.contains_key(&lease)
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        self.inner.lock().leases.len()
    }

    /// Oldest revision no longer available to watches, 0 if none.
    pub fn compacted(&self) -> Revision {
        self.inner.lock().compacted
    }

    /// Publish events as one revision without touching the keyspace.
    #[cfg(test)]
    pub(crate) fn inject(&self, events: Vec<WatchEvent>) -> Revision {
        let mut state = self.inner.lock();
        self.inner.commit(&mut state, events)
    }
}

#[async_trait]
impl Connector for MemoryStore {
    type Store = MemoryStore;

    async fn connect(&self, endpoints: &[String]) -> StoreResult<MemoryStore> {
        if endpoints.is_empty() {
            return Err(StoreError::unavailable("no endpoints configured"));
        }
        if !self.inner.lock().reachable {
            return Err(StoreError::unavailable(format!(
                "no endpoint reachable: {}",
                endpoints.join(",")
            )));
        }
        Ok(self.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn grant_lease(&self, ttl: i64) -> StoreResult<LeaseId> {
        self.inner.check(FailPoint::GrantLease)?;
        if ttl <= 0 {
            return Err(StoreError::malformed(format!("invalid lease ttl {}", ttl)));
        }
        let lease = {
            let mut state = self.inner.lock();
            let lease = state.next_lease;
            state.next_lease += 1;
            state.leases.insert(
                lease,
                LeaseEntry {
                    ttl,
                    deadline: Instant::now() + Duration::from_secs(ttl as u64),
                    keys: BTreeSet::new(),
                },
            );
            lease
        };
        tokio::spawn(reap_lease(Arc::downgrade(&self.inner), lease));
        debug!(lease_id = lease, ttl = ttl, "Lease granted");
        Ok(lease)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> StoreResult<Revision> {
        self.inner.check(FailPoint::Put)?;
        let mut state = self.inner.lock();
        if lease != NO_LEASE && !state.leases.contains_key(&lease) {
            return Err(StoreError::LeaseNotFound { lease_id: lease });
        }

        let previous = state.kvs.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        let kind = match previous {
            Some(previous) => {
                if previous.lease != lease {
                    if let Some(old) = state.leases.get_mut(&previous.lease) {
                        old.keys.remove(key);
                    }
                }
                EventKind::Modify
            }
            None => EventKind::Create,
        };
        if let Some(entry) = state.leases.get_mut(&lease) {
            entry.keys.insert(key.to_string());
        }

        let event = WatchEvent {
            kind,
            key: key.to_string(),
            value,
            revision: 0,
        };
        Ok(self.inner.commit(&mut state, vec![event]))
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
        cancel: CancellationToken,
    ) -> StoreResult<KeepAliveStream> {
        self.inner.check(FailPoint::KeepAlive)?;
        if !self.lease_exists(lease) {
            return Err(StoreError::LeaseNotFound { lease_id: lease });
        }
        let inner = Arc::clone(&self.inner);

        let stream = async_stream::stream! {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = inner.check(FailPoint::Renew) {
                    yield Err(e);
                    break;
                }
                match inner.renew(lease) {
                    Some(ttl) => {
                        trace!(lease_id = lease, ttl = ttl, "Keep-alive OK");
                        yield Ok(LeaseAck { id: lease, ttl });
                    }
                    None => {
                        yield Err(StoreError::LeaseExpired { lease_id: lease });
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.inner.check(FailPoint::RevokeLease)?;
        let mut state = self.inner.lock();
        let revision = self.inner.remove_lease(&mut state, lease)?;
        debug!(lease_id = lease, revision = revision, "Lease revoked");
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<PrefixSnapshot> {
        let state = self.inner.lock();
        let entries = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        Ok(PrefixSnapshot {
            entries,
            revision: state.revision,
        })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        from: Revision,
        cancel: CancellationToken,
    ) -> StoreResult<WatchStream> {
        // Backlog and subscription are taken under one lock so no batch is
        // missed or seen twice.
        let (backlog, compacted, mut receiver) = {
            let state = self.inner.lock();
            let from = if from <= 0 { state.revision + 1 } else { from };
            let compacted = (from <= state.compacted).then_some(state.compacted);
            let backlog: Vec<WatchBatch> = state
                .history
                .iter()
                .filter(|b| b.revision >= from)
                .filter_map(|b| filter_batch(b, prefix))
                .collect();
            (backlog, compacted, self.inner.events.subscribe())
        };
        let prefix = prefix.to_string();

        let stream = async_stream::stream! {
            if let Some(revision) = compacted {
                yield Err(StoreError::Compacted { revision });
                return;
            }
            for batch in backlog {
                yield Ok(batch);
            }
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = receiver.recv() => received,
                };
                match received {
                    Ok(batch) => {
                        if let Some(batch) = filter_batch(&batch, &prefix) {
                            yield Ok(batch);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        yield Err(StoreError::Lagged { skipped });
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        yield Err(StoreError::StreamClosed);
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
