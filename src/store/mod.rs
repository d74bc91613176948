//! Key-value store surface consumed by the registrar and the watcher.
//!
//! The store must offer atomic puts, leases with keepalive/revoke, prefix
//! reads reporting the read revision, and prefix watches anchored at a
//! revision. [`etcd::EtcdStore`] is the production backend;
//! [`memory::MemoryStore`] runs in-process.

pub mod etcd;
pub mod memory;

use crate::error::StoreResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use etcd::{EtcdConnector, EtcdStore};
pub use memory::{FailPoint, MemoryStore};

/// Store-wide mutation version.
pub type Revision = i64;

/// Store-issued lease handle.
pub type LeaseId = i64;

/// Lease id meaning "not bound to a lease".
pub const NO_LEASE: LeaseId = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Result of a consistent prefix read.
#[derive(Debug, Clone)]
pub struct PrefixSnapshot {
    pub entries: Vec<KeyValue>,
    /// Store revision the read was served at
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Put of a key that did not exist
    Create,
    /// Put of an existing key
    Modify,
    Delete,
    /// Raw type code of an event the client does not know
    Other(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletions
    pub value: Vec<u8>,
    /// Revision of the mutation that produced the event
    pub revision: Revision,
}

/// One watch response: the events of a store revision range, in store order.
///
/// A large backlog may arrive as several batches sharing one header
/// `revision`; use the per-event revisions to track progress.
#[derive(Debug, Clone)]
pub struct WatchBatch {
    /// Store revision reported in the response header
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Keepalive acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseAck {
    pub id: LeaseId,
    /// Remaining TTL in seconds after renewal
    pub ttl: i64,
}

/// Ends (yields `None`) when the cancellation token fires.
pub type KeepAliveStream = BoxStream<'static, StoreResult<LeaseAck>>;

/// Ends (yields `None`) when the cancellation token fires.
pub type WatchStream = BoxStream<'static, StoreResult<WatchBatch>>;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Grant a lease with the given TTL in seconds.
    async fn grant_lease(&self, ttl: i64) -> StoreResult<LeaseId>;

    /// Write `key` bound to `lease` ([`NO_LEASE`] for none). Returns the revision of the write.
    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> StoreResult<Revision>;

    /// Renew `lease` every `interval` until `cancel` fires.
    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
        cancel: CancellationToken,
    ) -> StoreResult<KeepAliveStream>;

    /// Revoke `lease`, deleting every key attached to it.
    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;

    /// Read every key under `prefix` at the current revision.
    async fn get_prefix(&self, prefix: &str) -> StoreResult<PrefixSnapshot>;

    /// Watch every mutation under `prefix` from revision `from` (inclusive).
    async fn watch_prefix(
        &self,
        prefix: &str,
        from: Revision,
        cancel: CancellationToken,
    ) -> StoreResult<WatchStream>;
}

/// Opens store clients from a list of endpoints.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Store: Store;

    async fn connect(&self, endpoints: &[String]) -> StoreResult<Self::Store>;
}
