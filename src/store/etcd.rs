use super::{
    Connector, EventKind, KeepAliveStream, KeyValue, LeaseAck, LeaseId, PrefixSnapshot, Revision,
    Store, WatchBatch, WatchEvent, WatchStream, NO_LEASE,
};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects [`EtcdStore`]s and verifies the cluster answers before handing them out.
#[derive(Debug, Clone)]
pub struct EtcdConnector {
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
}

impl Default for EtcdConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
        }
    }
}

impl EtcdConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Per-request deadline. Must exceed the keepalive interval, streams share it.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connector for EtcdConnector {
    type Store = EtcdStore;

    async fn connect(&self, endpoints: &[String]) -> StoreResult<EtcdStore> {
        if endpoints.is_empty() {
            return Err(StoreError::unavailable("no endpoints configured"));
        }

        let mut options = ConnectOptions::new().with_connect_timeout(self.connect_timeout);
        if let Some(timeout) = self.request_timeout {
            options = options.with_timeout(timeout);
        }
        let mut client = Client::connect(endpoints, Some(options)).await?;

        // The channel connects lazily; a status call proves a member answers.
        let status = client.status().await?;
        debug!(version = %status.version(), endpoints = ?endpoints, "Connected to etcd");

        Ok(EtcdStore { client })
    }
}

/// [`Store`] over an etcd v3 cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn convert_event(event: &etcd_client::Event) -> StoreResult<WatchEvent> {
    let kv = event
        .kv()
        .ok_or_else(|| StoreError::malformed("watch event without key-value"))?;
    let key = kv.key_str()?.to_string();
    let kind = match event.event_type() {
        EventType::Put if kv.create_revision() == kv.mod_revision() => EventKind::Create,
        EventType::Put => EventKind::Modify,
        EventType::Delete => EventKind::Delete,
    };
    Ok(WatchEvent {
        kind,
        key,
        value: kv.value().to_vec(),
        revision: kv.mod_revision(),
    })
}

#[async_trait]
impl Store for EtcdStore {
    async fn grant_lease(&self, ttl: i64) -> StoreResult<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await?;
        debug!(lease_id = resp.id(), ttl = resp.ttl(), "Lease granted");
        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> StoreResult<Revision> {
        let mut client = self.client.clone();
        let options = (lease != NO_LEASE).then(|| PutOptions::new().with_lease(lease));
        let resp = client.put(key, value, options).await?;
        let revision = resp
            .header()
            .map(|h| h.revision())
            .ok_or_else(|| StoreError::malformed("put response without header"))?;
        Ok(revision)
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
        cancel: CancellationToken,
    ) -> StoreResult<KeepAliveStream> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client.lease_keep_alive(lease).await?;

        let stream = async_stream::stream! {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = keeper.keep_alive().await {
                    yield Err(StoreError::from(e));
                    break;
                }

                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = responses.message() => message,
                };
                match message {
                    Ok(Some(resp)) if resp.ttl() <= 0 => {
                        yield Err(StoreError::LeaseExpired { lease_id: lease });
                        break;
                    }
                    Ok(Some(resp)) => {
                        trace!(lease_id = lease, ttl = resp.ttl(), "Keep-alive OK");
                        yield Ok(LeaseAck { id: resp.id(), ttl: resp.ttl() });
                    }
                    Ok(None) => {
                        yield Err(StoreError::StreamClosed);
                        break;
                    }
                    Err(e) => {
                        yield Err(StoreError::from(e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        debug!(lease_id = lease, "Lease revoked");
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<PrefixSnapshot> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp
            .header()
            .map(|h| h.revision())
            .ok_or_else(|| StoreError::malformed("range response without header"))?;

        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            entries.push(KeyValue {
                key: kv.key_str()?.to_string(),
                value: kv.value().to_vec(),
            });
        }
        Ok(PrefixSnapshot { entries, revision })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        from: Revision,
        cancel: CancellationToken,
    ) -> StoreResult<WatchStream> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from);
        let (mut watcher, mut responses) = client.watch(prefix, Some(options)).await?;
        debug!(prefix = %prefix, from = from, "Watch stream established");

        let stream = async_stream::stream! {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = watcher.cancel().await {
                            warn!(error = %e, "Failed to cancel etcd watch");
                        }
                        break;
                    }
                    message = responses.message() => message,
                };

                match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            if resp.compact_revision() > 0 {
                                yield Err(StoreError::Compacted { revision: resp.compact_revision() });
                            } else {
                                yield Err(StoreError::WatchCanceled { reason: resp.cancel_reason().to_string() });
                            }
                            break;
                        }

                        let revision = match resp.header() {
                            Some(header) => header.revision(),
                            None => {
                                yield Err(StoreError::malformed("watch response without header"));
                                break;
                            }
                        };
                        let events: StoreResult<Vec<WatchEvent>> =
                            resp.events().iter().map(convert_event).collect();
                        match events {
                            Ok(events) => yield Ok(WatchBatch { revision, events }),
                            Err(e) => {
                                yield Err(e);
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        yield Err(StoreError::StreamClosed);
                        break;
                    }
                    Err(e) => {
                        yield Err(StoreError::from(e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
