//! Pull-based membership watcher.
//!
//! The first [`MembershipWatcher::next`] call turns a consistent prefix read
//! into `Add` updates; every later call waits for the next batch of changes
//! after the last observed revision.


use crate::error::{DiscoveryError, Result, StoreError};
use crate::naming::Update;
use crate::registry::{service_prefix, NodeData};
use crate::store::{
    Connector, EtcdConnector, EtcdStore, EventKind, Revision, Store, WatchEvent, WatchStream,
};
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Unstarted,
    /// Snapshot delivered at this revision
    Bootstrapped(Revision),
    /// Watching changes after this revision
    Watching(Revision),
    Closed,
}

/// Closes a watcher from another task while `next()` is suspended.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    cancel: CancellationToken,
}

impl CloseHandle {
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct MembershipWatcher<S: Store = EtcdStore> {
    store: S,
    prefix: String,
    revision: Option<Revision>,
    stream: Option<WatchStream>,
    state: WatcherState,
    cancel: CancellationToken,
}

impl MembershipWatcher<EtcdStore> {
    /// Connect to etcd and watch `{registry_dir}/{service_name}/`.
    pub async fn new(
        registry_dir: &str,
        service_name: &str,
        endpoints: &[String],
    ) -> Result<Self> {
        Self::connect(&EtcdConnector::default(), registry_dir, service_name, endpoints).await
    }
}

impl<S: Store> MembershipWatcher<S> {
    pub async fn connect<C>(
        connector: &C,
        registry_dir: &str,
        service_name: &str,
        endpoints: &[String],
    ) -> Result<Self>
    where
        C: Connector<Store = S>,
    {
        let store = connector
            .connect(endpoints)
            .await
            .map_err(|e| DiscoveryError::connection(endpoints, e))?;
        Ok(Self::with_store(store, registry_dir, service_name))
    }

    /// Watcher over an already connected store.
    pub fn with_store(store: S, registry_dir: &str, service_name: &str) -> Self {
        let prefix = service_prefix(registry_dir, service_name);
        debug!(prefix = %prefix, "Created membership watcher");
        Self {
            store,
            prefix,
            revision: None,
            stream: None,
            state: WatcherState::Unstarted,
            cancel: CancellationToken::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Last revision delivered to the caller.
    pub fn revision(&self) -> Option<Revision> {
        self.revision
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Cancel the watcher. Idempotent; any suspended `next()` returns `Cancelled`.
    pub fn close(&mut self) {
        if !self.cancel.is_cancelled() {
            info!(prefix = %self.prefix, "Closing membership watcher");
        }
        self.cancel.cancel();
        self.mark_closed();
    }

    fn mark_closed(&mut self) {
        self.stream = None;
        self.state = WatcherState::Closed;
    }

    /// Current members on the first call, then the next batch of changes.
    ///
    /// Returns [`DiscoveryError::Cancelled`] once the watcher is closed, also
    /// when a batch arrives at the same time as the cancellation. After a
    /// stream error the next call re-opens the watch from the last delivered
    /// revision.
    pub async fn next(&mut self) -> Result<Vec<Update>> {
        if self.cancel.is_cancelled() {
            self.mark_closed();
            return Err(DiscoveryError::Cancelled);
        }

        let result = match self.revision {
            None => self.bootstrap().await,
            Some(revision) => self.wait_for_changes(revision).await,
        };
        if matches!(result, Err(DiscoveryError::Cancelled)) {
            self.mark_closed();
        }
        result
    }

    fn address(&self, key: &str) -> String {
        key.strip_prefix(&self.prefix).unwrap_or(key).to_string()
    }

    fn decode(&self, key: &str, value: &[u8]) -> Result<NodeData> {
        serde_json::from_slice(value).map_err(|e| DiscoveryError::decode(key, e))
    }

    async fn bootstrap(&mut self) -> Result<Vec<Update>> {
        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DiscoveryError::Cancelled),
            read = self.store.get_prefix(&self.prefix) => read,
        };
        let snapshot =
            read.map_err(|e| DiscoveryError::stream(format!("read {}", self.prefix), e))?;

        let mut updates = Vec::with_capacity(snapshot.entries.len());
        for kv in &snapshot.entries {
            let metadata = self.decode(&kv.key, &kv.value)?;
            updates.push(Update::add(self.address(&kv.key), metadata));
        }

        info!(
            prefix = %self.prefix,
            revision = snapshot.revision,
            nodes = updates.len(),
            "Initial membership loaded"
        );
        self.revision = Some(snapshot.revision);
        self.state = WatcherState::Bootstrapped(snapshot.revision);
        Ok(updates)
    }

    async fn open_stream(&mut self, revision: Revision) -> Result<WatchStream> {
        if let Some(stream) = self.stream.take() {
            return Ok(stream);
        }
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DiscoveryError::Cancelled),
            opened = self.store.watch_prefix(&self.prefix, revision + 1, self.cancel.clone()) => opened,
        };
        let stream = opened.map_err(|e| {
            DiscoveryError::stream(format!("watch {} from {}", self.prefix, revision + 1), e)
        })?;
        debug!(prefix = %self.prefix, from = revision + 1, "Watching membership changes");
        Ok(stream)
    }

    async fn wait_for_changes(&mut self, revision: Revision) -> Result<Vec<Update>> {
        let mut stream = self.open_stream(revision).await?;
        self.state = WatcherState::Watching(revision);

        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DiscoveryError::Cancelled),
                item = stream.next() => item,
            };

            let batch = match item {
                Some(Ok(batch)) => batch,
                // The stream only ends by itself when the token fires.
                None if self.cancel.is_cancelled() => return Err(DiscoveryError::Cancelled),
                None => {
                    return Err(DiscoveryError::stream("watch", StoreError::StreamClosed));
                }
                Some(Err(StoreError::Compacted { revision: compacted })) => {
                    warn!(prefix = %self.prefix, revision = revision, compacted = compacted, "Watch revision compacted");
                    return Err(DiscoveryError::Compacted {
                        requested: revision + 1,
                        compacted,
                    });
                }
                Some(Err(e)) => {
                    warn!(prefix = %self.prefix, revision = revision, error = %e, "Watch stream failed");
                    return Err(DiscoveryError::stream("watch", e));
                }
            };

            // Chunks of one backlog share a header revision, so replays are
            // dropped per event, never per batch.
            let events: Vec<WatchEvent> = batch
                .events
                .into_iter()
                .filter(|e| e.revision > revision)
                .collect();
            let Some(latest) = events.iter().map(|e| e.revision).max() else {
                continue;
            };

            // Keep the stream even if the batch fails to decode: the failed
            // batch is consumed and the cursor stays at `revision`.
            let updates = self.convert(&events);
            self.stream = Some(stream);
            let updates = updates?;

            debug!(
                prefix = %self.prefix,
                revision = latest,
                header_revision = batch.revision,
                updates = updates.len(),
                "Membership changed"
            );
            self.revision = Some(latest);
            self.state = WatcherState::Watching(latest);
            return Ok(updates);
        }
    }

    fn convert(&self, events: &[WatchEvent]) -> Result<Vec<Update>> {
        let mut updates = Vec::with_capacity(events.len());
        for event in events {
            match event.kind {
                EventKind::Delete => updates.push(Update::delete(self.address(&event.key))),
                EventKind::Create | EventKind::Modify => {
                    let metadata = self.decode(&event.key, &event.value)?;
                    updates.push(Update::add(self.address(&event.key), metadata));
                }
                EventKind::Other(kind) => {
                    return Err(DiscoveryError::UnsupportedEvent {
                        key: event.key.clone(),
                        kind,
                    });
                }
            }
        }
        Ok(updates)
    }

    /// Batches as a stream; ends once the watcher is closed.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Update>>> + Send {
        futures_util::stream::unfold(self, |mut watcher| async move {
            match watcher.next().await {
                Err(DiscoveryError::Cancelled) => None,
                item => Some((item, watcher)),
            }
        })
    }
}
