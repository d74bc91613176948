use super::{node_key, RegistryOption};
use crate::error::{DiscoveryError, Result, StoreError};
use crate::store::{Connector, EtcdConnector, LeaseId, Store};
use futures_util::StreamExt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrarState {
    /// `run_loop` not started
    Idle,
    /// Connecting and granting the lease
    Connecting,
    /// Key attached to the lease and kept alive
    Registered { lease_id: LeaseId },
    /// Loop returned after `close()`
    Closed,
    /// Loop returned with an error, see `err()`
    Failed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps one node key alive in the store under a lease.
///
/// Construction only validates and serializes; the store is contacted by
/// [`run_loop`](Self::run_loop), which is meant to run on its own task:
///
/// ```no_run
/// # use std::sync::Arc;
/// # use discovery_rs::registry::{LeaseRegistrar, RegistryOption};
/// # async fn demo() -> discovery_rs::error::Result<()> {
/// let option = RegistryOption::new(vec!["http://127.0.0.1:2379".into()], "/discovery", "query", "10.0.0.1:8000");
/// let registrar = Arc::new(LeaseRegistrar::new(option)?);
/// let handle = tokio::spawn({
///     let registrar = Arc::clone(&registrar);
///     async move { registrar.run_loop().await }
/// });
/// // ...
/// registrar.close();
/// handle.await.expect("registrar task panicked")?;
/// # Ok(())
/// # }
/// ```
pub struct LeaseRegistrar<C: Connector = EtcdConnector> {
    connector: C,
    endpoints: Vec<String>,
    key: String,
    value: Vec<u8>,
    ttl: i64,
    keepalive_interval: Duration,
    revoke_on_close: bool,
    revoke_timeout: Duration,
    cancel: CancellationToken,
    state: Mutex<RegistrarState>,
    err: Mutex<Option<DiscoveryError>>,
}

impl LeaseRegistrar<EtcdConnector> {
    /// Registrar against an etcd cluster.
    pub fn new(option: RegistryOption) -> Result<Self> {
        Self::with_connector(EtcdConnector::default(), option)
    }
}

impl<C: Connector> LeaseRegistrar<C> {
    pub fn with_connector(connector: C, option: RegistryOption) -> Result<Self> {
        option.validate()?;
        let value = serde_json::to_vec(&option.node_data).map_err(|e| {
            DiscoveryError::configuration(format!("cannot serialize node data: {}", e))
        })?;

        Ok(Self {
            connector,
            key: node_key(&option.registry_dir, &option.service_name, &option.node_id),
            keepalive_interval: option.keepalive_interval(),
            endpoints: option.endpoints,
            value,
            ttl: option.ttl,
            revoke_on_close: option.revoke_on_close,
            revoke_timeout: option.revoke_timeout,
            cancel: CancellationToken::new(),
            state: Mutex::new(RegistrarState::Idle),
            err: Mutex::new(None),
        })
    }

    /// Registered key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> RegistrarState {
        *lock(&self.state)
    }

    /// Lease currently holding the key, if registered.
    pub fn lease_id(&self) -> Option<LeaseId> {
        match self.state() {
            RegistrarState::Registered { lease_id } => Some(lease_id),
            _ => None,
        }
    }

    /// Error that ended the last `run_loop`, if any.
    pub fn err(&self) -> Option<DiscoveryError> {
        lock(&self.err).clone()
    }

    /// Stop `run_loop`. Does not wait for the key to be removed.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!(key = %self.key, "Closing registration");
            self.cancel.cancel();
        }
    }

    fn set_state(&self, state: RegistrarState) {
        *lock(&self.state) = state;
    }

    /// Register the key and keep it alive until closed or a store failure.
    ///
    /// Returns `Ok(())` after `close()`. Failures before the keepalive stream
    /// is running are terminal; build a new registrar to retry.
    pub async fn run_loop(&self) -> Result<()> {
        *lock(&self.err) = None;
        if self.cancel.is_cancelled() {
            self.set_state(RegistrarState::Closed);
            return Ok(());
        }

        let result = self.register().await;
        match &result {
            Ok(()) => {
                self.set_state(RegistrarState::Closed);
                info!(key = %self.key, "Registration loop stopped");
            }
            Err(e) => {
                error!(key = %self.key, error = %e, "Registration loop failed");
                self.set_state(RegistrarState::Failed);
                *lock(&self.err) = Some(e.clone());
            }
        }
        result
    }

    /// `None` once the registrar is closed.
    async fn until_cancelled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = fut => Some(output),
        }
    }

    async fn register(&self) -> Result<()> {
        self.set_state(RegistrarState::Connecting);
        let store = match self.until_cancelled(self.connector.connect(&self.endpoints)).await {
            Some(store) => store.map_err(|e| DiscoveryError::connection(&self.endpoints, e))?,
            None => return Ok(()),
        };

        let lease = match self.until_cancelled(store.grant_lease(self.ttl)).await {
            Some(lease) => lease.map_err(|e| {
                DiscoveryError::lease(format!("grant lease with ttl {}", self.ttl), e)
            })?,
            None => return Ok(()),
        };
        debug!(key = %self.key, lease_id = lease, ttl = self.ttl, "Lease granted");

        let result = self.keep_registered(&store, lease).await;
        self.release(&store, lease).await;
        result
    }

    async fn keep_registered(&self, store: &C::Store, lease: LeaseId) -> Result<()> {
        let put = self.until_cancelled(store.put(&self.key, self.value.clone(), lease));
        let revision = match put.await {
            Some(revision) => {
                revision.map_err(|e| DiscoveryError::registration(self.key.clone(), e))?
            }
            None => return Ok(()),
        };
        self.set_state(RegistrarState::Registered { lease_id: lease });
        info!(key = %self.key, lease_id = lease, revision = revision, "Registered node");

        let keep_alive = store.keep_alive(lease, self.keepalive_interval, self.cancel.clone());
        let mut acks = match self.until_cancelled(keep_alive).await {
            Some(acks) => acks.map_err(|e| DiscoveryError::lease("open keepalive stream", e))?,
            None => return Ok(()),
        };

        // The stream ends only when the token is cancelled.
        while let Some(ack) = acks.next().await {
            match ack {
                Ok(ack) => trace!(key = %self.key, lease_id = ack.id, ttl = ack.ttl, "Lease renewed"),
                Err(e @ StoreError::LeaseExpired { .. }) => {
                    return Err(DiscoveryError::lease("renew lease", e));
                }
                Err(e) => return Err(DiscoveryError::stream("keepalive", e)),
            }
        }
        Ok(())
    }

    async fn release(&self, store: &C::Store, lease: LeaseId) {
        if !self.revoke_on_close {
            return;
        }
        match tokio::time::timeout(self.revoke_timeout, store.revoke_lease(lease)).await {
            Ok(Ok(())) => debug!(key = %self.key, lease_id = lease, "Lease revoked"),
            Ok(Err(e)) => warn!(key = %self.key, lease_id = lease, error = %e, "Failed to revoke lease"),
            Err(_) => warn!(key = %self.key, lease_id = lease, "Timed out revoking lease"),
        }
    }
}
