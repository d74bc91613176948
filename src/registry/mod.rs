pub mod registrar;


use crate::error::{DiscoveryError, Result};
use std::collections::HashMap;
use std::time::Duration;

pub use registrar::{LeaseRegistrar, RegistrarState};

/// Value part of a registered key.
pub type NodeData = HashMap<String, String>;

/// Configuration of a [`LeaseRegistrar`].
///
/// The registered key is `{registry_dir}/{service_name}/{node_id}`.
#[derive(Debug, Clone)]
pub struct RegistryOption {
    /// etcd urls
    pub endpoints: Vec<String>,
    pub registry_dir: String,
    pub service_name: String,
    pub node_id: String,
    pub node_data: NodeData,
    /// TTL of the key in seconds
    pub ttl: i64,
    /// Defaults to a third of the TTL, at least one second.
    pub keepalive_interval: Option<Duration>,
    /// Revoke the lease when the loop is closed instead of letting it expire.
    pub revoke_on_close: bool,
    pub revoke_timeout: Duration,
}

impl RegistryOption {
    pub fn new(
        endpoints: Vec<String>,
        registry_dir: impl Into<String>,
        service_name: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            endpoints,
            registry_dir: registry_dir.into(),
            service_name: service_name.into(),
            node_id: node_id.into(),
            node_data: NodeData::new(),
            ttl: crate::config::DEFAULT_TTL,
            keepalive_interval: None,
            revoke_on_close: true,
            revoke_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_node_data(mut self, node_data: NodeData) -> Self {
        self.node_data = node_data;
        self
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    pub fn with_revoke_on_close(mut self, revoke: bool) -> Self {
        self.revoke_on_close = revoke;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(DiscoveryError::configuration("no endpoints configured"));
        }
        if self.service_name.is_empty() {
            return Err(DiscoveryError::configuration("service name is empty"));
        }
        if self.node_id.is_empty() {
            return Err(DiscoveryError::configuration("node id is empty"));
        }
        if self.node_id.contains('/') {
            return Err(DiscoveryError::configuration(format!(
                "node id {:?} must not contain '/'",
                self.node_id
            )));
        }
        if self.ttl <= 0 {
            return Err(DiscoveryError::configuration(format!(
                "ttl must be positive, got {}",
                self.ttl
            )));
        }
        if matches!(self.keepalive_interval, Some(interval) if interval.is_zero()) {
            return Err(DiscoveryError::configuration("keepalive interval is zero"));
        }
        Ok(())
    }

    pub(crate) fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
            .unwrap_or_else(|| Duration::from_secs((self.ttl / 3).max(1) as u64))
    }
}

/// Prefix under which every node of a service is registered, with trailing separator.
pub fn service_prefix(registry_dir: &str, service_name: &str) -> String {
    format!("{}/{}/", registry_dir.trim_end_matches('/'), service_name)
}

pub fn node_key(registry_dir: &str, service_name: &str, node_id: &str) -> String {
    format!("{}{}", service_prefix(registry_dir, service_name), node_id)
}
