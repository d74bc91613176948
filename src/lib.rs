//! Service discovery on etcd.
//!
//! [`LeaseRegistrar`] keeps a node's key alive under a lease;
//! [`MembershipWatcher`] turns the keys of a service into a stream of
//! [`Update`]s for a consumer such as a load balancer.

pub mod config;
pub mod error;
pub mod naming;
pub mod registry;
pub mod store;
pub mod utils;
pub mod watcher;

pub use config::{
    init_env, DEFAULT_ETCD_ENDPOINTS, DEFAULT_LOG_DIR, DEFAULT_REGISTRY_DIR, DEFAULT_TTL,
    ETCD_ENDPOINTS, LOG_DIR, REGISTRY_DIR,
};
pub use error::{DiscoveryError, Result, StoreError};
pub use naming::{Membership, Operation, Update};
pub use registry::{LeaseRegistrar, NodeData, RegistrarState, RegistryOption};
pub use watcher::{CloseHandle, MembershipWatcher, WatcherState};
