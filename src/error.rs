use std::sync::Arc;
use thiserror::Error;

/// Errors produced by a store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// etcd client error
    #[error("etcd client error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// Store cannot be reached
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// Lease unknown to the store
    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: i64 },

    /// Keepalive answered after the lease had already expired
    #[error("lease {lease_id} expired")]
    LeaseExpired { lease_id: i64 },

    /// Requested revision has been compacted away
    #[error("required revision has been compacted, compact revision {revision}")]
    Compacted { revision: i64 },

    /// Watch canceled by the server
    #[error("watch canceled by server: {reason}")]
    WatchCanceled { reason: String },

    /// Stream closed by the server side
    #[error("stream closed by server")]
    StreamClosed,

    /// Watch fell behind the event feed
    #[error("watch lagged behind by {skipped} batches")]
    Lagged { skipped: u64 },

    /// Response missing a field the protocol requires
    #[error("malformed response: {message}")]
    Malformed { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

/// Errors surfaced by the registrar and the watcher.
///
/// Sources are held behind `Arc` so a registrar can record the error it
/// returns and hand it out again from `err()`.
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    /// Invalid input at construction, never retried
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Store could not be reached
    #[error("connection error ({endpoints}): {source}")]
    Connection {
        endpoints: String,
        #[source]
        source: Arc<StoreError>,
    },

    /// Lease grant, keepalive open or renewal failure
    #[error("lease error: {message}: {source}")]
    Lease {
        message: String,
        #[source]
        source: Arc<StoreError>,
    },

    /// Writing the node key failed
    #[error("registration error: {key}: {source}")]
    Registration {
        key: String,
        #[source]
        source: Arc<StoreError>,
    },

    /// A stored value is not a valid node record
    #[error("decode error: {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// Transport failure of a keepalive or watch stream, or of a read
    #[error("stream error: {context}: {source}")]
    Stream {
        context: String,
        #[source]
        source: Arc<StoreError>,
    },

    /// Watch start revision is older than the store's compaction point
    #[error("watch revision {requested} compacted, store compacted up to {compacted}")]
    Compacted { requested: i64, compacted: i64 },

    /// Watch delivered an event kind that is neither put nor delete
    #[error("unsupported event type {kind} for key {key}")]
    UnsupportedEvent { key: String, kind: i32 },

    /// The component was closed
    #[error("operation cancelled")]
    Cancelled,
}

impl DiscoveryError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn connection(endpoints: &[String], source: StoreError) -> Self {
        Self::Connection {
            endpoints: endpoints.join(","),
            source: Arc::new(source),
        }
    }

    pub fn lease(message: impl Into<String>, source: StoreError) -> Self {
        Self::Lease {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    pub fn registration(key: impl Into<String>, source: StoreError) -> Self {
        Self::Registration {
            key: key.into(),
            source: Arc::new(source),
        }
    }

    pub fn decode(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            key: key.into(),
            source: Arc::new(source),
        }
    }

    pub fn stream(context: impl Into<String>, source: StoreError) -> Self {
        Self::Stream {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// True for the outcome of `close()`, which callers usually don't log as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_distinguishable() {
        assert!(DiscoveryError::Cancelled.is_cancelled());
        let err = DiscoveryError::stream("watch", StoreError::StreamClosed);
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = DiscoveryError::connection(
            &["http://a:2379".to_string(), "http://b:2379".to_string()],
            StoreError::unavailable("refused"),
        );
        assert_eq!(
            err.to_string(),
            "connection error (http://a:2379,http://b:2379): store unavailable: refused"
        );

        let err = DiscoveryError::lease("grant", StoreError::LeaseNotFound { lease_id: 7 });
        assert_eq!(err.to_string(), "lease error: grant: lease 7 not found");
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error as _;
        let err = DiscoveryError::registration("/d/s/n", StoreError::StreamClosed);
        let source = err.source().expect("registration error has a source");
        assert_eq!(source.to_string(), "stream closed by server");
    }
}
