//! Process-wide defaults, overridable through the environment or a `.env` file.

use once_cell::sync::Lazy;
use std::env;

/// Lease TTL in seconds used when none is configured.
pub const DEFAULT_TTL: i64 = 10;

pub const DEFAULT_ETCD_ENDPOINTS: &str = "http://127.0.0.1:2379";
pub const DEFAULT_REGISTRY_DIR: &str = "/discovery";
pub const DEFAULT_LOG_DIR: &str = "./logs";

/// Comma separated etcd urls (env: ETCD_ENDPOINTS)
pub static ETCD_ENDPOINTS: Lazy<Vec<String>> = Lazy::new(|| {
    let raw = env::var("ETCD_ENDPOINTS").unwrap_or_else(|_| DEFAULT_ETCD_ENDPOINTS.to_string());
    parse_endpoints(&raw)
});

/// Namespace root for registrations (env: REGISTRY_DIR)
pub static REGISTRY_DIR: Lazy<String> =
    Lazy::new(|| env::var("REGISTRY_DIR").unwrap_or_else(|_| DEFAULT_REGISTRY_DIR.to_string()));

/// env: LOG_DIR
pub static LOG_DIR: Lazy<String> =
    Lazy::new(|| env::var("LOG_DIR").unwrap_or_else(|_| DEFAULT_LOG_DIR.to_string()));

/// Load `.env` if present. Call before touching the statics above.
pub fn init_env() {
    dotenv::dotenv().ok();
}

pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            parse_endpoints("http://a:2379, http://b:2379,,"),
            vec!["http://a:2379", "http://b:2379"]
        );
        assert!(parse_endpoints("").is_empty());
    }
}
