#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use discovery_rs::{
    init_env, utils::logger, LeaseRegistrar, Membership, MembershipWatcher, NodeData,
    RegistryOption, DEFAULT_ETCD_ENDPOINTS, DEFAULT_LOG_DIR, DEFAULT_REGISTRY_DIR, DEFAULT_TTL,
};
use local_ip_address::local_ip;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "discovery", version, about = "Register nodes and watch service membership in etcd")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// etcd urls, comma separated
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = DEFAULT_ETCD_ENDPOINTS,
        global = true
    )]
    endpoints: Vec<String>,

    /// Namespace root of the registry
    #[arg(long, env = "REGISTRY_DIR", default_value = DEFAULT_REGISTRY_DIR, global = true)]
    registry_dir: String,

    #[arg(long, env = "LOG_DIR", default_value = DEFAULT_LOG_DIR, global = true)]
    log_dir: String,
}

#[derive(Subcommand)]
enum Command {
    /// Register this node and keep it alive until Ctrl-C
    Register {
        #[arg(long)]
        service: String,

        /// Defaults to <local ip>:<port>
        #[arg(long)]
        node_id: Option<String>,

        #[arg(long, default_value_t = 8000)]
        port: u16,

        /// Lease TTL in seconds
        #[arg(long, default_value_t = DEFAULT_TTL)]
        ttl: i64,

        /// Metadata entry, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },
    /// Print membership updates of a service as JSON lines
    Watch {
        #[arg(long)]
        service: String,
    },
}

fn parse_meta(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))
}

async fn register(
    global: &GlobalArgs,
    service: String,
    node_id: Option<String>,
    port: u16,
    ttl: i64,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let node_id = match node_id {
        Some(node_id) => node_id,
        None => format!("{}:{}", local_ip().context("cannot detect local ip")?, port),
    };
    let node_data: NodeData = meta.into_iter().collect();

    let option = RegistryOption::new(global.endpoints.clone(), &global.registry_dir, service, node_id)
        .with_node_data(node_data)
        .with_ttl(ttl);
    let registrar = Arc::new(LeaseRegistrar::new(option)?);
    info!(key = %registrar.key(), ttl = ttl, "Starting registration");

    let mut handle = tokio::spawn({
        let registrar = Arc::clone(&registrar);
        async move { registrar.run_loop().await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, deregistering");
            registrar.close();
            handle.await??;
        }
        result = &mut handle => result??,
    }

    info!("Registration stopped");
    Ok(())
}

async fn watch(global: &GlobalArgs, service: String) -> Result<()> {
    let mut watcher =
        MembershipWatcher::new(&global.registry_dir, &service, &global.endpoints).await?;
    info!(prefix = %watcher.prefix(), "Watching membership");

    let close = watcher.close_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, closing watcher");
            close.close();
        }
    });

    let mut membership = Membership::new();
    loop {
        match watcher.next().await {
            Ok(updates) => {
                for update in &updates {
                    println!("{}", serde_json::to_string(update)?);
                }
                membership.apply(&updates);
                info!(nodes = membership.len(), revision = ?watcher.revision(), "Membership updated");
            }
            Err(e) if e.is_cancelled() => break,
            Err(e @ discovery_rs::DiscoveryError::Stream { .. }) => {
                // The next call re-opens the watch from the last revision.
                warn!(error = %e, "Watch interrupted, resuming");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(nodes = ?membership.addrs(), "Watcher closed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    init_env();

    let cli = Cli::parse();

    // Initialize logging system
    let _guard = logger::init(cli.global.log_dir.clone())?;

    let result = match cli.command {
        Command::Register {
            service,
            node_id,
            port,
            ttl,
            meta,
        } => register(&cli.global, service, node_id, port, ttl, meta).await,
        Command::Watch { service } => watch(&cli.global, service).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::ffi::OsStr;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_args_read_environment() {
        let command = Cli::command();
        let env_of = |id: &str| {
            command
                .get_arguments()
                .find(|arg| arg.get_id() == id)
                .and_then(|arg| arg.get_env())
                .map(OsStr::to_os_string)
        };
        assert_eq!(env_of("endpoints").as_deref(), Some(OsStr::new("ETCD_ENDPOINTS")));
        assert_eq!(env_of("registry_dir").as_deref(), Some(OsStr::new("REGISTRY_DIR")));
        assert_eq!(env_of("log_dir").as_deref(), Some(OsStr::new("LOG_DIR")));
    }

    #[test]
    fn test_endpoints_are_comma_separated() {
        let cli = Cli::try_parse_from([
            "discovery",
            "--endpoints",
            "http://a:2379,http://b:2379",
            "--registry-dir",
            "/elasticell",
            "watch",
            "--service",
            "query",
        ])
        .unwrap();
        assert_eq!(cli.global.endpoints, vec!["http://a:2379", "http://b:2379"]);
        assert_eq!(cli.global.registry_dir, "/elasticell");
        assert!(matches!(cli.command, Command::Watch { ref service } if service == "query"));
    }

    #[test]
    fn test_parse_meta() {
        assert_eq!(parse_meta("zone=a=b").unwrap(), ("zone".to_string(), "a=b".to_string()));
        assert!(parse_meta("zone").is_err());
    }
}
