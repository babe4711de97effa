use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{NodeConfig, Role, SessionConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a ledger node.
    Node(NodeArgs),
    /// Open an interactive session against a write node and a read replica.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Part this node plays in the topology.
    #[arg(long, value_enum)]
    pub role: Role,

    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:2025")]
    pub listen: String,

    /// Coordinator node address (write nodes only).
    #[arg(long)]
    pub coordinator: Option<String>,

    /// Read-replica node address (write nodes only).
    #[arg(long)]
    pub replica: Option<String>,

    /// Idle timeout for accepted connections in milliseconds; 0 never times out.
    #[arg(long, default_value_t = 0)]
    pub client_timeout_ms: u64,

    /// Reply deadline on links to other nodes, in milliseconds.
    #[arg(long, default_value_t = 7_000)]
    pub peer_timeout_ms: u64,

    /// Connections served concurrently.
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// How long a request may queue for an account lock, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub lock_wait_ms: u64,

    /// How long a completed nonce is remembered, in seconds.
    #[arg(long, default_value_t = 300)]
    pub record_ttl_secs: u64,

    /// Grace period for in-flight connections at shutdown, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub shutdown_grace_ms: u64,

    /// Dump file restored at startup and written at shutdown.
    #[arg(long)]
    pub snapshot: Option<PathBuf>,
}

impl From<&NodeArgs> for NodeConfig {
    fn from(args: &NodeArgs) -> Self {
        Self {
            role: args.role,
            coordinator: args.coordinator.clone(),
            replica: args.replica.clone(),
            client_timeout: (args.client_timeout_ms > 0)
                .then(|| Duration::from_millis(args.client_timeout_ms)),
            peer_timeout: Duration::from_millis(args.peer_timeout_ms),
            workers: args.workers.max(1),
            lock_wait: Duration::from_millis(args.lock_wait_ms),
            record_ttl: Duration::from_secs(args.record_ttl_secs),
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
            snapshot: args.snapshot.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Write node address.
    #[arg(long, default_value = "127.0.0.1:2025")]
    pub write: String,

    /// Read-replica address; balance queries fall back to the write node.
    #[arg(long, default_value = "127.0.0.1:2026")]
    pub read: String,

    /// Reply deadline in milliseconds.
    #[arg(long, default_value_t = 7_000)]
    pub timeout_ms: u64,
}

impl From<&ClientArgs> for SessionConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            write: args.write.clone(),
            read: args.read.clone(),
            read_timeout: Duration::from_millis(args.timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_args_map_to_config() {
        let cli = Cli::parse_from([
            "partitioned_ledger",
            "node",
            "--role",
            "write",
            "--listen",
            "127.0.0.1:0",
            "--coordinator",
            "127.0.0.1:3000",
            "--client-timeout-ms",
            "250",
        ]);
        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        let config = NodeConfig::from(&args);
        assert_eq!(config.role, Role::Write);
        assert_eq!(config.coordinator.as_deref(), Some("127.0.0.1:3000"));
        assert_eq!(config.replica, None);
        assert_eq!(config.client_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.workers, 8);
        assert_eq!(config.peer_timeout, Duration::from_secs(7));
    }

    #[test]
    fn zero_client_timeout_means_no_deadline() {
        let cli = Cli::parse_from(["partitioned_ledger", "node", "--role", "replica"]);
        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        assert_eq!(NodeConfig::from(&args).client_timeout, None);
    }
}
