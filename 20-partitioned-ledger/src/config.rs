//! Node and client settings, independent of how they were parsed.

use std::{path::PathBuf, time::Duration};

use clap::ValueEnum;

use crate::{lock_table::DEFAULT_RECORD_TTL, transport::PEER_READ_TIMEOUT};

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Which part of the fixed topology a node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Accepts client transactions and drives replication.
    Write,
    /// Mirrors the write node's mutations under its own locks.
    Coordinator,
    /// Serves balance queries from pushed state.
    Replica,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,
    /// Coordinator peer of a write node.
    pub coordinator: Option<String>,
    /// Read-replica peer of a write node.
    pub replica: Option<String>,
    /// Idle deadline on accepted connections; `None` waits forever.
    pub client_timeout: Option<Duration>,
    pub peer_timeout: Duration,
    pub workers: usize,
    pub lock_wait: Duration,
    pub record_ttl: Duration,
    pub shutdown_grace: Duration,
    pub snapshot: Option<PathBuf>,
}

impl NodeConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            coordinator: None,
            replica: None,
            client_timeout: None,
            peer_timeout: PEER_READ_TIMEOUT,
            workers: DEFAULT_WORKERS,
            lock_wait: DEFAULT_LOCK_WAIT,
            record_ttl: DEFAULT_RECORD_TTL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            snapshot: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub write: String,
    pub read: String,
    pub read_timeout: Duration,
}

impl SessionConfig {
    pub fn new(write: impl Into<String>, read: impl Into<String>) -> Self {
        Self {
            write: write.into(),
            read: read.into(),
            read_timeout: PEER_READ_TIMEOUT,
        }
    }
}
