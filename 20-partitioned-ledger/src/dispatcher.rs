//! Accept loop and connection workers for one ledger node.
//!
//! Every accepted socket becomes a worker task. Workers wait for one of a
//! fixed number of permits before serving, so at most `workers` connections
//! are active at a time while the accept loop keeps watching for shutdown.
//! The first line on a connection is its identity frame; it picks the
//! opcode set used for the rest of the connection.
//!
//! Shutdown stops accepting, gives running workers a grace period to finish,
//! aborts the rest and force-releases whatever locks the aborted workers
//! still held.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::Semaphore,
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::{NodeConfig, Role},
    error::TransportError,
    handlers::{ClientSession, MALFORMED_REPLY, PeerSession, Services},
    lock_table::{LockTable, WorkerId},
    protocol::{Identity, PeerRequest},
    replication::{PeerLink, Replicator},
    store::MemoryLedger,
    transport::{read_line_within, write_line},
};

/// Consecutive malformed lines tolerated before a connection is dropped.
pub const MAX_MALFORMED: usize = 5;

/// Per-worker settings that do not change over the node's lifetime.
#[derive(Clone)]
struct WorkerContext {
    services: Arc<Services>,
    idle_timeout: Option<Duration>,
    peer_timeout: Duration,
}

pub struct Node {
    listener: TcpListener,
    config: NodeConfig,
    ledger: Arc<MemoryLedger>,
    services: Arc<Services>,
}

impl Node {
    /// Builds a node around `listener`, restoring the ledger from the
    /// configured snapshot when there is one.
    pub async fn open(listener: TcpListener, config: NodeConfig) -> Result<Self> {
        let ledger = match &config.snapshot {
            Some(path) if path.exists() => MemoryLedger::open_snapshot(path).await?,
            Some(path) => {
                info!(path = %path.display(), "no snapshot yet, starting empty");
                MemoryLedger::new()
            }
            None => MemoryLedger::new(),
        };
        Ok(Self::with_ledger(listener, config, Arc::new(ledger)))
    }

    pub fn with_ledger(
        listener: TcpListener,
        config: NodeConfig,
        ledger: Arc<MemoryLedger>,
    ) -> Self {
        let locks = Arc::new(LockTable::new(config.record_ttl));
        let replicator = (config.role == Role::Write).then(|| {
            let link = |name, addr: &String| PeerLink::new(name, addr.clone(), config.peer_timeout);
            Replicator::new(
                ledger.clone(),
                locks.clone(),
                config.coordinator.as_ref().map(|addr| link("coordinator", addr)),
                config.replica.as_ref().map(|addr| link("replica", addr)),
                config.lock_wait,
            )
        });
        let services = Arc::new(Services::new(
            config.role,
            ledger.clone(),
            locks,
            replicator,
            config.lock_wait,
        ));
        Self {
            listener,
            config,
            ledger,
            services,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn services(&self) -> Arc<Services> {
        Arc::clone(&self.services)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Node {
            listener,
            config,
            ledger,
            services,
        } = self;
        tokio::pin!(shutdown);

        if let Some(replicator) = services.replicator() {
            replicator.sync_peers().await;
        }

        let context = WorkerContext {
            services: Arc::clone(&services),
            idle_timeout: config.client_timeout,
            peer_timeout: config.peer_timeout,
        };
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        let next_worker = AtomicU64::new(1);
        let mut workers = JoinSet::new();

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let worker = next_worker.fetch_add(1, Ordering::Relaxed);
                        let permits = Arc::clone(&permits);
                        let context = context.clone();
                        workers.spawn(async move {
                            let Ok(_permit) = permits.acquire_owned().await else {
                                return;
                            };
                            if let Err(err) =
                                serve_connection(stream, peer, worker, context).await
                            {
                                warn!(%peer, worker, error = ?err, "connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                },
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = ?err, "connection worker failed");
                    }
                }
            }
        }

        info!(role = ?config.role, "node shutting down");
        drop(listener);
        drain_workers(&mut workers, config.shutdown_grace, services.locks()).await;

        if let Some(replicator) = services.replicator() {
            replicator.close().await;
        }
        if let Some(path) = &config.snapshot {
            ledger.save_snapshot(path).await?;
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn drain_workers(workers: &mut JoinSet<()>, grace: Duration, locks: &LockTable) {
    let drained = timeout(grace, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_ok() {
        return;
    }

    warn!(remaining = workers.len(), "grace period elapsed, aborting workers");
    workers.abort_all();
    while workers.join_next().await.is_some() {}

    // Every worker is gone, so any lock still held is orphaned.
    let mut owners: Vec<WorkerId> = locks.holders().into_iter().map(|(_, owner)| owner).collect();
    owners.sort_unstable();
    owners.dedup();
    for owner in owners {
        locks.release_owner(owner);
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    worker: WorkerId,
    context: WorkerContext,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let first = match read_line_within(&mut reader, context.idle_timeout).await {
        Ok(Some(line)) => line,
        Ok(None) => return Ok(()),
        Err(TransportError::Timeout) => {
            debug!(%peer, worker, "connection timed out before identifying");
            return Ok(());
        }
        Err(err) => return Err(err).context("failed to read identity frame"),
    };

    match Identity::parse(&first) {
        Some(Identity::Client) => {
            info!(%peer, worker, "client connected");
            serve_client(&mut reader, &mut writer, worker, &context).await?;
            info!(%peer, worker, "client disconnected");
        }
        Some(Identity::Server) => {
            info!(%peer, worker, "peer connected");
            serve_peer(&mut reader, &mut writer, worker, &context).await?;
            info!(%peer, worker, "peer disconnected");
        }
        None => {
            write_line(&mut writer, MALFORMED_REPLY).await?;
            anyhow::bail!("unknown identity frame '{first}'");
        }
    }
    Ok(())
}

/// Next request line, or `None` once the connection should end.
async fn next_request<R>(
    reader: &mut R,
    idle: Option<Duration>,
    worker: WorkerId,
) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match read_line_within(reader, idle).await {
        Ok(line) => Ok(line),
        Err(TransportError::Timeout) => {
            info!(worker, "connection idle past its timeout");
            Ok(None)
        }
        Err(err) if err.is_recoverable() => {
            debug!(worker, error = %err, "connection dropped");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

/// Counts consecutive malformed lines; true once the connection should close.
fn exhausted(malformed: &mut usize, worker: WorkerId) -> bool {
    *malformed += 1;
    if *malformed >= MAX_MALFORMED {
        warn!(worker, "too many malformed requests, closing connection");
        return true;
    }
    false
}

async fn serve_client<R, W>(
    reader: &mut R,
    writer: &mut W,
    worker: WorkerId,
    context: &WorkerContext,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = ClientSession::new(worker);
    let mut malformed = 0;

    while let Some(line) = next_request(reader, context.idle_timeout, worker).await? {
        let opcode = line.split_whitespace().next().unwrap_or_default();
        debug!(worker, opcode, "received client request");
        match session.handle_line(&context.services, &line).await {
            Ok(reply) => {
                malformed = 0;
                write_line(writer, &reply).await?;
            }
            Err(err) => {
                warn!(worker, error = %err, "rejected client request");
                write_line(writer, MALFORMED_REPLY).await?;
                if exhausted(&mut malformed, worker) {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn serve_peer<R, W>(
    reader: &mut R,
    writer: &mut W,
    worker: WorkerId,
    context: &WorkerContext,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Locks granted to this peer are released when the session drops.
    let mut session = PeerSession::new(worker);
    let mut malformed = 0;

    while let Some(line) = next_request(reader, context.idle_timeout, worker).await? {
        let request = match PeerRequest::parse(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(worker, error = %err, "rejected peer request");
                write_line(writer, MALFORMED_REPLY).await?;
                if exhausted(&mut malformed, worker) {
                    break;
                }
                continue;
            }
        };
        malformed = 0;

        if matches!(request, PeerRequest::FullSync) {
            let dump = read_line_within(reader, Some(context.peer_timeout))
                .await
                .context("failed to read full dump")?
                .context("connection closed before full dump")?;
            match context.services.full_sync(&dump) {
                Ok(()) => info!(worker, bytes = dump.len(), "full dump applied"),
                Err(err) => warn!(worker, error = %err, "full dump rejected"),
            }
            continue;
        }

        debug!(worker, request = %line, "received peer request");
        match session.handle(&context.services, request).await {
            Ok(reply) => write_line(writer, &reply).await?,
            Err(err) => {
                warn!(worker, error = %err, "unsupported peer request");
                write_line(writer, MALFORMED_REPLY).await?;
                if exhausted(&mut malformed, worker) {
                    break;
                }
            }
        }
    }
    Ok(())
}
