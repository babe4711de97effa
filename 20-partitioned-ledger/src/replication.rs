//! Write-node side of replication.
//!
//! A write node owns two fixed peer links: the coordinator, which mirrors
//! every mutation under its own account locks, and the read replica, which
//! only receives post-transaction balances. [`Replicator::execute`] runs one
//! client transaction end to end:
//!
//! 1. lock the affected accounts locally (queueing behind other holders),
//! 2. apply the mutation to the local store,
//! 3. `L` then `U` on the coordinator,
//! 4. push `C` to the replica, then commit the local locks with the result.
//!
//! The write node is the source of truth. Whenever the coordinator cannot
//! follow along, its copy is replaced with a full dump rather than leaving
//! the two nodes diverged.

use std::{sync::Arc, time::Duration};

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{LedgerError, TransportError},
    lock_table::{LockTable, WorkerId},
    protocol::{
        AccountNumber, Identity, Nonce, OpType, PeerRequest, Registration, UnlockReply, UserId,
        parse_flag,
    },
    store::LedgerStore,
    teller::{self, Applied},
    transport::Channel,
};

/// What happened to a request sent over a [`PeerLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Replied(String),
    /// The link had to reconnect. The request was not resent; the full dump
    /// pushed on reconnect already carries its effect.
    Resynced,
}

/// A lazily connected, self-healing link to one peer node.
pub struct PeerLink {
    name: &'static str,
    addr: String,
    read_timeout: Duration,
    channel: Mutex<Option<Channel>>,
}

impl PeerLink {
    pub fn new(name: &'static str, addr: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            name,
            addr: addr.into(),
            read_timeout,
            channel: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Sends `line` and waits for its reply.
    ///
    /// If the link is down, or the first attempt times out or breaks, the
    /// socket is rebuilt and `store` is pushed as a full dump instead.
    pub async fn deliver(
        &self,
        line: &str,
        store: &dyn LedgerStore,
    ) -> Result<Delivery, TransportError> {
        let mut slot = self.channel.lock().await;

        if let Some(channel) = slot.as_mut() {
            match channel.request(line).await {
                Ok(reply) => return Ok(Delivery::Replied(reply)),
                Err(err) if err.is_recoverable() => {
                    warn!(
                        peer = self.name,
                        addr = %self.addr,
                        error = %err,
                        "peer request failed, reconnecting"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let channel = self.reopen(&mut slot).await?;
        push_dump(channel, store).await?;
        Ok(Delivery::Resynced)
    }

    /// Replaces the peer's state with a full dump of `store`.
    pub async fn push_full_sync(&self, store: &dyn LedgerStore) -> Result<(), TransportError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_mut() {
            match push_dump(channel, store).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_recoverable() => {
                    warn!(peer = self.name, error = %err, "full sync failed, reconnecting");
                }
                Err(err) => return Err(err),
            }
        }
        let channel = self.reopen(&mut slot).await?;
        push_dump(channel, store).await
    }

    pub async fn close(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await;
        }
    }

    async fn reopen<'a>(
        &self,
        slot: &'a mut Option<Channel>,
    ) -> Result<&'a mut Channel, TransportError> {
        match slot {
            Some(channel) => {
                channel.reconnect(None).await?;
                Ok(channel)
            }
            None => {
                let channel =
                    Channel::connect(&self.addr, Identity::Server, self.read_timeout).await?;
                Ok(slot.insert(channel))
            }
        }
    }
}

async fn push_dump(channel: &mut Channel, store: &dyn LedgerStore) -> Result<(), TransportError> {
    let dump = store.dump_all();
    channel.send(&PeerRequest::FullSync.to_line()).await?;
    channel.send(&dump).await?;
    info!(peer = %channel.peer(), bytes = dump.len(), "full dump pushed");
    Ok(())
}

/// Drives client transactions through the local lock table, the local store
/// and the peer links.
pub struct Replicator {
    store: Arc<dyn LedgerStore>,
    locks: Arc<LockTable>,
    coordinator: Option<PeerLink>,
    replica: Option<PeerLink>,
    lock_wait: Duration,
}

impl Replicator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        locks: Arc<LockTable>,
        coordinator: Option<PeerLink>,
        replica: Option<PeerLink>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            coordinator,
            replica,
            lock_wait,
        }
    }

    fn peers(&self) -> impl Iterator<Item = &PeerLink> {
        self.coordinator.iter().chain(self.replica.iter())
    }

    /// Runs one deposit, withdraw or transfer for `user_id`.
    ///
    /// Fails with [`LedgerError::DuplicateTransaction`] when `nonce` already
    /// completed on one of the accounts.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        owner: WorkerId,
        user_id: UserId,
        op: OpType,
        accounts: &[AccountNumber],
        amount: Decimal,
        nonce: Nonce,
    ) -> Result<Applied, LedgerError> {
        let guards = self
            .locks
            .acquire_all(accounts, op, nonce, owner, self.lock_wait)
            .await?;

        let applied = teller::apply(self.store.as_ref(), user_id, op, accounts, amount)?;
        let result = applied.result_line();

        let mirrored = match &self.coordinator {
            Some(link) => self.mirror(link, user_id, op, accounts, amount, nonce, &result).await,
            None => true,
        };

        // Overwrites must reach the replica in commit order, so they go out
        // while the accounts are still locked.
        self.push_balances(&applied).await;

        for guard in guards {
            guard.commit(&result);
        }
        if !mirrored {
            return Err(LedgerError::Logic);
        }
        Ok(applied)
    }

    /// Mirrors a committed local mutation on the coordinator. Returns false if
    /// the coordinator could neither follow nor be resynchronized.
    #[allow(clippy::too_many_arguments)]
    async fn mirror(
        &self,
        link: &PeerLink,
        user_id: UserId,
        op: OpType,
        accounts: &[AccountNumber],
        amount: Decimal,
        nonce: Nonce,
        result: &str,
    ) -> bool {
        let store = self.store.as_ref();
        let lock = PeerRequest::Lock {
            accounts: accounts.to_vec(),
            op,
            nonce,
        };

        let in_sync = match link.deliver(&lock.to_line(), store).await {
            Ok(Delivery::Resynced) => return true,
            Ok(Delivery::Replied(reply)) if parse_flag(&reply) => {
                let unlock = PeerRequest::Unlock {
                    user_id,
                    accounts: accounts.to_vec(),
                    op,
                    amount,
                };
                match link.deliver(&unlock.to_line(), store).await {
                    Ok(Delivery::Replied(reply)) => match UnlockReply::parse(&reply) {
                        UnlockReply::Applied(remote) if remote == result => true,
                        UnlockReply::Applied(remote) => {
                            warn!(%remote, local = result, "coordinator balances diverged");
                            false
                        }
                        UnlockReply::Rejected => {
                            warn!(%op, "coordinator rejected mirrored mutation");
                            false
                        }
                    },
                    // The dump pushed on reconnect already holds the mutation.
                    Ok(Delivery::Resynced) => return true,
                    Err(err) => {
                        warn!(error = %err, "coordinator unlock failed");
                        false
                    }
                }
            }
            Ok(Delivery::Replied(_)) => {
                warn!(%op, %nonce, "coordinator refused lock");
                false
            }
            Err(err) => {
                warn!(error = %err, "coordinator lock failed");
                false
            }
        };

        if in_sync {
            debug!(%op, %nonce, "mutation mirrored on coordinator");
            return true;
        }
        match link.push_full_sync(store).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "coordinator resync failed");
                false
            }
        }
    }

    /// Pushes post-transaction balances to the read replica.
    async fn push_balances(&self, applied: &Applied) {
        let Some(link) = &self.replica else {
            return;
        };
        for (account, balance) in &applied.balances {
            let overwrite = PeerRequest::Overwrite {
                account: account.clone(),
                balance: *balance,
            };
            match link.deliver(&overwrite.to_line(), self.store.as_ref()).await {
                Ok(Delivery::Replied(reply)) if parse_flag(&reply) => {}
                Ok(Delivery::Resynced) => {}
                Ok(Delivery::Replied(reply)) => {
                    warn!(%account, %reply, "replica rejected balance overwrite, resyncing");
                    if let Err(err) = link.push_full_sync(self.store.as_ref()).await {
                        warn!(error = %err, "replica resync failed");
                    }
                }
                Err(err) => warn!(%account, error = %err, "balance overwrite not delivered"),
            }
        }
    }

    /// Creates a user and its first account, then mirrors both rows on every
    /// peer under the same identifiers.
    pub async fn register(
        &self,
        registration: &Registration,
    ) -> Result<(UserId, Result<AccountNumber, LedgerError>), LedgerError> {
        let user_id = self.store.register(registration)?;
        let account = match self.store.create_account(user_id) {
            Ok(account) => account,
            Err(err) => return Ok((user_id, Err(err))),
        };

        let mirror = PeerRequest::Register {
            user_id,
            registration: registration.clone(),
            account: account.clone(),
        };
        for link in self.peers() {
            match link.deliver(&mirror.to_line(), self.store.as_ref()).await {
                Ok(Delivery::Replied(reply)) if parse_flag(&reply) => {
                    debug!(peer = link.name(), user_id, "registration mirrored");
                }
                Ok(Delivery::Resynced) => {}
                Ok(Delivery::Replied(_)) => {
                    warn!(peer = link.name(), user_id, "peer rejected registration, resyncing");
                    if let Err(err) = link.push_full_sync(self.store.as_ref()).await {
                        warn!(peer = link.name(), error = %err, "resync failed");
                    }
                }
                Err(err) => warn!(peer = link.name(), error = %err, "registration not mirrored"),
            }
        }
        Ok((user_id, Ok(account)))
    }

    /// Brings every peer to exact parity with the local store.
    pub async fn sync_peers(&self) {
        for link in self.peers() {
            match link.push_full_sync(self.store.as_ref()).await {
                Ok(()) => info!(peer = link.name(), "peer synchronized"),
                Err(err) => warn!(peer = link.name(), error = %err, "peer unavailable for sync"),
            }
        }
    }

    pub async fn close(&self) {
        for link in self.peers() {
            link.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::MemoryLedger,
        transport::{read_line, write_line},
    };
    use rust_decimal_macros::dec;
    use tokio::{io::BufReader, net::TcpListener};

    const WAIT: Duration = Duration::from_secs(1);

    fn seeded() -> (Arc<MemoryLedger>, UserId, AccountNumber) {
        let store = Arc::new(MemoryLedger::new());
        let user = store
            .register(&Registration {
                username: "alice".into(),
                password: "pw".into(),
                first_name: "A".into(),
                last_name: "L".into(),
                email: "a@example.com".into(),
            })
            .expect("register");
        let account = store.create_account(user).expect("account");
        store.overwrite_balance(&account, dec!(500.00)).expect("seed");
        (store, user, account)
    }

    #[tokio::test]
    async fn standalone_write_node_commits_and_records() {
        let (store, user, account) = seeded();
        let locks = Arc::new(LockTable::default());
        let replicator = Replicator::new(store.clone(), locks.clone(), None, None, WAIT);

        let applied = replicator
            .execute(1, user, OpType::Withdraw, &[account.clone()], dec!(100.00), Nonce(42))
            .await
            .expect("withdraw");
        assert_eq!(applied.primary(), dec!(400.00));

        let replay = replicator
            .execute(1, user, OpType::Withdraw, &[account.clone()], dec!(100.00), Nonce(42))
            .await;
        assert!(matches!(replay, Err(LedgerError::DuplicateTransaction { .. })));
        assert_eq!(store.account_balance(&account), Ok(dec!(400.00)));
        assert!(!locks.is_locked(&account));
    }

    #[tokio::test]
    async fn failed_local_mutation_releases_without_record() {
        let (store, user, account) = seeded();
        let locks = Arc::new(LockTable::default());
        let replicator = Replicator::new(store.clone(), locks.clone(), None, None, WAIT);

        let result = replicator
            .execute(1, user, OpType::Withdraw, &[account.clone()], dec!(900), Nonce(1))
            .await;
        assert_eq!(result.unwrap_err(), LedgerError::Logic);
        assert!(!locks.is_locked(&account));
        assert_eq!(locks.recorded(&account, Nonce(1)), None);
    }

    #[tokio::test]
    async fn refused_remote_lock_triggers_full_resync() {
        let (store, user, account) = seeded();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut seen = Vec::new();
            // identity, O + dump from the startup sync, L (refused), O + dump
            for _ in 0..6 {
                let line = read_line(&mut reader).await.expect("read").expect("line");
                if line.starts_with("L ") {
                    write_line(&mut writer, "false").await.expect("reply");
                }
                seen.push(line);
            }
            seen
        });

        let replicator = Replicator::new(
            store.clone(),
            Arc::new(LockTable::default()),
            Some(PeerLink::new("coordinator", addr, WAIT)),
            None,
            WAIT,
        );
        replicator.sync_peers().await;
        let before = store.dump_all();

        let applied = replicator
            .execute(1, user, OpType::Deposit, &[account.clone()], dec!(5), Nonce(3))
            .await
            .expect("write node stays authoritative");
        assert_eq!(applied.primary(), dec!(505.00));

        let seen = peer.await.expect("peer task");
        assert_eq!(seen[0], "server");
        assert_eq!(seen[1], "O");
        assert_eq!(seen[2], before);
        assert_eq!(seen[3], format!("L {account} D 3"));
        assert_eq!(seen[4], "O");
        assert_eq!(seen[5], store.dump_all());
        assert_ne!(seen[5], before);
    }

    #[tokio::test]
    async fn unreachable_coordinator_fails_with_logic_but_remembers_nonce() {
        let (store, user, account) = seeded();
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr").to_string()
        };
        let locks = Arc::new(LockTable::default());
        let replicator = Replicator::new(
            store.clone(),
            locks.clone(),
            Some(PeerLink::new("coordinator", addr, Duration::from_millis(200))),
            None,
            WAIT,
        );

        let result = replicator
            .execute(1, user, OpType::Deposit, &[account.clone()], dec!(5), Nonce(8))
            .await;
        assert_eq!(result.unwrap_err(), LedgerError::Logic);
        assert!(!locks.is_locked(&account));
        assert_eq!(locks.recorded(&account, Nonce(8)).as_deref(), Some("505.00"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replica_sees_overwrites_in_commit_order() {
        const DEPOSITS: u64 = 16;
        let (store, user, account) = seeded();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let replica = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            // identity, then O + dump from the initial sync
            for _ in 0..3 {
                read_line(&mut reader).await.expect("read").expect("line");
            }
            let mut last = None;
            for _ in 0..DEPOSITS {
                let line = read_line(&mut reader).await.expect("read").expect("line");
                match PeerRequest::parse(&line) {
                    Ok(PeerRequest::Overwrite { balance, .. }) => last = Some(balance),
                    other => panic!("unexpected frame {other:?}"),
                }
                write_line(&mut writer, "true").await.expect("reply");
            }
            last
        });

        let replicator = Arc::new(Replicator::new(
            store.clone(),
            Arc::new(LockTable::default()),
            None,
            Some(PeerLink::new("replica", addr, WAIT)),
            Duration::from_secs(5),
        ));
        replicator.sync_peers().await;

        let mut deposits = tokio::task::JoinSet::new();
        for owner in 1..=DEPOSITS {
            let replicator = Arc::clone(&replicator);
            let account = account.clone();
            deposits.spawn(async move {
                replicator
                    .execute(owner, user, OpType::Deposit, &[account], dec!(1), Nonce(owner))
                    .await
                    .expect("deposit");
            });
        }
        while let Some(joined) = deposits.join_next().await {
            joined.expect("deposit task");
        }

        let last = replica.await.expect("replica task");
        assert_eq!(store.account_balance(&account), Ok(dec!(516.00)));
        assert_eq!(last, Some(dec!(516.00)));
    }
}
