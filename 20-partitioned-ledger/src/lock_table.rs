//! Per-account mutual exclusion with duplicate-transaction detection.
//!
//! At most one lock exists per account at any instant, whatever the operation
//! type. Callers that find an account locked join a FIFO queue for that
//! account and are handed the lock directly when the holder lets go, so no
//! waiter polls and waiters are served in arrival order.
//!
//! A granted lock is a [`LockGuard`]. Committing the guard stores the
//! transaction's result under its nonce (a duplicate-transaction record) and
//! releases the lock; dropping it uncommitted only releases the lock. Either
//! way the account cannot stay wedged when a worker bails out early or its
//! task is cancelled.
//!
//! Records are kept per account for a bounded time and up to a bounded count,
//! after which a resent nonce is treated as a new transaction.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use rust_decimal::Decimal;
use tokio::{sync::oneshot, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    error::LedgerError,
    protocol::{AccountNumber, Nonce, OpType, UnlockReply, UserId},
};

/// Identifies the connection worker that owns a lock.
pub type WorkerId = u64;

pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

type Grant = Result<u64, LedgerError>;

#[derive(Debug)]
struct Holder {
    grant: u64,
    op: OpType,
    nonce: Nonce,
    owner: WorkerId,
}

struct Waiter {
    op: OpType,
    nonce: Nonce,
    owner: WorkerId,
    reply: oneshot::Sender<Grant>,
}

struct Record {
    nonce: Nonce,
    result: String,
    at: Instant,
}

#[derive(Default)]
struct Inner {
    held: HashMap<AccountNumber, Holder>,
    waiters: HashMap<AccountNumber, VecDeque<Waiter>>,
    records: HashMap<AccountNumber, VecDeque<Record>>,
    next_grant: u64,
}

impl Inner {
    fn recorded(&mut self, account: &AccountNumber, nonce: Nonce, ttl: Duration) -> Option<String> {
        let history = self.records.get_mut(account)?;
        while history.front().is_some_and(|record| record.at.elapsed() > ttl) {
            history.pop_front();
        }
        let found = history
            .iter()
            .find(|record| record.nonce == nonce)
            .map(|record| record.result.clone());
        if history.is_empty() {
            self.records.remove(account);
        }
        found
    }

    fn grant(&mut self, account: &AccountNumber, op: OpType, nonce: Nonce, owner: WorkerId) -> u64 {
        self.next_grant += 1;
        let grant = self.next_grant;
        self.held.insert(
            account.clone(),
            Holder {
                grant,
                op,
                nonce,
                owner,
            },
        );
        grant
    }

    /// Passes a free account to the oldest live waiter.
    fn hand_off(&mut self, account: &AccountNumber, ttl: Duration) {
        while let Some(waiter) = self
            .waiters
            .get_mut(account)
            .and_then(VecDeque::pop_front)
        {
            if let Some(recorded) = self.recorded(account, waiter.nonce, ttl) {
                let _ = waiter
                    .reply
                    .send(Err(LedgerError::DuplicateTransaction { recorded }));
                continue;
            }

            let grant = self.grant(account, waiter.op, waiter.nonce, waiter.owner);
            if waiter.reply.send(Ok(grant)).is_ok() {
                debug!(%account, owner = waiter.owner, "lock handed to waiter");
                break;
            }
            // Waiter gave up before we got to it.
            self.held.remove(account);
        }

        if self.waiters.get(account).is_some_and(VecDeque::is_empty) {
            self.waiters.remove(account);
        }
    }
}

pub struct LockTable {
    inner: Mutex<Inner>,
    record_ttl: Duration,
    history_limit: usize,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_RECORD_TTL)
    }
}

impl LockTable {
    pub fn new(record_ttl: Duration) -> Self {
        Self::with_history_limit(record_ttl, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(record_ttl: Duration, history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            record_ttl,
            history_limit: history_limit.max(1),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff any lock is held on `account`, whatever its operation type.
    pub fn is_locked(&self, account: &AccountNumber) -> bool {
        self.inner().held.contains_key(account)
    }

    /// Result recorded for `nonce` on `account`, if that transaction already ran.
    pub fn recorded(&self, account: &AccountNumber, nonce: Nonce) -> Option<String> {
        self.inner().recorded(account, nonce, self.record_ttl)
    }

    /// Takes the lock without waiting.
    ///
    /// Returns `Ok(None)` when another holder has the account and
    /// [`LedgerError::DuplicateTransaction`] when `nonce` already completed on it.
    pub fn try_lock(
        self: &Arc<Self>,
        account: &AccountNumber,
        op: OpType,
        nonce: Nonce,
        owner: WorkerId,
    ) -> Result<Option<LockGuard>, LedgerError> {
        let mut inner = self.inner();
        if let Some(recorded) = inner.recorded(account, nonce, self.record_ttl) {
            return Err(LedgerError::DuplicateTransaction { recorded });
        }
        if inner.held.contains_key(account) {
            return Ok(None);
        }
        let grant = inner.grant(account, op, nonce, owner);
        drop(inner);

        debug!(%account, %op, %nonce, owner, "lock granted");
        Ok(Some(self.guard(account, grant, op, nonce, owner)))
    }

    /// Takes the lock, queueing behind the current holder for at most `wait`.
    ///
    /// Fails with [`LedgerError::Logic`] if the deadline passes first.
    pub async fn acquire(
        self: &Arc<Self>,
        account: &AccountNumber,
        op: OpType,
        nonce: Nonce,
        owner: WorkerId,
        wait: Duration,
    ) -> Result<LockGuard, LedgerError> {
        let rx = {
            let mut inner = self.inner();
            if let Some(recorded) = inner.recorded(account, nonce, self.record_ttl) {
                return Err(LedgerError::DuplicateTransaction { recorded });
            }
            if !inner.held.contains_key(account) {
                let grant = inner.grant(account, op, nonce, owner);
                drop(inner);
                debug!(%account, %op, %nonce, owner, "lock granted");
                return Ok(self.guard(account, grant, op, nonce, owner));
            }

            let (reply, rx) = oneshot::channel();
            inner
                .waiters
                .entry(account.clone())
                .or_default()
                .push_back(Waiter {
                    op,
                    nonce,
                    owner,
                    reply,
                });
            rx
        };
        debug!(%account, %op, %nonce, owner, "waiting for lock");

        let mut pending = PendingGrant {
            table: Arc::clone(self),
            account: account.clone(),
            rx,
            armed: true,
        };
        match timeout(wait, &mut pending.rx).await {
            Ok(Ok(Ok(grant))) => {
                pending.armed = false;
                Ok(self.guard(account, grant, op, nonce, owner))
            }
            Ok(Ok(Err(err))) => {
                pending.armed = false;
                Err(err)
            }
            Ok(Err(_)) => Err(LedgerError::Logic),
            Err(_) => {
                warn!(%account, %op, %nonce, owner, "timed out waiting for lock");
                Err(LedgerError::Logic)
            }
        }
    }

    /// Locks every account in `accounts`, in a fixed global order so two
    /// multi-account requests cannot deadlock. On failure nothing stays held.
    pub async fn acquire_all(
        self: &Arc<Self>,
        accounts: &[AccountNumber],
        op: OpType,
        nonce: Nonce,
        owner: WorkerId,
        wait: Duration,
    ) -> Result<Vec<LockGuard>, LedgerError> {
        let mut ordered: Vec<&AccountNumber> = accounts.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for account in ordered {
            guards.push(self.acquire(account, op, nonce, owner, wait).await?);
        }
        Ok(guards)
    }

    /// Force-releases every lock held by `owner`.
    pub fn release_owner(&self, owner: WorkerId) -> usize {
        let mut inner = self.inner();
        let accounts: Vec<AccountNumber> = inner
            .held
            .iter()
            .filter(|(_, holder)| holder.owner == owner)
            .map(|(account, _)| account.clone())
            .collect();
        for account in &accounts {
            inner.held.remove(account);
            inner.hand_off(account, self.record_ttl);
        }
        if !accounts.is_empty() {
            warn!(owner, released = accounts.len(), "force-released locks");
        }
        accounts.len()
    }

    /// Accounts currently locked, with the owner of each lock.
    pub fn holders(&self) -> Vec<(AccountNumber, WorkerId)> {
        self.inner()
            .held
            .iter()
            .map(|(account, holder)| (account.clone(), holder.owner))
            .collect()
    }

    fn release(&self, account: &AccountNumber, grant: u64, record: Option<(Nonce, &str)>) {
        let mut inner = self.inner();
        // A force-release may already have passed the account on.
        if inner.held.get(account).map(|holder| holder.grant) != Some(grant) {
            return;
        }
        if let Some((nonce, result)) = record {
            let history = inner.records.entry(account.clone()).or_default();
            history.push_back(Record {
                nonce,
                result: result.to_string(),
                at: Instant::now(),
            });
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }
        if let Some(holder) = inner.held.remove(account) {
            debug!(
                %account,
                op = %holder.op,
                nonce = %holder.nonce,
                owner = holder.owner,
                "lock released"
            );
        }
        inner.hand_off(account, self.record_ttl);
    }

    fn guard(
        self: &Arc<Self>,
        account: &AccountNumber,
        grant: u64,
        op: OpType,
        nonce: Nonce,
        owner: WorkerId,
    ) -> LockGuard {
        LockGuard {
            table: Arc::clone(self),
            account: account.clone(),
            grant,
            op,
            nonce,
            owner,
            released: false,
        }
    }
}

/// Releases a grant that arrives after its waiter stopped listening.
struct PendingGrant {
    table: Arc<LockTable>,
    account: AccountNumber,
    rx: oneshot::Receiver<Grant>,
    armed: bool,
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.rx.close();
        if let Ok(Ok(grant)) = self.rx.try_recv() {
            self.table.release(&self.account, grant, None);
        }
    }
}

/// A held lock on one account.
pub struct LockGuard {
    table: Arc<LockTable>,
    account: AccountNumber,
    grant: u64,
    op: OpType,
    nonce: Nonce,
    owner: WorkerId,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("account", &self.account)
            .field("op", &self.op)
            .field("nonce", &self.nonce)
            .field("owner", &self.owner)
            .finish()
    }
}

impl LockGuard {
    pub fn account(&self) -> &AccountNumber {
        &self.account
    }

    pub fn op(&self) -> OpType {
        self.op
    }

    /// Records `result` for this guard's nonce and releases the lock.
    pub fn commit(mut self, result: &str) {
        self.released = true;
        self.table
            .release(&self.account, self.grant, Some((self.nonce, result)));
    }

    /// Holder-side unlock after the mutation was applied. Returns the reply
    /// line sent back to the requesting peer.
    pub fn unlock(self, user_id: UserId, amount: Decimal, result: &str) -> String {
        info!(
            account = %self.account,
            op = %self.op,
            user_id,
            %amount,
            result,
            "unlocking after commit"
        );
        self.commit(result);
        UnlockReply::Applied(result.to_string()).to_line()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.table.release(&self.account, self.grant, None);
        }
    }
}
