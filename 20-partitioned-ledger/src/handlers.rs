//! Per-role request handling for accepted connections.
//!
//! The dispatcher classifies every connection by its identity frame and then
//! feeds each parsed line to either a [`ClientSession`] or a [`PeerSession`].
//! Which opcodes a session accepts depends on the node's [`Role`]:
//!
//! | Role        | `client` opcodes         | `server` opcodes      |
//! |-------------|--------------------------|-----------------------|
//! | write       | `L` `R` `RE` `D` `W` `T` `B` | `O`               |
//! | coordinator | none                     | `L` `U` `R` `O` `C`   |
//! | replica     | `RE` `B`                 | `R` `O` `C`           |

use std::{collections::HashMap, sync::Arc, time::Duration};

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::{
    config::Role,
    error::LedgerError,
    lock_table::{LockGuard, LockTable, WorkerId},
    protocol::{
        AccountNumber, ClientRequest, DUPLICATE_REPLY, LOGIN_OK_SUFFIX, Nonce, OpType, ParseError,
        PeerRequest, REAUTH_OK, Registration, UnlockReply, UserId, flag_line, format_amount,
    },
    replication::Replicator,
    store::LedgerStore,
    teller,
};

pub const MALFORMED_REPLY: &str = "Malformed request!";
pub const UNKNOWN_ISSUE_REPLY: &str =
    "There was a unknown issue in your request, please try again!";
const INVALID_ACCOUNT_REPLY: &str = "The account number you entered was invalid!";

/// Nonce used for locks taken on behalf of an unlock that arrived without a
/// matching lock. Such locks never record a result.
const UNRECORDED_NONCE: Nonce = Nonce(0);

/// Everything a connection worker needs, created once per node.
pub struct Services {
    role: Role,
    store: Arc<dyn LedgerStore>,
    locks: Arc<LockTable>,
    replicator: Option<Replicator>,
    lock_wait: Duration,
}

impl Services {
    pub fn new(
        role: Role,
        store: Arc<dyn LedgerStore>,
        locks: Arc<LockTable>,
        replicator: Option<Replicator>,
        lock_wait: Duration,
    ) -> Self {
        Self {
            role,
            store,
            locks,
            replicator,
            lock_wait,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn replicator(&self) -> Option<&Replicator> {
        self.replicator.as_ref()
    }

    /// Replaces the whole ledger with a dump received from a peer.
    pub fn full_sync(&self, dump: &str) -> Result<(), LedgerError> {
        self.store.restore_all(dump)
    }
}

fn unsupported(opcode: &str) -> ParseError {
    ParseError::UnknownOpcode(opcode.to_string())
}

/// Logical state of one `client` connection.
#[derive(Debug)]
pub struct ClientSession {
    owner: WorkerId,
    user_id: Option<UserId>,
}

impl ClientSession {
    pub fn new(owner: WorkerId) -> Self {
        Self {
            owner,
            user_id: None,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    /// Parses and serves one request line, returning the reply line.
    pub async fn handle_line(
        &mut self,
        services: &Services,
        line: &str,
    ) -> Result<String, ParseError> {
        let request = ClientRequest::parse(line)?;
        let opcode = line.split_whitespace().next().unwrap_or_default();
        match (services.role, request) {
            (Role::Write | Role::Replica, ClientRequest::Reauth { user_id }) => {
                self.user_id = Some(user_id);
                debug!(owner = self.owner, user_id, "session re-authenticated");
                Ok(REAUTH_OK.to_string())
            }
            (Role::Write | Role::Replica, ClientRequest::Balance { user_id, account }) => {
                Ok(balance_reply(services.store.as_ref(), user_id, &account))
            }
            (Role::Write, ClientRequest::Login { username, password }) => {
                Ok(self.login(services, &username, &password))
            }
            (Role::Write, ClientRequest::Register(registration)) => {
                Ok(register_reply(services, &registration).await)
            }
            (
                Role::Write,
                ClientRequest::Deposit {
                    account,
                    amount,
                    nonce,
                },
            ) => Ok(self
                .transact(services, OpType::Deposit, vec![account], amount, nonce)
                .await),
            (
                Role::Write,
                ClientRequest::Withdraw {
                    account,
                    amount,
                    nonce,
                },
            ) => Ok(self
                .transact(services, OpType::Withdraw, vec![account], amount, nonce)
                .await),
            (
                Role::Write,
                ClientRequest::Transfer {
                    from,
                    to,
                    amount,
                    nonce,
                },
            ) => Ok(self
                .transact(services, OpType::Transfer, vec![from, to], amount, nonce)
                .await),
            _ => Err(unsupported(opcode)),
        }
    }

    fn login(&mut self, services: &Services, username: &str, password: &str) -> String {
        match services.store.login(username, password) {
            Some(user_id) => {
                self.user_id = Some(user_id);
                info!(owner = self.owner, user_id, "user logged in");
                format!("{user_id}{LOGIN_OK_SUFFIX}")
            }
            None => "Incorrect username or password!".to_string(),
        }
    }

    async fn transact(
        &self,
        services: &Services,
        op: OpType,
        accounts: Vec<AccountNumber>,
        amount: Decimal,
        nonce: Nonce,
    ) -> String {
        let (Some(user_id), Some(replicator)) = (self.user_id, services.replicator.as_ref()) else {
            return transaction_error_reply(op, &LedgerError::Invalid);
        };
        match replicator
            .execute(self.owner, user_id, op, &accounts, amount, nonce)
            .await
        {
            Ok(applied) => {
                let after = applied.primary();
                match op {
                    OpType::Deposit => format!(
                        "Your balance before deposit was: {}. Your balance after deposit is: {}.",
                        format_amount(after - amount),
                        format_amount(after)
                    ),
                    OpType::Withdraw => format!(
                        "Your balance before withdraw was: {}. Your balance after withdraw is: {}.",
                        format_amount(after + amount),
                        format_amount(after)
                    ),
                    OpType::Transfer => {
                        format!("Your balance after transfer: {}.", format_amount(after))
                    }
                }
            }
            Err(LedgerError::DuplicateTransaction { recorded }) => {
                info!(%op, %nonce, %recorded, "duplicate transaction suppressed");
                DUPLICATE_REPLY.to_string()
            }
            Err(err) => {
                debug!(%op, %nonce, error = %err, "transaction failed");
                transaction_error_reply(op, &err)
            }
        }
    }
}

fn transaction_error_reply(op: OpType, err: &LedgerError) -> String {
    let reply = match (op, err) {
        (OpType::Transfer, LedgerError::Invalid) => {
            "The account number you wanted to transfer from was invalid!"
        }
        (_, LedgerError::Invalid) => INVALID_ACCOUNT_REPLY,
        (OpType::Withdraw, LedgerError::Logic) => {
            "The balance in the given account is insufficient for withdraw!"
        }
        (OpType::Transfer, LedgerError::Logic) => {
            "The balance in the given account is insufficient to make this transfer!"
        }
        (_, LedgerError::Destination) => "The account number you wanted to transfer was invalid!",
        (_, LedgerError::DuplicateTransaction { .. }) => DUPLICATE_REPLY,
        _ => UNKNOWN_ISSUE_REPLY,
    };
    reply.to_string()
}

fn balance_reply(store: &dyn LedgerStore, user_id: UserId, account: &AccountNumber) -> String {
    match store.get_balance(account, user_id) {
        Ok(balance) => format!("Your balance is: {}.", format_amount(balance)),
        Err(LedgerError::Invalid) => INVALID_ACCOUNT_REPLY.to_string(),
        Err(err) => {
            warn!(%account, error = %err, "balance lookup failed");
            UNKNOWN_ISSUE_REPLY.to_string()
        }
    }
}

async fn register_reply(services: &Services, registration: &Registration) -> String {
    let Some(replicator) = services.replicator.as_ref() else {
        return "Your registration failed!".to_string();
    };
    match replicator.register(registration).await {
        Ok((user_id, Ok(account))) => {
            info!(user_id, %account, "user registered");
            format!(
                "You have successfully registered your account! Your account number is: {account}"
            )
        }
        Ok((user_id, Err(err))) => {
            warn!(user_id, error = %err, "account creation failed after registration");
            "Your registration was successful but there was some issue in creating your account!"
                .to_string()
        }
        Err(err) => {
            debug!(username = %registration.username, error = %err, "registration refused");
            "Your registration failed!".to_string()
        }
    }
}

/// State of one `server` connection: the locks it was granted by `L` and not
/// yet consumed by `U`. Dropping the session releases them.
#[derive(Debug)]
pub struct PeerSession {
    owner: WorkerId,
    held: HashMap<AccountNumber, LockGuard>,
}

impl PeerSession {
    pub fn new(owner: WorkerId) -> Self {
        Self {
            owner,
            held: HashMap::new(),
        }
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Serves one peer request other than a full sync, returning its reply.
    pub async fn handle(
        &mut self,
        services: &Services,
        request: PeerRequest,
    ) -> Result<String, ParseError> {
        match (services.role, request) {
            (
                Role::Coordinator,
                PeerRequest::Lock {
                    accounts,
                    op,
                    nonce,
                },
            ) => Ok(flag_line(self.lock(services, &accounts, op, nonce).await).to_string()),
            (
                Role::Coordinator,
                PeerRequest::Unlock {
                    user_id,
                    accounts,
                    op,
                    amount,
                },
            ) => Ok(self.unlock(services, user_id, &accounts, op, amount).await),
            (
                Role::Coordinator | Role::Replica,
                PeerRequest::Register {
                    user_id,
                    registration,
                    account,
                },
            ) => {
                let mirrored = services
                    .store
                    .register_with_id(user_id, &registration, &account);
                if let Err(err) = &mirrored {
                    warn!(user_id, %account, error = %err, "mirrored registration failed");
                }
                Ok(flag_line(mirrored.is_ok()).to_string())
            }
            (Role::Coordinator | Role::Replica, PeerRequest::Overwrite { account, balance }) => {
                let written = services.store.overwrite_balance(&account, balance);
                if let Err(err) = &written {
                    warn!(%account, error = %err, "balance overwrite failed");
                }
                Ok(flag_line(written.is_ok()).to_string())
            }
            (_, request) => Err(unsupported(
                request.to_line().split_whitespace().next().unwrap_or_default(),
            )),
        }
    }

    async fn lock(
        &mut self,
        services: &Services,
        accounts: &[AccountNumber],
        op: OpType,
        nonce: Nonce,
    ) -> bool {
        // Locks left over from an abandoned round-trip on this connection.
        for account in accounts {
            self.held.remove(account);
        }
        match services
            .locks
            .acquire_all(accounts, op, nonce, self.owner, services.lock_wait)
            .await
        {
            Ok(guards) => {
                for guard in guards {
                    self.held.insert(guard.account().clone(), guard);
                }
                true
            }
            Err(err) => {
                debug!(%op, %nonce, error = %err, "remote lock refused");
                false
            }
        }
    }

    async fn unlock(
        &mut self,
        services: &Services,
        user_id: UserId,
        accounts: &[AccountNumber],
        op: OpType,
        amount: Decimal,
    ) -> String {
        let mut guards = Vec::with_capacity(accounts.len());
        let mut missing = Vec::new();
        for account in accounts {
            match self.held.remove(account) {
                Some(guard) if guard.op() == op => guards.push(guard),
                Some(guard) => {
                    warn!(
                        %account,
                        held = %guard.op(),
                        requested = %op,
                        "unlock for a different operation"
                    );
                    return UnlockReply::Rejected.to_line();
                }
                None => missing.push(account.clone()),
            }
        }
        if !missing.is_empty() {
            warn!(?missing, %op, "unlock without a held lock, locking temporarily");
            match services
                .locks
                .acquire_all(&missing, op, UNRECORDED_NONCE, self.owner, services.lock_wait)
                .await
            {
                Ok(temporary) => {
                    let applied =
                        teller::apply(services.store.as_ref(), user_id, op, accounts, amount);
                    drop(temporary);
                    drop(guards);
                    return match applied {
                        Ok(applied) => UnlockReply::Applied(applied.result_line()).to_line(),
                        Err(_) => UnlockReply::Rejected.to_line(),
                    };
                }
                Err(err) => {
                    warn!(%op, error = %err, "could not lock for orphaned unlock");
                    return UnlockReply::Rejected.to_line();
                }
            }
        }

        match teller::apply(services.store.as_ref(), user_id, op, accounts, amount) {
            Ok(applied) => {
                let result = applied.result_line();
                let mut reply = UnlockReply::Applied(result.clone()).to_line();
                for guard in guards {
                    reply = guard.unlock(user_id, amount, &result);
                }
                reply
            }
            Err(err) => {
                debug!(%op, error = %err, "mirrored mutation failed");
                UnlockReply::Rejected.to_line()
            }
        }
    }
}
