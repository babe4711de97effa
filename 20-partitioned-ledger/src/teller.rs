//! Balance arithmetic on top of a [`LedgerStore`].
//!
//! Callers must hold the lock on every account they pass in; nothing here
//! serializes concurrent mutations on its own.

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::{
    error::LedgerError,
    protocol::{AccountNumber, OpType, UserId, format_amount},
    store::LedgerStore,
};

/// Balances after a committed mutation, source account first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub balances: Vec<(AccountNumber, Decimal)>,
}

impl Applied {
    /// Balance of the account the operation was charged to.
    pub fn primary(&self) -> Decimal {
        self.balances
            .first()
            .map(|(_, balance)| *balance)
            .unwrap_or_default()
    }

    /// Space-separated balances, the form carried by unlock replies.
    pub fn result_line(&self) -> String {
        self.balances
            .iter()
            .map(|(_, balance)| format_amount(*balance))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Applies `op` for `user_id` against `accounts` (one account, or source and
/// destination for a transfer).
pub fn apply(
    store: &dyn LedgerStore,
    user_id: UserId,
    op: OpType,
    accounts: &[AccountNumber],
    amount: Decimal,
) -> Result<Applied, LedgerError> {
    match (op, accounts) {
        (OpType::Deposit, [account]) => deposit(store, user_id, account, amount),
        (OpType::Withdraw, [account]) => withdraw(store, user_id, account, amount),
        (OpType::Transfer, [from, to]) => transfer(store, user_id, from, to, amount),
        _ => Err(LedgerError::Logic),
    }
}

pub fn deposit(
    store: &dyn LedgerStore,
    user_id: UserId,
    account: &AccountNumber,
    amount: Decimal,
) -> Result<Applied, LedgerError> {
    let before = store.get_balance(account, user_id)?;
    let after = before.checked_add(amount).ok_or(LedgerError::Logic)?;
    store.apply_delta(account, Some(user_id), after)?;
    debug!(%account, %before, %after, "deposit applied");
    Ok(Applied {
        balances: vec![(account.clone(), after)],
    })
}

pub fn withdraw(
    store: &dyn LedgerStore,
    user_id: UserId,
    account: &AccountNumber,
    amount: Decimal,
) -> Result<Applied, LedgerError> {
    let before = store.get_balance(account, user_id)?;
    if before < amount {
        debug!(%account, %before, %amount, "insufficient balance for withdraw");
        return Err(LedgerError::Logic);
    }
    let after = before - amount;
    store.apply_delta(account, Some(user_id), after)?;
    debug!(%account, %before, %after, "withdraw applied");
    Ok(Applied {
        balances: vec![(account.clone(), after)],
    })
}

/// Moves `amount` from an account owned by `user_id` to any other account.
///
/// Both accounts are validated before either balance changes, so a bad
/// destination leaves the source untouched.
pub fn transfer(
    store: &dyn LedgerStore,
    user_id: UserId,
    from: &AccountNumber,
    to: &AccountNumber,
    amount: Decimal,
) -> Result<Applied, LedgerError> {
    if from == to {
        return Err(LedgerError::Destination);
    }

    let from_before = store.get_balance(from, user_id)?;
    if from_before < amount {
        return Err(LedgerError::Logic);
    }
    let to_before = store.account_balance(to).map_err(|err| match err {
        LedgerError::Invalid => LedgerError::Destination,
        other => other,
    })?;

    let to_after = to_before.checked_add(amount).ok_or(LedgerError::Logic)?;
    let from_after = from_before - amount;
    store.apply_delta(from, Some(user_id), from_after)?;
    if let Err(err) = store.apply_delta(to, None, to_after) {
        warn!(%from, %to, error = %err, "credit failed, restoring source balance");
        store.apply_delta(from, Some(user_id), from_before)?;
        return Err(match err {
            LedgerError::Invalid => LedgerError::Destination,
            other => other,
        });
    }

    debug!(%from, %to, %amount, "transfer applied");
    Ok(Applied {
        balances: vec![(from.clone(), from_after), (to.clone(), to_after)],
    })
}
