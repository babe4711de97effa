//! Ledger Store: durable per-account balance storage.
//!
//! The lock protocol only talks to storage through [`LedgerStore`]. The
//! in-memory implementation speaks the same full-dump dialect as a SQL
//! backend (a schema reset followed by literal `INSERT` statements), so dumps
//! can be shipped between nodes and written to snapshot files unchanged.

use std::{collections::BTreeMap, path::Path, sync::Mutex};

use anyhow::{Context, Result};
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::{
    error::LedgerError,
    protocol::{AccountNumber, Registration, UserId},
};

const ACCOUNT_NUMBER_DIGITS: usize = 10;

const SCHEMA_RESET: &[&str] = &[
    "DROP TABLE IF EXISTS accounts",
    "DROP TABLE IF EXISTS users",
    "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT, password TEXT, first_name TEXT, last_name TEXT, email TEXT)",
    "CREATE TABLE accounts (account_number INTEGER PRIMARY KEY, user_id INTEGER, balance REAL, FOREIGN KEY (user_id) REFERENCES users(id))",
];

pub trait LedgerStore: Send + Sync {
    /// Balance of `account`, which must be owned by `user_id`.
    fn get_balance(&self, account: &AccountNumber, user_id: UserId) -> Result<Decimal, LedgerError>;

    /// Balance of `account` regardless of its owner.
    fn account_balance(&self, account: &AccountNumber) -> Result<Decimal, LedgerError>;

    /// Stores `new_balance`. With `owner` set the account must belong to it.
    fn apply_delta(
        &self,
        account: &AccountNumber,
        owner: Option<UserId>,
        new_balance: Decimal,
    ) -> Result<(), LedgerError>;

    fn login(&self, username: &str, password: &str) -> Option<UserId>;

    fn register(&self, registration: &Registration) -> Result<UserId, LedgerError>;

    /// Creates the user row and an empty account with identifiers chosen by
    /// another node.
    fn register_with_id(
        &self,
        user_id: UserId,
        registration: &Registration,
        account: &AccountNumber,
    ) -> Result<(), LedgerError>;

    fn create_account(&self, user_id: UserId) -> Result<AccountNumber, LedgerError>;

    fn dump_all(&self) -> String;

    fn restore_all(&self, dump: &str) -> Result<(), LedgerError>;

    /// Sets a balance without any ownership check. Peer channel only.
    fn overwrite_balance(&self, account: &AccountNumber, balance: Decimal)
    -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UserRow {
    username: String,
    password: String,
    first_name: String,
    last_name: String,
    email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AccountRow {
    user_id: UserId,
    balance: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Tables {
    users: Option<BTreeMap<UserId, UserRow>>,
    accounts: Option<BTreeMap<AccountNumber, AccountRow>>,
}

impl Tables {
    fn empty_schema() -> Self {
        Self {
            users: Some(BTreeMap::new()),
            accounts: Some(BTreeMap::new()),
        }
    }

    fn users(&self) -> Result<&BTreeMap<UserId, UserRow>, LedgerError> {
        self.users.as_ref().ok_or_else(|| no_such_table("users"))
    }

    fn users_mut(&mut self) -> Result<&mut BTreeMap<UserId, UserRow>, LedgerError> {
        self.users.as_mut().ok_or_else(|| no_such_table("users"))
    }

    fn accounts(&self) -> Result<&BTreeMap<AccountNumber, AccountRow>, LedgerError> {
        self.accounts.as_ref().ok_or_else(|| no_such_table("accounts"))
    }

    fn accounts_mut(&mut self) -> Result<&mut BTreeMap<AccountNumber, AccountRow>, LedgerError> {
        self.accounts
            .as_mut()
            .ok_or_else(|| no_such_table("accounts"))
    }

    fn execute(&mut self, statement: &str) -> Result<(), LedgerError> {
        if let Some(table) = statement.strip_prefix("DROP TABLE IF EXISTS ") {
            match table.trim() {
                "users" => self.users = None,
                "accounts" => self.accounts = None,
                other => return Err(no_such_table(other)),
            }
            return Ok(());
        }

        if let Some(rest) = statement.strip_prefix("CREATE TABLE ") {
            let table = rest.split_whitespace().next().unwrap_or_default();
            let slot_taken = match table {
                "users" => self.users.replace(BTreeMap::new()).is_some(),
                "accounts" => self.accounts.replace(BTreeMap::new()).is_some(),
                other => return Err(no_such_table(other)),
            };
            if slot_taken {
                return Err(LedgerError::Storage(format!("table {table} already exists")));
            }
            return Ok(());
        }

        if let Some(rest) = statement.strip_prefix("INSERT INTO ") {
            let (table, values) = rest
                .split_once(" VALUES ")
                .ok_or_else(|| syntax_error(statement))?;
            let values = parse_values(values.trim()).ok_or_else(|| syntax_error(statement))?;
            return self.insert(table.trim(), values);
        }

        Err(syntax_error(statement))
    }

    fn insert(&mut self, table: &str, values: Vec<String>) -> Result<(), LedgerError> {
        match table {
            "users" => {
                let [id, username, password, first_name, last_name, email]: [String; 6] =
                    values.try_into().map_err(|_| column_mismatch(table))?;
                let id: UserId = id.parse().map_err(|_| column_mismatch(table))?;
                let row = UserRow {
                    username,
                    password,
                    first_name,
                    last_name,
                    email,
                };
                if self.users_mut()?.insert(id, row).is_some() {
                    return Err(unique_violation(table));
                }
            }
            "accounts" => {
                let [account, user_id, balance]: [String; 3] =
                    values.try_into().map_err(|_| column_mismatch(table))?;
                let account: AccountNumber =
                    account.parse().map_err(|_| column_mismatch(table))?;
                let row = AccountRow {
                    user_id: user_id.parse().map_err(|_| column_mismatch(table))?,
                    balance: balance.parse().map_err(|_| column_mismatch(table))?,
                };
                if self.accounts_mut()?.insert(account, row).is_some() {
                    return Err(unique_violation(table));
                }
            }
            other => return Err(no_such_table(other)),
        }
        Ok(())
    }
}

fn no_such_table(table: &str) -> LedgerError {
    LedgerError::Storage(format!("no such table: {table}"))
}

fn syntax_error(statement: &str) -> LedgerError {
    LedgerError::Storage(format!("unsupported statement: {statement}"))
}

fn column_mismatch(table: &str) -> LedgerError {
    LedgerError::Storage(format!("column mismatch inserting into {table}"))
}

fn unique_violation(table: &str) -> LedgerError {
    LedgerError::Storage(format!("UNIQUE constraint failed on {table}"))
}

/// In-memory store guarded by a single mutex.
#[derive(Debug)]
pub struct MemoryLedger {
    tables: Mutex<Tables>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::empty_schema()),
        }
    }

    /// Loads a store from a snapshot file written by [`MemoryLedger::save_snapshot`].
    pub async fn open_snapshot(path: &Path) -> Result<Self> {
        let dump = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let store = Self::new();
        store
            .restore_all(dump.trim_end())
            .with_context(|| format!("snapshot {} is not a valid dump", path.display()))?;
        info!(path = %path.display(), "ledger restored from snapshot");
        Ok(store)
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let mut dump = self.dump_all();
        dump.push('\n');
        tokio::fs::write(path, dump)
            .await
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        info!(path = %path.display(), "ledger snapshot written");
        Ok(())
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut tables)
    }
}

impl LedgerStore for MemoryLedger {
    fn get_balance(
        &self,
        account: &AccountNumber,
        user_id: UserId,
    ) -> Result<Decimal, LedgerError> {
        self.with_tables(|tables| match tables.accounts()?.get(account) {
            Some(row) if row.user_id == user_id => Ok(row.balance),
            _ => Err(LedgerError::Invalid),
        })
    }

    fn account_balance(&self, account: &AccountNumber) -> Result<Decimal, LedgerError> {
        self.with_tables(|tables| {
            tables
                .accounts()?
                .get(account)
                .map(|row| row.balance)
                .ok_or(LedgerError::Invalid)
        })
    }

    fn apply_delta(
        &self,
        account: &AccountNumber,
        owner: Option<UserId>,
        new_balance: Decimal,
    ) -> Result<(), LedgerError> {
        self.with_tables(|tables| {
            let row = tables
                .accounts_mut()?
                .get_mut(account)
                .ok_or(LedgerError::Invalid)?;
            if owner.is_some_and(|owner| owner != row.user_id) {
                return Err(LedgerError::Invalid);
            }
            row.balance = new_balance;
            Ok(())
        })
    }

    fn login(&self, username: &str, password: &str) -> Option<UserId> {
        self.with_tables(|tables| {
            tables.users().ok()?.iter().find_map(|(id, user)| {
                (user.username == username && user.password == password).then_some(*id)
            })
        })
    }

    fn register(&self, registration: &Registration) -> Result<UserId, LedgerError> {
        self.with_tables(|tables| {
            let users = tables.users_mut()?;
            if users
                .values()
                .any(|user| user.username == registration.username)
            {
                return Err(LedgerError::Logic);
            }
            let id = users.keys().next_back().map_or(1, |last| last + 1);
            users.insert(id, user_row(registration));
            debug!(user_id = id, username = %registration.username, "user registered");
            Ok(id)
        })
    }

    fn register_with_id(
        &self,
        user_id: UserId,
        registration: &Registration,
        account: &AccountNumber,
    ) -> Result<(), LedgerError> {
        self.with_tables(|tables| {
            if tables.users()?.contains_key(&user_id) || tables.accounts()?.contains_key(account) {
                return Err(LedgerError::Logic);
            }
            tables.users_mut()?.insert(user_id, user_row(registration));
            tables.accounts_mut()?.insert(
                account.clone(),
                AccountRow {
                    user_id,
                    balance: Decimal::ZERO,
                },
            );
            Ok(())
        })
    }

    fn create_account(&self, user_id: UserId) -> Result<AccountNumber, LedgerError> {
        self.with_tables(|tables| {
            if !tables.users()?.contains_key(&user_id) {
                return Err(LedgerError::Invalid);
            }
            let accounts = tables.accounts_mut()?;
            let mut rng = rand::thread_rng();
            let account = loop {
                let digits: String = (0..ACCOUNT_NUMBER_DIGITS)
                    .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                    .collect();
                let candidate: AccountNumber = digits
                    .parse()
                    .map_err(LedgerError::Storage)?;
                if !accounts.contains_key(&candidate) {
                    break candidate;
                }
            };
            accounts.insert(
                account.clone(),
                AccountRow {
                    user_id,
                    balance: Decimal::ZERO,
                },
            );
            Ok(account)
        })
    }

    fn dump_all(&self) -> String {
        self.with_tables(|tables| {
            let mut dump = String::new();
            for statement in SCHEMA_RESET {
                dump.push_str(statement);
                dump.push(';');
            }
            for (id, user) in tables.users.iter().flatten() {
                push_insert(
                    &mut dump,
                    "users",
                    &[
                        &id.to_string(),
                        &user.username,
                        &user.password,
                        &user.first_name,
                        &user.last_name,
                        &user.email,
                    ],
                );
            }
            for (account, row) in tables.accounts.iter().flatten() {
                push_insert(
                    &mut dump,
                    "accounts",
                    &[
                        account.as_str(),
                        &row.user_id.to_string(),
                        &row.balance.to_string(),
                    ],
                );
            }
            dump
        })
    }

    fn restore_all(&self, dump: &str) -> Result<(), LedgerError> {
        self.with_tables(|tables| {
            // Statements run against a copy so a failing dump leaves the
            // current state untouched.
            let mut staged = tables.clone();
            for statement in split_statements(dump) {
                staged.execute(&statement)?;
            }
            *tables = staged;
            Ok(())
        })?;
        info!("ledger overwritten from full dump");
        Ok(())
    }

    fn overwrite_balance(
        &self,
        account: &AccountNumber,
        balance: Decimal,
    ) -> Result<(), LedgerError> {
        self.apply_delta(account, None, balance)?;
        debug!(%account, %balance, "balance overwritten");
        Ok(())
    }
}

fn user_row(registration: &Registration) -> UserRow {
    UserRow {
        username: registration.username.clone(),
        password: registration.password.clone(),
        first_name: registration.first_name.clone(),
        last_name: registration.last_name.clone(),
        email: registration.email.clone(),
    }
}

fn push_insert(dump: &mut String, table: &str, values: &[&str]) {
    let quoted: Vec<String> = values
        .iter()
        .map(|value| format!("'{}'", value.replace('\'', "''")))
        .collect();
    dump.push_str(&format!("INSERT INTO {table} VALUES ({});", quoted.join(",")));
}

/// Splits a dump on `;`, ignoring terminators inside quoted literals.
fn split_statements(dump: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for ch in dump.chars() {
        match ch {
            '\'' => {
                quoted = !quoted;
                current.push(ch);
            }
            ';' if !quoted => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}

/// Parses `('a','b',...)` into its unquoted values.
fn parse_values(raw: &str) -> Option<Vec<String>> {
    let inner = raw.strip_prefix('(')?.strip_suffix(')')?;
    let mut values = Vec::new();
    let mut chars = inner.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next()? != '\'' {
            return None;
        }
        let mut value = String::new();
        loop {
            match chars.next()? {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    value.push('\'');
                }
                '\'' => break,
                other => value.push(other),
            }
        }
        values.push(value);

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        match chars.next() {
            Some(',') => continue,
            None => return Some(values),
            Some(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn registration(username: &str) -> Registration {
        Registration {
            username: username.to_string(),
            password: "pw".into(),
            first_name: "First".into(),
            last_name: "Last".into(),
            email: format!("{username}@example.com"),
        }
    }

    fn seeded() -> (MemoryLedger, UserId, AccountNumber) {
        let store = MemoryLedger::new();
        let user = store.register(&registration("alice")).expect("register");
        let account = store.create_account(user).expect("account");
        store
            .apply_delta(&account, Some(user), dec!(500.00))
            .expect("seed balance");
        (store, user, account)
    }

    #[test]
    fn balance_requires_ownership() {
        let (store, user, account) = seeded();
        assert_eq!(store.get_balance(&account, user), Ok(dec!(500.00)));
        assert_eq!(store.get_balance(&account, user + 1), Err(LedgerError::Invalid));
        assert_eq!(store.account_balance(&account), Ok(dec!(500.00)));
    }

    #[test]
    fn login_matches_credentials() {
        let (store, user, _) = seeded();
        assert_eq!(store.login("alice", "pw"), Some(user));
        assert_eq!(store.login("alice", "wrong"), None);
        assert_eq!(store.register(&registration("alice")), Err(LedgerError::Logic));
    }

    #[test]
    fn generated_account_numbers_are_ten_digits_and_unique() {
        let store = MemoryLedger::new();
        let user = store.register(&registration("bob")).expect("register");
        let first = store.create_account(user).expect("first");
        let second = store.create_account(user).expect("second");
        assert_eq!(first.as_str().len(), 10);
        assert_ne!(first, second);
        assert_eq!(store.create_account(99), Err(LedgerError::Invalid));
    }

    #[test]
    fn restore_of_dump_reproduces_rows() {
        let (store, _, _) = seeded();
        let bob = store.register(&registration("o'brien")).expect("register");
        store.create_account(bob).expect("account");
        let dump = store.dump_all();

        let replica = MemoryLedger::new();
        replica.restore_all(&dump).expect("restore");
        assert_eq!(replica.dump_all(), dump);
        assert_eq!(replica.login("o'brien", "pw"), Some(bob));
    }

    #[test]
    fn dump_resets_schema_first() {
        let dump = MemoryLedger::new().dump_all();
        assert!(dump.starts_with(
            "DROP TABLE IF EXISTS accounts;DROP TABLE IF EXISTS users;CREATE TABLE users"
        ));
    }

    #[test]
    fn failing_statement_aborts_restore_without_partial_state() {
        let (store, user, account) = seeded();
        let before = store.dump_all();
        let broken = "DROP TABLE IF EXISTS accounts;DROP TABLE IF EXISTS users;INSERT INTO users VALUES ('1','x','x','x','x','x');";
        assert!(matches!(store.restore_all(broken), Err(LedgerError::Storage(_))));
        assert_eq!(store.dump_all(), before);
        assert_eq!(store.get_balance(&account, user), Ok(dec!(500.00)));
    }

    #[test]
    fn overwrite_bypasses_ownership() {
        let (store, _, account) = seeded();
        store.overwrite_balance(&account, dec!(12.50)).expect("overwrite");
        assert_eq!(store.account_balance(&account), Ok(dec!(12.50)));
        let missing: AccountNumber = "42".parse().unwrap();
        assert_eq!(store.overwrite_balance(&missing, dec!(1)), Err(LedgerError::Invalid));
    }

    #[test]
    fn register_with_id_mirrors_remote_rows() {
        let store = MemoryLedger::new();
        let account: AccountNumber = "1234567890".parse().unwrap();
        store
            .register_with_id(7, &registration("carol"), &account)
            .expect("mirror");
        assert_eq!(store.login("carol", "pw"), Some(7));
        assert_eq!(store.get_balance(&account, 7), Ok(Decimal::ZERO));
        assert_eq!(
            store.register_with_id(7, &registration("carol"), &account),
            Err(LedgerError::Logic)
        );
    }

    #[test]
    fn splitter_respects_quotes() {
        let statements = split_statements("INSERT INTO users VALUES ('1','a;b','','','','');;  ");
        assert_eq!(statements.len(), 1);
        assert_eq!(
            parse_values("('1','a;b','it''s')"),
            Some(vec!["1".into(), "a;b".into(), "it's".into()])
        );
        assert_eq!(parse_values("('1',2)"), None);
    }
}
