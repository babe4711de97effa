//! Text line protocol spoken between clients and nodes, and between nodes.
//!
//! Every frame is a single newline-terminated line of space-separated ASCII
//! tokens whose first token is an opcode. The same opcode can mean different
//! things depending on who is talking (`L` is a login from a client but a lock
//! request from a peer node), so client and peer frames are parsed by separate
//! types, selected by the identity frame sent when the connection opens.

use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use thiserror::Error;

pub type UserId = u64;

/// Reply sent after a successful re-authentication.
pub const REAUTH_OK: &str = "OK";
/// Reply sent when a retried transaction was already applied.
pub const DUPLICATE_REPLY: &str = "DTE";
/// Suffix appended to the user id on a successful login.
pub const LOGIN_OK_SUFFIX: &str = "%OK";
/// Opcode line that precedes a full dump.
pub const FULL_SYNC_OPCODE: &str = "O";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty request")]
    Empty,
    #[error("unknown opcode '{0}'")]
    UnknownOpcode(String),
    #[error("malformed '{opcode}' request: {reason}")]
    Malformed { opcode: String, reason: String },
}

fn malformed(opcode: &str, reason: impl Into<String>) -> ParseError {
    ParseError::Malformed {
        opcode: opcode.to_string(),
        reason: reason.into(),
    }
}

/// Opaque numeric account identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountNumber(String);

impl AccountNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AccountNumber {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("'{raw}' is not an account number"));
        }
        Ok(Self(raw.to_string()))
    }
}

impl fmt::Display for AccountNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-generated random value identifying one logical transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce(pub u64);

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Nonce {
    type Err = std::num::ParseIntError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        raw.parse().map(Nonce)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Deposit,
    Withdraw,
    Transfer,
}

impl OpType {
    pub fn code(self) -> &'static str {
        match self {
            OpType::Deposit => "D",
            OpType::Withdraw => "W",
            OpType::Transfer => "T",
        }
    }
}

impl FromStr for OpType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "D" => Ok(OpType::Deposit),
            "W" => Ok(OpType::Withdraw),
            "T" => Ok(OpType::Transfer),
            other => Err(format!("unknown operation type '{other}'")),
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// First frame on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Client,
    Server,
}

impl Identity {
    pub fn as_str(self) -> &'static str {
        match self {
            Identity::Client => "client",
            Identity::Server => "server",
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "client" => Some(Identity::Client),
            "server" => Some(Identity::Server),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub username: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl Registration {
    fn from_tokens(opcode: &str, tokens: &[&str]) -> Result<Self, ParseError> {
        match tokens {
            [username, password, first_name, last_name, email] => Ok(Self {
                username: username.to_string(),
                password: password.to_string(),
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
                email: email.to_string(),
            }),
            _ => Err(malformed(
                opcode,
                "expected username password first_name last_name email",
            )),
        }
    }

    fn tokens(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.username, self.password, self.first_name, self.last_name, self.email
        )
    }
}

/// Requests accepted on a `client` connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Login {
        username: String,
        password: String,
    },
    Register(Registration),
    Reauth {
        user_id: UserId,
    },
    Deposit {
        account: AccountNumber,
        amount: Decimal,
        nonce: Nonce,
    },
    Withdraw {
        account: AccountNumber,
        amount: Decimal,
        nonce: Nonce,
    },
    Transfer {
        from: AccountNumber,
        to: AccountNumber,
        amount: Decimal,
        nonce: Nonce,
    },
    Balance {
        user_id: UserId,
        account: AccountNumber,
    },
}

impl ClientRequest {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&opcode, args)) = tokens.split_first() else {
            return Err(ParseError::Empty);
        };

        match opcode {
            "L" => match args {
                [username, password] => Ok(ClientRequest::Login {
                    username: username.to_string(),
                    password: password.to_string(),
                }),
                _ => Err(malformed(opcode, "expected username password")),
            },
            "R" => Registration::from_tokens(opcode, args).map(ClientRequest::Register),
            "RE" => match args {
                [user_id] => Ok(ClientRequest::Reauth {
                    user_id: parse_user_id(opcode, user_id)?,
                }),
                _ => Err(malformed(opcode, "expected user id")),
            },
            "D" | "W" => match args {
                [account, amount, nonce] => {
                    let account = parse_account(opcode, account)?;
                    let amount = parse_amount(opcode, amount)?;
                    let nonce = parse_nonce(opcode, nonce)?;
                    Ok(if opcode == "D" {
                        ClientRequest::Deposit {
                            account,
                            amount,
                            nonce,
                        }
                    } else {
                        ClientRequest::Withdraw {
                            account,
                            amount,
                            nonce,
                        }
                    })
                }
                _ => Err(malformed(opcode, "expected account amount nonce")),
            },
            "T" => match args {
                [from, to, amount, nonce] => Ok(ClientRequest::Transfer {
                    from: parse_account(opcode, from)?,
                    to: parse_account(opcode, to)?,
                    amount: parse_amount(opcode, amount)?,
                    nonce: parse_nonce(opcode, nonce)?,
                }),
                _ => Err(malformed(opcode, "expected from to amount nonce")),
            },
            "B" => match args {
                [user_id, account] => Ok(ClientRequest::Balance {
                    user_id: parse_user_id(opcode, user_id)?,
                    account: parse_account(opcode, account)?,
                }),
                _ => Err(malformed(opcode, "expected user id and account")),
            },
            other => Err(ParseError::UnknownOpcode(other.to_string())),
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            ClientRequest::Login { username, password } => format!("L {username} {password}"),
            ClientRequest::Register(registration) => format!("R {}", registration.tokens()),
            ClientRequest::Reauth { user_id } => format!("RE {user_id}"),
            ClientRequest::Deposit {
                account,
                amount,
                nonce,
            } => format!("D {account} {amount} {nonce}"),
            ClientRequest::Withdraw {
                account,
                amount,
                nonce,
            } => format!("W {account} {amount} {nonce}"),
            ClientRequest::Transfer {
                from,
                to,
                amount,
                nonce,
            } => format!("T {from} {to} {amount} {nonce}"),
            ClientRequest::Balance { user_id, account } => format!("B {user_id} {account}"),
        }
    }
}

/// Requests accepted on a `server` connection.
///
/// `FullSync` and `Overwrite` bypass the lock protocol and ownership checks,
/// which is why they only exist on the peer side of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    Lock {
        accounts: Vec<AccountNumber>,
        op: OpType,
        nonce: Nonce,
    },
    Unlock {
        user_id: UserId,
        accounts: Vec<AccountNumber>,
        op: OpType,
        amount: Decimal,
    },
    Register {
        user_id: UserId,
        registration: Registration,
        account: AccountNumber,
    },
    /// The dump itself travels on the following line.
    FullSync,
    Overwrite {
        account: AccountNumber,
        balance: Decimal,
    },
}

impl PeerRequest {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&opcode, args)) = tokens.split_first() else {
            return Err(ParseError::Empty);
        };

        match opcode {
            "L" => match args {
                [accounts, op, nonce] => Ok(PeerRequest::Lock {
                    accounts: parse_account_list(opcode, accounts)?,
                    op: parse_op(opcode, op)?,
                    nonce: parse_nonce(opcode, nonce)?,
                }),
                _ => Err(malformed(opcode, "expected accounts op nonce")),
            },
            "U" => match args {
                [user_id, accounts, op, amount] => Ok(PeerRequest::Unlock {
                    user_id: parse_user_id(opcode, user_id)?,
                    accounts: parse_account_list(opcode, accounts)?,
                    op: parse_op(opcode, op)?,
                    amount: parse_amount(opcode, amount)?,
                }),
                _ => Err(malformed(opcode, "expected user accounts op amount")),
            },
            "R" => match args {
                [user_id, rest @ .., account] if rest.len() == 5 => Ok(PeerRequest::Register {
                    user_id: parse_user_id(opcode, user_id)?,
                    registration: Registration::from_tokens(opcode, rest)?,
                    account: parse_account(opcode, account)?,
                }),
                _ => Err(malformed(opcode, "expected id, five user fields and account")),
            },
            "O" if args.is_empty() => Ok(PeerRequest::FullSync),
            "O" => Err(malformed(opcode, "dump must follow on the next line")),
            "C" => match args {
                [account, balance] => Ok(PeerRequest::Overwrite {
                    account: parse_account(opcode, account)?,
                    balance: parse_decimal(opcode, balance)?,
                }),
                _ => Err(malformed(opcode, "expected account balance")),
            },
            other => Err(ParseError::UnknownOpcode(other.to_string())),
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            PeerRequest::Lock {
                accounts,
                op,
                nonce,
            } => format!("L {} {op} {nonce}", join_accounts(accounts)),
            PeerRequest::Unlock {
                user_id,
                accounts,
                op,
                amount,
            } => format!("U {user_id} {} {op} {amount}", join_accounts(accounts)),
            PeerRequest::Register {
                user_id,
                registration,
                account,
            } => format!("R {user_id} {} {account}", registration.tokens()),
            PeerRequest::FullSync => FULL_SYNC_OPCODE.to_string(),
            PeerRequest::Overwrite { account, balance } => format!("C {account} {balance}"),
        }
    }
}

/// Outcome of a remote unlock round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockReply {
    /// Carries the balance text computed by the peer.
    Applied(String),
    Rejected,
}

impl UnlockReply {
    pub fn parse(line: &str) -> Self {
        match line.trim().split_once(' ') {
            Some(("true", rest)) => UnlockReply::Applied(rest.trim().to_string()),
            _ if line.trim() == "true" => UnlockReply::Applied(String::new()),
            _ => UnlockReply::Rejected,
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            UnlockReply::Applied(result) => format!("true {result}"),
            UnlockReply::Rejected => "false".to_string(),
        }
    }
}

/// Parses a bare `true`/`false` reply; anything else counts as `false`.
pub fn parse_flag(line: &str) -> bool {
    line.trim() == "true"
}

pub fn flag_line(flag: bool) -> &'static str {
    if flag {
        "true"
    } else {
        "false"
    }
}

/// Renders a currency amount with two decimal places.
pub fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", amount.round_dp(2))
}

fn join_accounts(accounts: &[AccountNumber]) -> String {
    accounts
        .iter()
        .map(AccountNumber::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_account(opcode: &str, raw: &str) -> Result<AccountNumber, ParseError> {
    raw.parse().map_err(|reason: String| malformed(opcode, reason))
}

fn parse_account_list(opcode: &str, raw: &str) -> Result<Vec<AccountNumber>, ParseError> {
    let accounts = raw
        .split(',')
        .map(|account| parse_account(opcode, account))
        .collect::<Result<Vec<_>, _>>()?;
    match accounts.len() {
        1 | 2 => Ok(accounts),
        _ => Err(malformed(opcode, "expected one or two accounts")),
    }
}

fn parse_user_id(opcode: &str, raw: &str) -> Result<UserId, ParseError> {
    raw.parse()
        .map_err(|_| malformed(opcode, format!("'{raw}' is not a user id")))
}

fn parse_nonce(opcode: &str, raw: &str) -> Result<Nonce, ParseError> {
    raw.parse()
        .map_err(|_| malformed(opcode, format!("'{raw}' is not a nonce")))
}

fn parse_op(opcode: &str, raw: &str) -> Result<OpType, ParseError> {
    raw.parse().map_err(|reason: String| malformed(opcode, reason))
}

fn parse_decimal(opcode: &str, raw: &str) -> Result<Decimal, ParseError> {
    let value: Decimal = raw
        .parse()
        .map_err(|_| malformed(opcode, format!("'{raw}' is not an amount")))?;
    if value.is_sign_negative() {
        return Err(malformed(opcode, "amount cannot be negative"));
    }
    Ok(value)
}

fn parse_amount(opcode: &str, raw: &str) -> Result<Decimal, ParseError> {
    let value = parse_decimal(opcode, raw)?;
    if value.is_zero() {
        return Err(malformed(opcode, "amount must be positive"));
    }
    Ok(value)
}
