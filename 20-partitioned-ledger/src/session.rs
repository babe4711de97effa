//! Client-side query layer and the interactive shell built on it.
//!
//! [`BankClient`] keeps one channel to the write node and one to the read
//! replica. Every request is retried once over a fresh, re-authenticated
//! socket; balance queries fall back to the write node when the replica
//! cannot answer. A `DTE` reply means a resent transaction had already been
//! applied, and is surfaced as an empty success.

use anyhow::{Context, Result, bail};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
};
use tracing::{info, warn};

use crate::{
    config::SessionConfig,
    error::TransportError,
    protocol::{
        AccountNumber, ClientRequest, DUPLICATE_REPLY, Identity, LOGIN_OK_SUFFIX, Nonce,
        Registration, UserId,
    },
    transport::Channel,
};

pub struct BankClient {
    config: SessionConfig,
    write: Channel,
    read: Option<Channel>,
    user_id: Option<UserId>,
}

impl BankClient {
    /// Connects to the write node. An unreachable replica is tolerated; reads
    /// go to the write node until it comes back.
    pub async fn connect(config: SessionConfig) -> Result<Self> {
        let write = Channel::connect(&config.write, Identity::Client, config.read_timeout)
            .await
            .with_context(|| format!("failed to connect to write node {}", config.write))?;
        let connecting = Channel::connect(&config.read, Identity::Client, config.read_timeout);
        let read = match connecting.await {
            Ok(channel) => Some(channel),
            Err(err) => {
                warn!(addr = %config.read, error = %err, "read replica unavailable");
                None
            }
        };
        Ok(Self {
            config,
            write,
            read,
            user_id: None,
        })
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    async fn query_write(&mut self, request: &ClientRequest) -> Result<String, TransportError> {
        self.write.query(&request.to_line(), self.user_id).await
    }

    async fn query_read(&mut self, request: &ClientRequest) -> Result<String, TransportError> {
        let line = request.to_line();
        if self.read.is_none() {
            let reconnect =
                Channel::connect(&self.config.read, Identity::Client, self.config.read_timeout);
            match reconnect.await {
                Ok(channel) => self.read = Some(channel),
                Err(err) => warn!(error = %err, "read replica still unavailable"),
            }
        }
        if let Some(read) = self.read.as_mut() {
            match read.query(&line, self.user_id).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    warn!(error = %err, "read replica failed, falling back to write node");
                    if let Some(read) = self.read.take() {
                        read.close().await;
                    }
                }
            }
        }
        self.write.query(&line, self.user_id).await
    }

    /// Logs in, returning the user id on success and the server's message
    /// otherwise.
    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<Result<UserId, String>> {
        let reply = self
            .query_write(&ClientRequest::Login {
                username: username.to_string(),
                password: password.to_string(),
            })
            .await?;
        match reply
            .strip_suffix(LOGIN_OK_SUFFIX)
            .and_then(|id| id.parse::<UserId>().ok())
        {
            Some(user_id) => {
                self.user_id = Some(user_id);
                info!(user_id, "logged in");
                Ok(Ok(user_id))
            }
            None => Ok(Err(reply)),
        }
    }

    pub async fn register(&mut self, registration: Registration) -> Result<String> {
        Ok(self
            .query_write(&ClientRequest::Register(registration))
            .await?)
    }

    pub async fn deposit(&mut self, account: AccountNumber, amount: Decimal) -> Result<String> {
        let nonce = fresh_nonce();
        self.transact(ClientRequest::Deposit {
            account,
            amount,
            nonce,
        })
        .await
    }

    pub async fn withdraw(&mut self, account: AccountNumber, amount: Decimal) -> Result<String> {
        let nonce = fresh_nonce();
        self.transact(ClientRequest::Withdraw {
            account,
            amount,
            nonce,
        })
        .await
    }

    pub async fn transfer(
        &mut self,
        from: AccountNumber,
        to: AccountNumber,
        amount: Decimal,
    ) -> Result<String> {
        let nonce = fresh_nonce();
        self.transact(ClientRequest::Transfer {
            from,
            to,
            amount,
            nonce,
        })
        .await
    }

    /// Sends a transaction. The nonce stays the same across the retry, so a
    /// resend of an applied transaction comes back as an empty reply.
    pub async fn transact(&mut self, request: ClientRequest) -> Result<String> {
        let reply = self.query_write(&request).await?;
        if reply.trim() == DUPLICATE_REPLY {
            info!("transaction was already applied");
            return Ok(String::new());
        }
        Ok(reply)
    }

    pub async fn balance(&mut self, account: AccountNumber) -> Result<String> {
        let Some(user_id) = self.user_id else {
            bail!("log in before checking a balance");
        };
        Ok(self
            .query_read(&ClientRequest::Balance { user_id, account })
            .await?)
    }

    pub async fn close(self) {
        self.write.close().await;
        if let Some(read) = self.read {
            read.close().await;
        }
    }
}

/// Nonces start at 1; zero is reserved on the node side.
fn fresh_nonce() -> Nonce {
    Nonce(rand::thread_rng().gen_range(1..=u64::MAX))
}

/// Runs the interactive shell until `quit`, end of input or Ctrl-C.
pub async fn run(config: SessionConfig) -> Result<()> {
    let mut client = BankClient::connect(config.clone()).await?;
    write_stdout(&format!("*** connected to {}", config.write)).await?;

    let mut stdin = BufReader::new(io::stdin());
    let mut input = String::new();
    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                match run_command(&mut client, input.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => write_stdout(&format!("!!! {err:#}")).await?,
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}

const USAGE: &str = "commands: login <user> <password> | register <user> <password> <first> <last> <email> | \
deposit <account> <amount> | withdraw <account> <amount> | transfer <from> <to> <amount> | \
balance <account> | quit";

/// Executes one shell command. Returns false when the shell should exit.
async fn run_command(client: &mut BankClient, text: &str) -> Result<bool> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let reply = match tokens.as_slice() {
        [] => return Ok(true),
        ["quit"] => {
            write_stdout("*** goodbye").await?;
            return Ok(false);
        }
        ["login", username, password] => match client.login(username, password).await? {
            Ok(user_id) => format!("*** logged in as user {user_id}"),
            Err(message) => message,
        },
        ["register", username, password, first_name, last_name, email] => {
            client
                .register(Registration {
                    username: username.to_string(),
                    password: password.to_string(),
                    first_name: first_name.to_string(),
                    last_name: last_name.to_string(),
                    email: email.to_string(),
                })
                .await?
        }
        ["deposit", account, amount] => {
            client.deposit(parse_account(account)?, parse_amount(amount)?).await?
        }
        ["withdraw", account, amount] => {
            client.withdraw(parse_account(account)?, parse_amount(amount)?).await?
        }
        ["transfer", from, to, amount] => {
            client
                .transfer(parse_account(from)?, parse_account(to)?, parse_amount(amount)?)
                .await?
        }
        ["balance", account] => client.balance(parse_account(account)?).await?,
        _ => USAGE.to_string(),
    };

    if reply.is_empty() {
        write_stdout("*** transaction already applied").await?;
    } else {
        write_stdout(&reply).await?;
    }
    Ok(true)
}

fn parse_account(raw: &str) -> Result<AccountNumber> {
    raw.parse().map_err(anyhow::Error::msg)
}

fn parse_amount(raw: &str) -> Result<Decimal> {
    let amount: Decimal = raw
        .parse()
        .with_context(|| format!("'{raw}' is not an amount"))?;
    if amount <= Decimal::ZERO {
        bail!("amount must be positive");
    }
    Ok(amount)
}

async fn write_stdout(line: &str) -> std::io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
