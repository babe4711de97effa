use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use partitioned_ledger::{
    config::{NodeConfig, Role, SessionConfig},
    dispatcher::Node,
    handlers::Services,
    protocol::{AccountNumber, ClientRequest, Nonce, Registration},
    session::BankClient,
    store::{LedgerStore, MemoryLedger},
    transport::{read_line, write_line},
};
use rust_decimal_macros::dec;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(3);

struct RunningNode {
    addr: SocketAddr,
    services: Arc<Services>,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl RunningNode {
    async fn start(config: NodeConfig) -> Result<Self> {
        Self::start_with(config, Arc::new(MemoryLedger::new())).await
    }

    async fn start_with(mut config: NodeConfig, ledger: Arc<MemoryLedger>) -> Result<Self> {
        config.peer_timeout = Duration::from_secs(1);
        config.lock_wait = Duration::from_secs(1);
        config.shutdown_grace = Duration::from_millis(200);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let node = Node::with_ledger(listener, config, ledger);
        let addr = node.local_addr()?;
        let services = node.services();
        let (shutdown, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(node.run_until(async move {
            let _ = rx.await;
        }));
        Ok(Self {
            addr,
            services,
            shutdown,
            handle,
        })
    }

    fn store(&self) -> &dyn LedgerStore {
        self.services.store().as_ref()
    }

    async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        timeout(WAIT, self.handle).await??
    }
}

struct Cluster {
    write: RunningNode,
    coordinator: RunningNode,
    replica: Option<RunningNode>,
    replica_addr: String,
}

impl Cluster {
    async fn start() -> Result<Self> {
        Self::start_with(Arc::new(MemoryLedger::new()), true).await
    }

    async fn start_with(ledger: Arc<MemoryLedger>, with_replica: bool) -> Result<Self> {
        let coordinator = RunningNode::start(NodeConfig::new(Role::Coordinator)).await?;
        let (replica, replica_addr) = if with_replica {
            let replica = RunningNode::start(NodeConfig::new(Role::Replica)).await?;
            let addr = replica.addr.to_string();
            (Some(replica), addr)
        } else {
            (None, unused_addr().await?)
        };

        let mut config = NodeConfig::new(Role::Write);
        config.coordinator = Some(coordinator.addr.to_string());
        config.replica = Some(replica_addr.clone());
        let write = RunningNode::start_with(config, ledger).await?;

        Ok(Self {
            write,
            coordinator,
            replica,
            replica_addr,
        })
    }

    fn replica(&self) -> &RunningNode {
        self.replica.as_ref().expect("cluster runs a replica")
    }

    async fn client(&self) -> Result<BankClient> {
        let mut config = SessionConfig::new(self.write.addr.to_string(), self.replica_addr.clone());
        config.read_timeout = Duration::from_secs(2);
        BankClient::connect(config).await
    }

    async fn stop(self) -> Result<()> {
        self.write.stop().await?;
        self.coordinator.stop().await?;
        if let Some(replica) = self.replica {
            replica.stop().await?;
        }
        Ok(())
    }
}

/// Relays client connections to `upstream`, swallowing the reply to the
/// first withdraw it sees and hanging up on that client.
async fn lossy_proxy(upstream: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let dropped = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(async move {
        while let Ok((client, _)) = listener.accept().await {
            let dropped = Arc::clone(&dropped);
            tokio::spawn(async move {
                let _ = relay(client, upstream, dropped).await;
            });
        }
    });
    Ok((addr, handle))
}

async fn relay(client: TcpStream, upstream: SocketAddr, dropped: Arc<AtomicBool>) -> Result<()> {
    let server = TcpStream::connect(upstream).await?;
    let (client_reader, mut client_writer) = client.into_split();
    let (server_reader, mut server_writer) = server.into_split();
    let mut client_reader = BufReader::new(client_reader);
    let mut server_reader = BufReader::new(server_reader);

    // The identity frame gets no reply.
    let identity = read_line(&mut client_reader).await?.context("no identity")?;
    write_line(&mut server_writer, &identity).await?;

    while let Some(line) = read_line(&mut client_reader).await? {
        write_line(&mut server_writer, &line).await?;
        let reply = read_line(&mut server_reader).await?.context("upstream closed")?;
        if line.starts_with("W ") && !dropped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        write_line(&mut client_writer, &reply).await?;
    }
    Ok(())
}

async fn unused_addr() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.to_string())
}

fn registration(username: &str) -> Registration {
    Registration {
        username: username.to_string(),
        password: "secret".to_string(),
        first_name: "First".to_string(),
        last_name: "Last".to_string(),
        email: format!("{username}@example.com"),
    }
}

/// Registers and logs in `username`, returning the new account number.
async fn open_account(client: &mut BankClient, username: &str) -> Result<AccountNumber> {
    let reply = client.register(registration(username)).await?;
    let account = reply
        .strip_prefix("You have successfully registered your account! Your account number is: ")
        .ok_or_else(|| anyhow!("unexpected registration reply: {reply}"))?;
    client
        .login(username, "secret")
        .await?
        .map_err(|message| anyhow!("login failed: {message}"))?;
    account.parse().map_err(anyhow::Error::msg)
}

#[tokio::test]
async fn replayed_withdraw_is_applied_once_everywhere() -> Result<()> {
    let cluster = Cluster::start().await?;
    let mut client = cluster.client().await?;
    let account = open_account(&mut client, "alice").await?;
    let user = client.user_id().context("logged in")?;

    client.deposit(account.clone(), dec!(500.00)).await?;
    let withdraw = ClientRequest::Withdraw {
        account: account.clone(),
        amount: dec!(100.00),
        nonce: Nonce(42),
    };
    let first = client.transact(withdraw.clone()).await?;
    assert_eq!(
        first,
        "Your balance before withdraw was: 500.00. Your balance after withdraw is: 400.00."
    );
    let replay = client.transact(withdraw).await?;
    assert_eq!(replay, "");

    assert_eq!(cluster.write.store().get_balance(&account, user), Ok(dec!(400.00)));
    assert_eq!(cluster.coordinator.store().get_balance(&account, user), Ok(dec!(400.00)));
    assert_eq!(cluster.replica().store().get_balance(&account, user), Ok(dec!(400.00)));
    assert_eq!(
        cluster.coordinator.services.locks().recorded(&account, Nonce(42)).as_deref(),
        Some("400.00")
    );
    assert_eq!(
        client.balance(account.clone()).await?,
        "Your balance is: 400.00."
    );

    client.close().await;
    cluster.stop().await
}

#[tokio::test]
async fn transfer_to_missing_account_leaves_source_untouched() -> Result<()> {
    let cluster = Cluster::start().await?;
    let mut client = cluster.client().await?;
    let account = open_account(&mut client, "alice").await?;
    let user = client.user_id().context("logged in")?;
    client.deposit(account.clone(), dec!(500)).await?;

    let reply = client
        .transfer(account.clone(), "9999999999".parse().map_err(anyhow::Error::msg)?, dec!(50))
        .await?;
    assert_eq!(reply, "The account number you wanted to transfer was invalid!");
    for node in [&cluster.write, &cluster.coordinator, cluster.replica()] {
        assert_eq!(node.store().get_balance(&account, user), Ok(dec!(500)));
    }
    assert!(!cluster.write.services.locks().is_locked(&account));
    assert!(!cluster.coordinator.services.locks().is_locked(&account));

    client.close().await;
    cluster.stop().await
}

#[tokio::test]
async fn transfer_between_users_reaches_every_node() -> Result<()> {
    let cluster = Cluster::start().await?;
    let mut bob = cluster.client().await?;
    let bobs = open_account(&mut bob, "bob").await?;
    let bob_id = bob.user_id().context("bob logged in")?;

    let mut alice = cluster.client().await?;
    let alices = open_account(&mut alice, "alice").await?;
    let alice_id = alice.user_id().context("alice logged in")?;
    alice.deposit(alices.clone(), dec!(80)).await?;

    let reply = alice.transfer(alices.clone(), bobs.clone(), dec!(30)).await?;
    assert_eq!(reply, "Your balance after transfer: 50.00.");
    for node in [&cluster.write, &cluster.coordinator, cluster.replica()] {
        assert_eq!(node.store().get_balance(&alices, alice_id), Ok(dec!(50)));
        assert_eq!(node.store().get_balance(&bobs, bob_id), Ok(dec!(30)));
    }

    alice.close().await;
    bob.close().await;
    cluster.stop().await
}

#[tokio::test]
async fn registration_is_mirrored_with_the_same_ids() -> Result<()> {
    let cluster = Cluster::start().await?;
    let mut client = cluster.client().await?;
    let account = open_account(&mut client, "carol").await?;
    let user = client.user_id().context("logged in")?;

    for node in [&cluster.coordinator, cluster.replica()] {
        assert_eq!(node.store().login("carol", "secret"), Some(user));
        assert_eq!(node.store().get_balance(&account, user), Ok(dec!(0)));
    }

    let duplicate = client.register(registration("carol")).await?;
    assert_eq!(duplicate, "Your registration failed!");

    client.close().await;
    cluster.stop().await
}

#[tokio::test]
async fn balance_reads_fall_back_when_replica_is_down() -> Result<()> {
    let cluster = Cluster::start_with(Arc::new(MemoryLedger::new()), false).await?;
    let mut client = cluster.client().await?;
    let account = open_account(&mut client, "dave").await?;
    client.deposit(account.clone(), dec!(12.34)).await?;

    assert_eq!(client.balance(account).await?, "Your balance is: 12.34.");

    client.close().await;
    cluster.stop().await
}

#[tokio::test]
async fn diverged_coordinator_is_resynchronized() -> Result<()> {
    let cluster = Cluster::start().await?;
    let mut client = cluster.client().await?;
    let account = open_account(&mut client, "erin").await?;
    let user = client.user_id().context("logged in")?;
    client.deposit(account.clone(), dec!(500)).await?;

    cluster
        .coordinator
        .store()
        .overwrite_balance(&account, dec!(1000))
        .map_err(anyhow::Error::from)?;
    let reply = client.withdraw(account.clone(), dec!(100)).await?;
    assert_eq!(
        reply,
        "Your balance before withdraw was: 500.00. Your balance after withdraw is: 400.00."
    );

    // The dump is pushed without a reply, so give the coordinator a moment.
    timeout(WAIT, async {
        while cluster.coordinator.store().get_balance(&account, user) != Ok(dec!(400)) {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("coordinator never caught up")?;

    client.close().await;
    cluster.stop().await
}

#[tokio::test]
async fn write_node_pushes_full_dump_on_startup() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let user = ledger.register(&registration("frank"))?;
    let account = ledger.create_account(user)?;
    ledger.overwrite_balance(&account, dec!(42))?;

    let cluster = Cluster::start_with(ledger, true).await?;
    timeout(WAIT, async {
        while cluster.replica().store().get_balance(&account, user) != Ok(dec!(42))
            || cluster.coordinator.store().get_balance(&account, user) != Ok(dec!(42))
        {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("peers never received the dump")?;

    cluster.stop().await
}

#[tokio::test]
async fn idle_peer_connection_releases_its_locks() -> Result<()> {
    let mut config = NodeConfig::new(Role::Coordinator);
    config.client_timeout = Some(Duration::from_millis(200));
    let coordinator = RunningNode::start(config).await?;
    let account: AccountNumber = "1111111111".parse().map_err(anyhow::Error::msg)?;

    let stream = TcpStream::connect(coordinator.addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    write_line(&mut writer, "server").await?;
    write_line(&mut writer, &format!("L {account} W 7")).await?;
    let granted = timeout(WAIT, read_line(&mut reader)).await??;
    assert_eq!(granted.as_deref(), Some("true"));
    assert!(coordinator.services.locks().is_locked(&account));

    // The peer goes quiet while holding the lock.
    let closed = timeout(WAIT, read_line(&mut reader)).await??;
    assert_eq!(closed, None);
    assert!(!coordinator.services.locks().is_locked(&account));
    assert_eq!(coordinator.services.locks().recorded(&account, Nonce(7)), None);

    drop(writer);
    coordinator.stop().await
}

#[tokio::test]
async fn withdraw_resent_after_lost_reply_is_applied_once() -> Result<()> {
    let cluster = Cluster::start().await?;
    let (proxy, relay) = lossy_proxy(cluster.write.addr).await?;
    let mut config = SessionConfig::new(proxy.to_string(), cluster.replica_addr.clone());
    config.read_timeout = Duration::from_secs(2);
    let mut client = BankClient::connect(config).await?;
    let account = open_account(&mut client, "grace").await?;
    let user = client.user_id().context("logged in")?;
    client.deposit(account.clone(), dec!(500)).await?;

    // The first reply is lost and the connection dropped; the client
    // reconnects, re-authenticates and resends the same nonce.
    let reply = client.withdraw(account.clone(), dec!(100)).await?;
    assert_eq!(reply, "");

    for node in [&cluster.write, &cluster.coordinator, cluster.replica()] {
        assert_eq!(node.store().get_balance(&account, user), Ok(dec!(400)));
    }
    assert_eq!(
        client.balance(account.clone()).await?,
        "Your balance is: 400.00."
    );

    client.close().await;
    relay.abort();
    cluster.stop().await
}
