use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use partitioned_ledger::{
    cli::{Cli, Command},
    config::{NodeConfig, SessionConfig},
    dispatcher::Node,
    session,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => {
            let config = NodeConfig::from(&args);
            let listener = TcpListener::bind(&args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let node = Node::open(listener, config).await?;
            let addr = node.local_addr()?;
            info!("node listening on {}", addr);
            if let Err(err) = node.run_until_ctrl_c().await {
                warn!("node exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => session::run(SessionConfig::from(&args)).await?,
    }

    Ok(())
}
