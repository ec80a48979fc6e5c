use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use jim_messenger::{
    cli::{Cli, ClientArgs, Command, ServerArgs},
    client,
    config::{ClientConfig, ServerConfig},
    observer,
    server::Server,
    store::{MemoryUserStore, Registration},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => run_client(args).await?,
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = ServerConfig::new(&args.addr, args.port)?;
    let store = if args.users.is_empty() {
        Arc::new(MemoryUserStore::new(Registration::Open))
    } else {
        Arc::new(MemoryUserStore::with_users(args.users))
    };

    let listener = TcpListener::bind(config.socket_addr()).await?;
    let server = Server::new(listener, store.clone());
    let addr = server.local_addr()?;

    tokio::spawn(observer::observe(store, server.subscribe()));

    info!("server listening on {}", addr);
    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let config = ClientConfig::new(&args.addr, args.port, args.name.as_deref())?;
    client::run(config).await
}
