use std::str::FromStr;

use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_CLIENT_HOST, ListenPort};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the messaging server.
    Server(ServerArgs),
    /// Connect to a server as one user.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to listen on. Empty means every interface.
    #[arg(short, long, env = "JIM_ADDR", default_value = "")]
    pub addr: String,

    /// TCP port, 1024-65535.
    #[arg(short, long, env = "JIM_PORT", default_value_t, value_parser = ListenPort::from_str)]
    pub port: ListenPort,

    /// Only accept these users. Repeatable; without it anyone may join.
    #[arg(short, long = "user", value_name = "NAME")]
    pub users: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server address.
    #[arg(short, long, env = "JIM_ADDR", default_value = DEFAULT_CLIENT_HOST)]
    pub addr: String,

    /// Server TCP port.
    #[arg(short, long, env = "JIM_PORT", default_value_t, value_parser = ListenPort::from_str)]
    pub port: ListenPort,

    /// Display name. Prompted for when absent.
    #[arg(short, long, env = "JIM_NAME")]
    pub name: Option<String>,
}
