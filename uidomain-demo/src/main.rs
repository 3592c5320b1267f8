//! Demo binary exercising `uidomain-endpoint` end to end: a server mode that
//! runs a tiny service (echo, fd push, channel push) and a client mode that
//! drives it over the real wire protocol.

mod client;
mod service;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Exercises a Unix-domain-socket endpoint service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the demo service, blocking until cancelled.
    Server {
        #[arg(long, default_value = "/tmp/uidomain-demo.sock")]
        socket: PathBuf,
    },
    /// Connect to a running demo service and exercise its opcodes once.
    Client {
        #[arg(long, default_value = "/tmp/uidomain-demo.sock")]
        socket: PathBuf,
        #[arg(long, default_value = "hello from uidomain-demo")]
        message: String,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Server { socket } => service::run(&socket),
        Command::Client { socket, message } => client::run(&socket, &message),
    }
}
