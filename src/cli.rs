//! CLI surface: one binary, `serve` and `run` subcommands.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use crate::client::{Client, ClientParams, RunResult};
use crate::config;
use crate::sequence::RandomSequenceSource;
use crate::server::{Server, ServerConfig};
use crate::session::{InMemoryStore, InMemoryStoreParams, SharedSessionStore};
use crate::telemetry;

#[derive(Parser, Debug)]
#[command(
    name = "seqstream",
    version,
    about = "Resumable number-sequence streaming over WebSocket"
)]
pub struct Cli {
    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sequence server.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },

    /// Run a one-off client session against a server.
    Run {
        /// Host on which the server is reachable.
        #[arg(long, default_value = "localhost")]
        server_host: String,

        /// Port the server listens on.
        #[arg(long, default_value_t = 3000)]
        server_port: u16,

        /// Sequence length to request; the server picks one at random
        /// when omitted.
        #[arg(long)]
        sequence_count: Option<u32>,
    },
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> crate::Result<()> {
    match cli.command {
        Commands::Serve { port } => serve(cli.verbose, port),
        Commands::Run {
            server_host,
            server_port,
            sequence_count,
        } => run_client(cli.verbose, server_host, server_port, sequence_count),
    }
}

fn serve(verbose: u8, port: u16) -> crate::Result<()> {
    let config = config::load();
    telemetry::init(verbose, &config.log_level);

    let store = SharedSessionStore::new(InMemoryStore::new(InMemoryStoreParams {
        expire_after_idle_secs: config.session_state_idle_time_expiry_secs,
    }));
    let server = Server::new(
        store,
        ServerConfig {
            listen_addr: format!("0.0.0.0:{port}"),
            sequence_message_interval: Duration::from_millis(config.sequence_message_interval_ms),
        },
        Arc::new(RandomSequenceSource),
    );

    let handle = server.start().map_err(crate::Error::from)?;
    tracing::info!("server listening on {}", handle.local_addr());
    handle.wait();
    Ok(())
}

fn run_client(
    verbose: u8,
    server_host: String,
    server_port: u16,
    sequence_count: Option<u32>,
) -> crate::Result<()> {
    let config = config::load_for_client();
    telemetry::init(verbose, &config.log_level);

    let mut client = Client::new(ClientParams {
        server_host,
        server_port,
        sequence_count,
        send_last_received_index: config.send_last_received_index,
        max_reconnect_attempts: config.max_reconnect_attempts,
        ..ClientParams::default()
    });
    client.connect().map_err(crate::Error::from)?;

    let result = client.result();
    print_result(&result);
    client.shutdown();
    Ok(())
}

fn print_result(result: &RunResult) {
    println!("Result");
    println!("____________");
    println!();
    println!("Client-side checksum: {}", result.checksum);
    println!(
        "Server-provided checksum: {}",
        result.server_checksum.as_deref().unwrap_or("<none>")
    );
    println!("Successful: {}", result.success);
    if let Some(error) = &result.error {
        println!("Error: {error}");
    }
}
