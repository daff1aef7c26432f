//! sockbus CLI - talk to named Unix socket endpoints from a terminal.
//!
//! `sockbus server <name>` serves an endpoint, `sockbus client <name>`
//! connects to one. Each stdin line is sent as raw bytes (newline included);
//! a line containing only `q` exits.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sockbus::{ClientEvent, IpcClient, IpcConfig, IpcError, IpcServer, ServerEvent};

#[derive(Parser)]
#[command(name = "sockbus")]
#[command(version)]
#[command(about = "Named Unix domain socket server and client")]
struct Cli {
    /// JSON config file (env overrides still apply)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve an endpoint and broadcast stdin lines to every client
    Server {
        /// Endpoint name
        name: String,
    },
    /// Connect to an endpoint and send stdin lines to it
    Client {
        /// Endpoint name
        name: String,
        /// Reconnect interval in milliseconds
        #[arg(long)]
        reconnect_ms: Option<u64>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<IpcConfig> {
    let Some(path) = path else {
        return Ok(IpcConfig::from_env());
    };
    let mut config = IpcConfig::load(path)?;
    config.apply_env_overrides();
    Ok(config)
}

/// Yields stdin lines until EOF or a lone `q`.
fn input_lines() -> impl Iterator<Item = String> {
    std::io::stdin()
        .lock()
        .lines()
        .map_while(std::result::Result::ok)
        .take_while(|line| line.trim() != "q")
}

fn run_server(config: IpcConfig, name: &str) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let server = IpcServer::new(config, tx);
    server
        .start(name)
        .with_context(|| format!("Failed to start server '{name}'"))?;
    if let Some(path) = server.socket_path() {
        println!("Listening on {} (q to quit)", path.display());
    }

    std::thread::spawn(move || {
        for event in rx {
            match event {
                ServerEvent::ClientConnected(id) => println!("[{id}] connected"),
                ServerEvent::ClientDisconnected(id) => println!("[{id}] disconnected"),
                ServerEvent::DataReceived { id, data } => {
                    println!("[{id}] {}", String::from_utf8_lossy(&data).trim_end());
                }
                ServerEvent::LoopFailed(reason) => eprintln!("server loop failed: {reason}"),
            }
        }
    });

    for line in input_lines() {
        let payload = format!("{line}\n");
        for id in server.connections() {
            if let Err(e) = server.send(id, payload.as_bytes()) {
                eprintln!("[{id}] send failed: {e}");
            }
        }
    }

    server.stop().context("Failed to stop server")?;
    Ok(())
}

fn run_client(mut config: IpcConfig, name: &str, reconnect_ms: Option<u64>) -> Result<()> {
    if let Some(ms) = reconnect_ms {
        config = config.with_reconnect_timeout(Duration::from_millis(ms));
    }

    let (tx, rx) = mpsc::channel();
    let client = IpcClient::new(config, tx);
    client
        .start(name)
        .with_context(|| format!("Failed to start client for '{name}'"))?;
    println!("Connecting to '{name}' (q to quit)");

    std::thread::spawn(move || {
        for event in rx {
            match event {
                ClientEvent::ReadyChanged(true) => println!("connected"),
                ClientEvent::ReadyChanged(false) => println!("disconnected"),
                ClientEvent::DataReceived(data) => {
                    println!("{}", String::from_utf8_lossy(&data).trim_end());
                }
                ClientEvent::LoopFailed(reason) => eprintln!("client loop failed: {reason}"),
            }
        }
    });

    for line in input_lines() {
        match client.send(format!("{line}\n").as_bytes()) {
            Ok(_) => {}
            Err(IpcError::NotConnected) => eprintln!("not connected; line dropped"),
            Err(e) => eprintln!("send failed: {e}"),
        }
    }

    client.stop().context("Failed to stop client")?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Server { name } => run_server(config, &name),
        Commands::Client { name, reconnect_ms } => run_client(config, &name, reconnect_ms),
    }
}
