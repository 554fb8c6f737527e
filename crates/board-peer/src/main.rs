//! board-peer: collaborate on a shared board from the terminal.
//!
//! `board-peer relay` runs the rendezvous relay. `board-peer peer` opens or
//! joins a board, links directly to the other collaborators, and reads
//! commands from stdin.

use anyhow::{Context, Result};
use board_core::{BoardId, CollaboratorId, SessionConfig};
use board_peer::command::{self, Command};
use board_peer::{BoardTarget, PeerHost, PeerOptions, Relay};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "board-peer")]
#[command(about = "Peer-to-peer shared board")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the rendezvous relay
    Relay {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        listen: String,
    },
    /// Open or join a board
    Peer(PeerArgs),
}

#[derive(Args, Debug)]
struct PeerArgs {
    /// Relay URL, e.g. ws://127.0.0.1:9000
    #[arg(short, long)]
    signaling: String,

    /// Address to accept peer links on
    #[arg(short, long, default_value = "0.0.0.0:0")]
    listen: String,

    /// URL other peers should dial (defaults to ws://<listen address>)
    #[arg(long)]
    advertise: Option<String>,

    /// Display name
    #[arg(short, long)]
    name: String,

    /// Create a new board with this name
    #[arg(long, conflicts_with = "join", required_unless_present = "join")]
    create: Option<String>,

    /// Join an existing board by id
    #[arg(long)]
    join: Option<BoardId>,

    /// Directory for saved boards and the peer id
    #[arg(long, default_value = ".board-peer")]
    data_dir: PathBuf,

    /// YAML session config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Collaborator ID (remembered in the data dir if not provided)
    #[arg(long)]
    peer_id: Option<CollaboratorId>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,board_peer=debug"
    } else {
        "info,board_peer=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Mode::Relay { listen } => {
            let relay = Relay::bind(&listen).await?;
            tokio::select! {
                result = relay.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    Ok(())
                }
            }
        }
        Mode::Peer(args) => run_peer(args).await,
    }
}

async fn run_peer(args: PeerArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {path:?}"))?;
            SessionConfig::from_yaml_str(&yaml)?
        }
        None => SessionConfig::default(),
    };

    let target = match (args.create, args.join) {
        (Some(name), _) => BoardTarget::Create {
            name,
            description: None,
        },
        (None, Some(board_id)) => BoardTarget::Join(board_id),
        (None, None) => anyhow::bail!("Pass --create NAME or --join ID"),
    };

    let mut host = PeerHost::start(PeerOptions {
        signaling_url: args.signaling,
        listen: args.listen,
        advertise: args.advertise,
        display_name: args.name,
        target,
        data_dir: args.data_dir,
        config,
        peer_id: args.peer_id,
    })
    .await?;

    let _events = host.session().subscribe(|event| {
        if let Some(line) = command::describe_event(&event) {
            println!("* {line}");
        }
    });

    if let Some(board) = host.board() {
        println!("Board {} ({})", board.id, board.name);
    }
    println!("You are {}. Type `help` for commands.", host.local_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = host.step() => {}

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Command::parse(&line) {
                        Ok(cmd) => match command::execute(host.session_mut(), cmd) {
                            Ok(Some(out)) => println!("{out}"),
                            Ok(None) => {}
                            Err(e) => println!("Error: {e:#}"),
                        },
                        Err(e) => println!("{e}"),
                    }
                    host.flush();
                }
                Ok(None) => {
                    info!("stdin closed, running until interrupted");
                    stdin_open = false;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }

        if !host.session().is_active() {
            break;
        }
    }

    host.shutdown().await;
    println!("Bye");
    Ok(())
}
