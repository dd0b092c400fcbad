//! Tandem CLI - pair on a workspace over a direct peer connection
//!
//! Usage:
//!   tandem join                       Wait for a host to connect
//!   tandem host <path> --peer <id>    Share a directory with a joined peer
//!   tandem relay                      Run the signaling relay
//!
//! While a session runs, stdin accepts:
//!   open <path>   request a file from the host
//!   peers         list connected peers
//!   undo          roll back the last edit applied to the workspace
//!   quit          disconnect

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tandem_core::Config;
use tandem_session::{
    generate_session_id, open_workspace, EditorEvent, FsEditor, Role, Session, SessionHandle,
    SessionOptions, SessionStatus, WebRtcConnector,
};
use tandem_signal::{RelayServer, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Peer-to-peer pair editing", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a host to offer a session
    Join {
        /// Relay URL
        #[arg(short, long, env = "TANDEM_RELAY")]
        relay: Option<String>,

        /// Name shown to the peer
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Share a directory with a peer
    Host {
        /// Directory to share
        path: PathBuf,

        /// Session id printed by `tandem join`
        #[arg(short, long)]
        peer: String,

        /// Relay URL
        #[arg(short, long, env = "TANDEM_RELAY")]
        relay: Option<String>,

        /// Name shown to the peer
        #[arg(short, long)]
        username: Option<String>,
    },

    /// Run the signaling relay
    Relay {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Bind address
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,
    },

    /// Print a sample configuration file
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Join { relay, username } => {
            let config = with_relay(config, relay);
            run_session(config, Role::Responder, None, None, username).await?;
        }
        Commands::Host {
            path,
            peer,
            relay,
            username,
        } => {
            let config = with_relay(config, relay);
            run_session(config, Role::Initiator, Some(path), Some(peer), username).await?;
        }
        Commands::Relay { port, bind } => {
            run_relay(port, bind).await?;
        }
        Commands::Config => {
            print!("{}", Config::sample());
        }
    }

    Ok(())
}

fn with_relay(mut config: Config, relay: Option<String>) -> Config {
    if let Some(url) = relay {
        config.relay.url = url;
    }
    config
}

async fn run_session(
    config: Config,
    role: Role,
    path: Option<PathBuf>,
    peer: Option<String>,
    username: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let local_id = generate_session_id()?;

    let workspace = match path.or_else(|| config.workspace.root.clone()) {
        Some(root) if role == Role::Initiator => {
            if !root.is_dir() {
                error!("Path must be a directory: {:?}", root);
                return Err("Not a directory".into());
            }
            Some(open_workspace(&root, &config)?)
        }
        _ => None,
    };

    let (editor_tx, mut editor_rx) = mpsc::unbounded_channel();
    let editor = FsEditor::new(workspace.clone(), config.scratch_dir(&local_id)).with_events(editor_tx);
    let connector = Arc::new(WebRtcConnector::new(config.ice.stun_servers.clone()));

    let handle = Session::start(
        config,
        role,
        SessionOptions {
            peer,
            workspace,
            local_id: Some(local_id.clone()),
            username,
        },
        connector,
        Box::new(editor),
    )?;

    if role == Role::Responder {
        info!("");
        info!("  Session id: {}", local_id);
        info!("");
        info!("  Run on the host:");
        info!("    tandem host <path> --peer {}", local_id);
        info!("");
    }

    let mut status = handle.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!("Session {:?}", current);
                if current.is_closed() {
                    break;
                }
            }
            Some(event) = editor_rx.recv() => print_event(&event),
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&handle, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin: {}", e);
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    if !handle.status().is_closed() {
        handle.disconnect().await?;
    } else if let Err(e) = handle.join().await {
        error!("Session ended: {}", e);
    }
    Ok(())
}

/// Returns false when the session should end
async fn run_command(handle: &SessionHandle, line: &str) -> bool {
    let (cmd, arg) = match line.split_once(' ') {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };

    match cmd {
        "" => {}
        "open" if !arg.is_empty() => {
            if let Err(e) = handle.request_file(arg) {
                warn!("open {}: {}", arg, e);
            }
        }
        "peers" => {
            let peers = handle.peers();
            if peers.is_empty() {
                info!("No peers");
            }
            for peer in peers {
                info!("  {} {} ({})", peer.id, peer.username, peer.status);
            }
        }
        "files" => {
            for record in handle.mirror().files() {
                info!("  {} {} bytes", record.full_path, record.size);
            }
        }
        "undo" => match handle.rollback().await {
            Ok(path) => info!("Restored {}", path),
            Err(e) => warn!("undo: {}", e),
        },
        "quit" => return false,
        _ => warn!("Commands: open <path>, peers, files, undo, quit"),
    }

    !matches!(handle.status(), SessionStatus::Closed(_))
}

fn print_event(event: &EditorEvent) {
    match event {
        EditorEvent::Opened { path, local_copy } => info!("Opened {} -> {:?}", path, local_copy),
        EditorEvent::Edited { path, .. } => info!("Peer edited {}", path),
        EditorEvent::Selection { path, range } => info!(
            "Peer selection {}:{}:{}",
            path, range.start.line, range.start.character
        ),
        EditorEvent::WorkspaceChanged { files } => info!("Workspace updated ({} files)", files),
    }
}

async fn run_relay(port: u16, bind: String) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    let server = RelayServer::new();

    info!("Starting tandem relay on {}", addr);

    tokio::select! {
        result = server.serve(addr) => {
            if let Err(e) = result {
                error!("Relay error: {:?}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
