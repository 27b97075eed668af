//! Roomlink CLI - Terminal chat over a signal server
//!
//! Usage:
//!   roomlink create                   Create a room and chat in it
//!                                     (/send <path> shares a file directly)
//!   roomlink join <code>              Join a room by code
//!   roomlink signal                   Run a signal server
//!   roomlink config                   Print a sample config file

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use roomlink_core::{ClientConfig, Config, FileRecord};
use roomlink_peer::{save_file, RoomSession, SessionEvent, SignalClient, WebRtcFactory};
use roomlink_signal::{BlobLimits, MemoryBlobStore, ServerMessage, SignalServer, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "roomlink")]
#[command(about = "Ephemeral rooms with chat and shared files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Signal server URL (overrides the config file)
    #[arg(short, long, global = true)]
    signal: Option<String>,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a room and chat in it
    Create,

    /// Join a room by code
    Join {
        /// Room code (e.g., k7m2qp)
        code: String,
    },

    /// Run a signal server with an in-memory blob store
    Signal {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Bind address
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,
    },

    /// Print a sample config file
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let signal_url = cli
        .signal
        .clone()
        .unwrap_or_else(|| config.client.signal_url.clone());

    match cli.command {
        Commands::Create => run_chat(&signal_url, config.client, None).await?,
        Commands::Join { code } => run_chat(&signal_url, config.client, Some(code)).await?,
        Commands::Signal { port, bind } => run_signal(config, port, bind).await?,
        Commands::Config => print!("{}", Config::sample()),
    }

    Ok(())
}

async fn run_chat(
    signal_url: &str,
    config: ClientConfig,
    code: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = SignalClient::connect(signal_url).await?;
    let factory = Arc::new(WebRtcFactory::new(client.peer_id(), config.ice_servers.clone()));
    let download_dir = config.download_dir.clone();
    let mut session = RoomSession::new(client, factory, config);

    let room_id = match code {
        Some(code) => session.join_room(&code).await?,
        None => session.create_room().await?,
    };

    info!("");
    info!("  Room code: {}", room_id);
    info!("  You are: {}", session.peer_id());
    info!("");
    info!("  Type a message and press enter.");
    info!("  /send <path> sends a file to connected peers. /quit to leave.");
    info!("");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" {
                    break;
                }
                match text.strip_prefix("/send ") {
                    Some(path) => send_path(&session, Path::new(path.trim())).await,
                    None => session.send_message(text)?,
                }
            }
            event = session.next_event() => {
                match event {
                    Some(event) => handle_event(event, &download_dir).await,
                    None => {
                        error!("Lost connection to signal server");
                        break;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    session.leave();
    Ok(())
}

async fn send_path(session: &RoomSession, path: &Path) {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_string(),
        None => {
            println!("! not a file: {}", path.display());
            return;
        }
    };
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            println!("! cannot read {}: {}", path.display(), e);
            return;
        }
    };

    let results = session.send_file(&name, None, &data).await;
    if results.is_empty() {
        println!("! no connected peers");
    }
    for (peer_id, result) in results {
        match result {
            Ok(_) => println!("* sent {} to {}", name, peer_id),
            Err(e) => println!("! {} to {} failed: {}", name, peer_id, e),
        }
    }
}

async fn handle_event(event: SessionEvent, download_dir: &Path) {
    match event {
        SessionEvent::Server(msg) => print_event(&msg),
        SessionEvent::PeerConnected(peer_id) => println!("* direct link to {}", peer_id),
        SessionEvent::PeerDisconnected(peer_id) => println!("* direct link to {} closed", peer_id),
        SessionEvent::FileReceived { from, file } => match save_file(download_dir, &file).await {
            Ok(path) => println!("* {} sent {}", from, path.display()),
            Err(e) => warn!("Could not save {} from {}: {}", file.descriptor.name, from, e),
        },
    }
}

fn print_event(event: &ServerMessage) {
    match event {
        ServerMessage::ReceiveMessage(m) => println!("[{}] {}", m.sender_id, m.text),
        ServerMessage::MessageHistory { messages } => {
            println!("-- {} earlier messages --", messages.len());
            for m in messages {
                println!("[{}] {}", m.sender_id, m.text);
            }
        }
        ServerMessage::FileHistory { files } => {
            for f in files {
                let note = if f.is_expired { " (expired)" } else { "" };
                print_file(&f.record, note);
            }
        }
        ServerMessage::NewFileRecord(record) => print_file(record, ""),
        ServerMessage::FileRemoved { file_name, reason, .. } => match reason {
            Some(_) => println!("* file {} expired", file_name),
            None => println!("* file {} removed", file_name),
        },
        ServerMessage::NewPeer { peer_id } => println!("* {} is here", peer_id),
        ServerMessage::PeerDisconnect { peer_id } => println!("* {} left", peer_id),
        ServerMessage::Error { code, message } => println!("! {}: {}", code, message),
        _ => {}
    }
}

fn print_file(record: &FileRecord, note: &str) {
    println!(
        "* file {} ({} bytes) at {}{}",
        record.name, record.size, record.retrieval_handle, note
    );
}

async fn run_signal(config: Config, port: u16, bind: String) -> Result<(), Box<dyn std::error::Error>> {
    let bind_addr: SocketAddr = format!("{}:{}", bind, port).parse()?;

    info!("Starting Roomlink signal server...");
    info!("  Listening on: ws://{}", bind_addr);

    let signal_config = config.signal;
    let blobs = Arc::new(MemoryBlobStore::new(BlobLimits {
        max_bytes: signal_config.max_upload_bytes,
        expiry_ms: signal_config.file_expiry_ms(),
    }));
    let server = SignalServer::new(signal_config, blobs);

    // Handle Ctrl+C
    tokio::select! {
        result = server.serve(bind_addr) => {
            if let Err(e) = result {
                error!("Signal server error: {:?}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
