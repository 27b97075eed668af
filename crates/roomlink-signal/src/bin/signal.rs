//! Roomlink Signal Server
//!
//! WebSocket signaling server for rooms, chat history, and peer negotiation.
//!
//! # Usage
//!
//! ```bash
//! # In-memory blob store (default)
//! roomlink-signal --port 3000
//!
//! # Blobs on disk
//! roomlink-signal --port 3000 --blob-dir /var/lib/roomlink/blobs
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use roomlink_core::Config;
use roomlink_signal::{BlobLimits, BlobStore, DiskBlobStore, MemoryBlobStore, SignalServer};

#[derive(Parser, Debug)]
#[command(name = "roomlink-signal")]
#[command(about = "Roomlink signaling server for rooms and peer negotiation")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for uploaded blobs (in-memory if not specified)
    #[arg(long)]
    blob_dir: Option<PathBuf>,

    /// Print a sample config file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    if args.print_config {
        print!("{}", Config::sample());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let mut signal = config.signal;

    if let Some(port) = args.port {
        signal.port = port;
    }
    if let Some(bind) = &args.bind {
        signal.bind = bind.parse()?;
    }
    if args.blob_dir.is_some() {
        signal.blob_dir = args.blob_dir.clone();
    }

    let addr = SocketAddr::new(signal.bind, signal.port);

    info!("Starting Roomlink Signal Server");
    info!("Listening on {}", addr);

    let limits = BlobLimits {
        max_bytes: signal.max_upload_bytes,
        expiry_ms: signal.file_expiry_ms(),
    };

    let blobs: Arc<dyn BlobStore> = match &signal.blob_dir {
        Some(dir) => {
            info!("Storing blobs in {:?}", dir);
            Arc::new(DiskBlobStore::open(dir, limits)?)
        }
        None => {
            info!("Using in-memory blob store (no persistence)");
            Arc::new(MemoryBlobStore::new(limits))
        }
    };

    let server = SignalServer::new(signal, blobs);
    server.serve(addr).await?;

    Ok(())
}
