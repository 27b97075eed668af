//! Roomlink Signal Server
//!
//! Lightweight signaling server for room membership, chat history, shared
//! file records, and peer-to-peer session negotiation. Clients connect via
//! WebSocket and exchange JSON events.
//!
//! # Protocol
//!
//! 1. A peer creates a room and shares its short code
//! 2. Other peers join with the code and receive the room's history
//! 3. Members are told about each other and negotiate directly
//! 4. The server relays offers, answers, and candidates between them
//! 5. Idle rooms and expired files are swept periodically

pub mod blob;
pub mod history;
pub mod hub;
pub mod messages;
pub mod registry;
pub mod relay;
pub mod room;
pub mod server;

pub use blob::{BlobError, BlobLimits, BlobStore, DiskBlobStore, MemoryBlobStore};
pub use hub::SignalHub;
pub use messages::{ClientMessage, ServerMessage};
pub use registry::{RegistryError, SessionRegistry};
pub use room::Room;
pub use server::SignalServer;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 3000;

/// Interval between stats log lines (6 hours)
pub const STATS_INTERVAL_SECS: u64 = 6 * 60 * 60;
