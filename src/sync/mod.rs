//! Locality and replication between crawl instances
//!
//! - `bridge`: whether this instance holds a document or volume
//! - `server`: HTTP endpoints peers pull from
//! - `worker`: pulls a peer's documents and deletes them there once stored

pub mod bridge;
pub mod server;
pub mod worker;

pub use bridge::{delete_storage, StorageBridge, VolumeBridge};
pub use server::{create_router, parse_target, serve, serve_on, AppState, Target};
pub use worker::{parse_handshake, SyncStats, SyncWorker};
