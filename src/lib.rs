//! # vaultsync - chunked sync of a note vault with CouchDB
//!
//! Synchronizes a tree of local text files with a CouchDB database that the
//! Obsidian LiveSync plugin also writes to. Files are stored the way the
//! plugin stores them: one document per file listing content-defined chunks,
//! and one immutable leaf per chunk, keyed by a hash of its bytes. Because
//! both sides split and name chunks identically, they share one deduplicated
//! chunk pool.
//!
//! ## Overview
//!
//! - **Pull**: bring remote documents into the vault, fetching only chunks
//!   not seen before
//! - **Push**: upload local files, sending only chunks the remote lacks,
//!   with revision-conditioned document writes
//! - **Orphans**: remove local files whose remote document is gone
//! - **Verify / repair**: find documents with non-canonical chunk ids and
//!   regenerate them
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vaultsync::{SyncOptions, VaultSyncBuilder};
//! use std::path::PathBuf;
//!
//! # fn main() -> vaultsync::Result<()> {
//! // Reads COUCHDB_URI, COUCHDB_PASSWORD, ... from the environment or .env
//! let sync = VaultSyncBuilder::from_env(Some(PathBuf::from("./vault")), None)?.build()?;
//!
//! let pulled = sync.pull(&SyncOptions::default())?;
//! println!("{} files pulled", pulled.transferred());
//!
//! let pushed = sync.push(&SyncOptions {
//!     path_prefix: Some("Notes/".to_string()),
//!     ..Default::default()
//! })?;
//! if !pushed.is_success() {
//!     eprintln!("conflicts: {:?}", pushed.conflicted);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing against memory
//!
//! Any [`ChunkStore`] can stand in for the server:
//!
//! ```rust,no_run
//! use vaultsync::{MemoryStore, StoreConfig, SyncConfig, VaultSyncBuilder};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # fn main() -> vaultsync::Result<()> {
//! let config = SyncConfig::new(
//!     PathBuf::from("./vault"),
//!     StoreConfig::new("http://localhost:5984", "obsidian", "admin", "secret"),
//! );
//! let sync = VaultSyncBuilder::new(config)
//!     .store(Arc::new(MemoryStore::new()))
//!     .sync_directories(Vec::new())
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`chunking`], [`chunk_id`]: the plugin's chunking and chunk naming
//! - [`store`]: the store seam, CouchDB client and in-memory store
//! - [`planner`], [`puller`], [`pusher`]: per-path decisions and transfers
//! - [`orphans`], [`verification`], [`repair`]: maintenance operations
//! - [`vault_sync`]: whole-vault runs
//! - [`config`], [`error`], [`types`]: settings, errors and shared types

pub mod cache;
pub mod chunk_id;
pub mod chunking;
pub mod config;
pub mod error;
pub mod file_tracking;
pub mod index;
pub mod orphans;
pub mod planner;
pub mod puller;
pub mod pusher;
pub mod repair;
pub mod retry;
pub mod store;
pub mod types;
pub mod vault_sync;
pub mod verification;

mod collections;
mod utils;

pub use chunk_id::ChunkId;
pub use chunking::{chunk_document, document_chunk_ids, ChunkParams, RollingChunker};
pub use config::{StoreConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use orphans::{Orphan, OrphanReport};
pub use planner::{NoOpReason, SyncPlan, SyncPlanner};
pub use repair::{RepairAction, RepairReport};
pub use retry::RetryPolicy;
pub use store::{ChunkPut, ChunkStore, CouchStore, MemoryStore};
pub use types::*;
pub use utils::format_bytes;
pub use vault_sync::{VaultSync, VaultSyncBuilder};
pub use verification::{DocumentStatus, DocumentVerification, LocalStatus, VerificationReport};

#[cfg(test)]
mod tests;
