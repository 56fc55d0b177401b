//! Core data types shared across the sync engine
//!
//! ## Overview
//!
//! - **Remote state**: [`Document`] - the store's record of one file, an
//!   ordered list of chunk ids plus revision and timestamps
//! - **Local state**: [`LocalFileState`] - a file read from the vault
//! - **Sync points**: [`SyncRecord`] - what both sides agreed on after the
//!   last successful transfer of a path
//! - **Run parameters and results**: [`SyncOptions`], [`SyncSummary`]
//!
//! Timestamps are milliseconds since the Unix epoch throughout, which is
//! what the plugin writes into `mtime`/`ctime`.

use crate::chunk_id::ChunkId;
use crate::error::{Result, SyncError};
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Document type written for chunked text files
pub const PLAIN_DOC_TYPE: &str = "plain";
/// Document type of chunk leaves
pub const LEAF_DOC_TYPE: &str = "leaf";

/// Remote record describing one synced file
///
/// Serialized exactly as the plugin stores it. Fields this crate does not
/// interpret are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Store key derived from the path
    #[serde(rename = "_id")]
    pub id: String,
    /// Optimistic-concurrency token issued by the store
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Vault-relative path
    #[serde(default)]
    pub path: String,
    /// Chunk ids in reassembly order
    #[serde(default)]
    pub children: Vec<ChunkId>,
    /// Inline content of documents written before chunking existed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Modification time (ms)
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub mtime: i64,
    /// Creation time (ms)
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub ctime: i64,
    /// Content size in bytes
    #[serde(default)]
    pub size: u64,
    /// Document kind
    #[serde(rename = "type", default = "default_doc_type")]
    pub doc_type: String,
    /// Tombstone flag set by the plugin when a file is deleted
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Fields owned by other writers
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Decoder message when the stored body did not decode
    #[serde(skip)]
    pub unreadable: Option<String>,
}

fn default_doc_type() -> String {
    PLAIN_DOC_TYPE.to_string()
}

impl Document {
    /// Create an empty document for a vault-relative path
    pub fn new(path: &str) -> Self {
        Self {
            id: doc_id_for_path(path),
            revision: None,
            path: path.to_string(),
            children: Vec::new(),
            data: None,
            mtime: 0,
            ctime: 0,
            size: 0,
            doc_type: default_doc_type(),
            deleted: false,
            extra: Map::new(),
            unreadable: None,
        }
    }

    /// Stand-in for a file record whose body does not decode
    ///
    /// Keeps the id, path, revision, tombstone flag and any readable chunk
    /// ids so the record still counts as present remotely.
    pub fn unreadable(id: &str, value: &Value, reason: impl Into<String>) -> Self {
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);
        let mut doc = Self::new("");
        doc.id = id.to_string();
        doc.path = field("path").unwrap_or_default();
        doc.revision = field("_rev");
        doc.children = value
            .get("children")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).map(ChunkId::from_raw).collect())
            .unwrap_or_default();
        doc.deleted = value.get("deleted").and_then(Value::as_bool).unwrap_or(false);
        doc.unreadable = Some(reason.into());
        doc
    }

    /// Whether this is a stand-in for an undecodable record
    pub fn is_unreadable(&self) -> bool {
        self.unreadable.is_some()
    }

    /// Vault-relative path with the store's leading `/` removed
    pub fn vault_path(&self) -> &str {
        let raw = if self.path.is_empty() { &self.id } else { &self.path };
        raw.strip_prefix('/').unwrap_or(raw)
    }

    /// Whether the document is a tombstone
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether content lives inline instead of in chunks
    pub fn is_inline(&self) -> bool {
        self.children.is_empty() && self.data.is_some()
    }
}

/// Store key for a vault-relative path
///
/// The store reserves ids starting with `_`, so those paths get a leading
/// `/`; [`Document::vault_path`] strips it again.
pub fn doc_id_for_path(path: &str) -> String {
    if path.starts_with('_') {
        format!("/{}", path)
    } else {
        path.to_string()
    }
}

/// Accept a timestamp as integer milliseconds, a numeric string or an
/// ISO-8601 string
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&value).unwrap_or(0))
}

/// Parse a remote timestamp value into milliseconds
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) if s.contains('T') => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .ok()
            .or_else(|| {
                // Offset-less timestamps are taken as UTC
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc().timestamp_millis())
            }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// A file read from the vault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileState {
    /// Vault-relative, slash-separated path
    pub path: String,
    /// Absolute path on disk
    pub abs_path: PathBuf,
    /// File content
    pub content: String,
    /// Filesystem modification time (ms)
    pub mtime: i64,
    /// Filesystem creation time (ms), falls back to mtime
    pub ctime: i64,
    /// Size in bytes
    pub size: u64,
}

/// The last point both sides agreed on for a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Remote revision after the last transfer
    pub revision: String,
    /// Chunk ids after the last transfer
    pub chunk_ids: Vec<ChunkId>,
    /// Local file mtime after the last transfer (ms)
    pub local_mtime: i64,
    /// Remote document mtime after the last transfer (ms)
    pub remote_mtime: i64,
    /// When the transfer happened (ms)
    pub synced_at: i64,
}

impl SyncRecord {
    /// Record the state of a document that now matches the local file
    pub fn from_document(doc: &Document, local_mtime: i64) -> Result<Self> {
        let revision = doc
            .revision
            .clone()
            .ok_or_else(|| SyncError::internal(format!("document {} has no revision", doc.id)))?;
        Ok(Self {
            revision,
            chunk_ids: doc.children.clone(),
            local_mtime,
            remote_mtime: doc.mtime,
            synced_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}

/// Which way a run moves content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Remote to local
    Pull,
    /// Local to remote
    Push,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::Pull => f.write_str("pull"),
            SyncDirection::Push => f.write_str("push"),
        }
    }
}

/// Parameters of a pull or push run
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Only paths starting with this prefix
    pub path_prefix: Option<String>,
    /// Pull: skip paths whose timestamps show no change
    pub changed_only: bool,
    /// Push: consider every path regardless of timestamps
    pub force: bool,
    /// Plan and read, never mutate
    pub dry_run: bool,
    /// Pull: delete local files without a remote document afterwards
    pub delete_orphans: bool,
}

/// A failure confined to one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathError {
    /// Affected path
    pub path: String,
    /// Error description
    pub message: String,
}

/// Outcome counts of a run
///
/// Dry runs produce the same shape, describing what would have happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Direction of the run
    pub direction: SyncDirection,
    /// Whether mutations were suppressed
    pub dry_run: bool,
    /// Paths considered
    pub total: usize,
    /// Paths created on the receiving side
    pub created: usize,
    /// Paths updated on the receiving side
    pub updated: usize,
    /// Paths left alone
    pub skipped: usize,
    /// Paths changed on both sides
    pub conflicted: Vec<String>,
    /// Paths that failed
    pub errored: Vec<PathError>,
    /// Orphaned local files removed (or listed, for dry runs)
    pub orphans: Vec<String>,
    /// Chunks fetched or uploaded
    pub chunks_transferred: usize,
    /// Bytes written locally or uploaded
    pub bytes_transferred: u64,
    /// Wall time in milliseconds
    pub duration_ms: u64,
}

impl SyncSummary {
    /// Empty summary for a run
    pub fn new(direction: SyncDirection, dry_run: bool) -> Self {
        Self {
            direction,
            dry_run,
            total: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            conflicted: Vec::new(),
            errored: Vec::new(),
            orphans: Vec::new(),
            chunks_transferred: 0,
            bytes_transferred: 0,
            duration_ms: 0,
        }
    }

    /// Paths whose content moved
    pub fn transferred(&self) -> usize {
        self.created + self.updated
    }

    /// No conflicts and no errors
    pub fn is_success(&self) -> bool {
        self.conflicted.is_empty() && self.errored.is_empty()
    }

    pub(crate) fn record_error(&mut self, path: &str, err: &SyncError) {
        self.errored.push(PathError {
            path: path.to_string(),
            message: err.to_string(),
        });
    }
}
