//! Local vault scanning
//!
//! [`FileTracker`] decides which files of the vault take part in sync and
//! reads them into [`LocalFileState`]s. A path is in scope when
//!
//! 1. it lies under one of the configured sync directories (or the list is
//!    empty, meaning the whole vault),
//! 2. it starts with the run's path prefix, if any,
//! 3. no exclude pattern matches it, and
//! 4. it is not inside the sync state directory.
//!
//! The same scope test is applied to remote paths so both sides of a run
//! look at the same set of files.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vaultsync::file_tracking::FileTracker;
//! use std::path::PathBuf;
//!
//! # fn main() -> vaultsync::Result<()> {
//! let tracker = FileTracker::new(PathBuf::from("/home/me/vault"))
//!     .with_sync_directories(vec!["Notes".to_string()])
//!     .with_exclude_patterns(vec!["**/.obsidian/**".to_string()])?;
//!
//! for file in tracker.scan(Some("Notes/daily"))? {
//!     let state = tracker.load(&file)?;
//!     println!("{} ({} bytes)", state.path, state.size);
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SyncError};
use crate::types::LocalFileState;
use crate::utils::{file_times_ms, make_relative, to_vault_path};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Name probed inside a directory to decide whether the whole subtree is
/// excluded (patterns such as `**/.git/**` only match paths below it)
const SUBTREE_PROBE: &str = "__vaultsync_probe__";

/// Prefix of temporary files written by atomic writes
const TEMP_FILE_PREFIX: &str = ".vaultsync-";

/// A file found by a scan, before its content is read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    /// Vault-relative, slash-separated path
    pub path: String,
    /// Absolute path on disk
    pub abs_path: PathBuf,
    /// Size in bytes at scan time
    pub size: u64,
    /// Modification time at scan time (ms)
    pub mtime: i64,
}

/// Scanner for the local side of a sync
#[derive(Debug, Clone)]
pub struct FileTracker {
    /// Vault root
    root_path: PathBuf,
    /// Top-level directories in scope; empty means everything
    sync_directories: Vec<String>,
    /// Source patterns, kept for diagnostics
    exclude_patterns: Vec<String>,
    /// Compiled exclude patterns
    excludes: GlobSet,
    /// Directory holding sync state, never scanned
    state_dir: Option<PathBuf>,
}

impl FileTracker {
    /// Tracker over the whole vault with no exclusions
    pub fn new(root_path: PathBuf) -> Self {
        Self {
            root_path,
            sync_directories: Vec::new(),
            exclude_patterns: Vec::new(),
            excludes: GlobSet::empty(),
            state_dir: None,
        }
    }

    /// Restrict the scope to these top-level directories
    pub fn with_sync_directories(mut self, directories: Vec<String>) -> Self {
        self.sync_directories = directories
            .into_iter()
            .map(|d| d.trim_matches('/').to_string())
            .filter(|d| !d.is_empty())
            .collect();
        self
    }

    /// Exclude paths matching any of these glob patterns
    ///
    /// # Errors
    ///
    /// [`SyncError::Pattern`] if a pattern does not compile.
    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            builder.add(Glob::new(pattern)?);
        }
        self.excludes = builder.build()?;
        self.exclude_patterns = patterns;
        Ok(self)
    }

    /// Never scan this directory
    pub fn with_state_dir(mut self, state_dir: PathBuf) -> Self {
        self.state_dir = Some(state_dir);
        self
    }

    /// Vault root
    pub fn root(&self) -> &Path {
        &self.root_path
    }

    /// Configured exclude patterns
    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude_patterns
    }

    /// Whether a vault path is excluded by pattern or lies in the state dir
    pub fn is_excluded(&self, vault_path: &str) -> bool {
        if self.excludes.is_match(vault_path) {
            return true;
        }
        match &self.state_dir {
            Some(state_dir) => self.root_path.join(vault_path).starts_with(state_dir),
            None => false,
        }
    }

    /// Whether a vault path takes part in a run with the given prefix
    pub fn in_scope(&self, vault_path: &str, prefix: Option<&str>) -> bool {
        let vault_path = vault_path.trim_start_matches('/');
        if !self.sync_directories.is_empty() {
            let top = vault_path.split('/').next().unwrap_or_default();
            // A file directly in the root has no directory component
            let has_dir = vault_path.contains('/');
            if !has_dir || !self.sync_directories.iter().any(|d| d == top) {
                return false;
            }
        }
        if let Some(prefix) = normalize_prefix(prefix) {
            if !vault_path.starts_with(prefix) {
                return false;
            }
        }
        !self.is_excluded(vault_path)
    }

    /// Directories the walk starts from
    fn walk_roots(&self) -> Vec<PathBuf> {
        if self.sync_directories.is_empty() {
            vec![self.root_path.clone()]
        } else {
            self.sync_directories
                .iter()
                .map(|d| self.root_path.join(d))
                .filter(|p| p.is_dir())
                .collect()
        }
    }

    /// Whether a whole directory can be skipped
    fn prune_dir(&self, dir: &Path) -> bool {
        if let Some(state_dir) = &self.state_dir {
            if dir.starts_with(state_dir) {
                return true;
            }
        }
        match make_relative(dir, &self.root_path).and_then(|rel| to_vault_path(&rel)) {
            Ok(rel) => self.excludes.is_match(format!("{}/{}", rel, SUBTREE_PROBE)),
            Err(_) => false,
        }
    }

    /// List in-scope files, sorted by path
    ///
    /// Unreadable entries are logged and skipped.
    pub fn scan(&self, prefix: Option<&str>) -> Result<Vec<TrackedFile>> {
        let start = Instant::now();
        let mut files = Vec::new();

        for walk_root in self.walk_roots() {
            let walker = WalkDir::new(&walk_root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| !(entry.file_type().is_dir() && entry.depth() > 0 && self.prune_dir(entry.path())));

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Walk error: {}", e);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with(TEMP_FILE_PREFIX) {
                    continue;
                }

                let rel = make_relative(entry.path(), &self.root_path)?;
                let vault_path = match to_vault_path(&rel) {
                    Ok(path) => path,
                    Err(e) => {
                        warn!("Skipping {:?}: {}", entry.path(), e);
                        continue;
                    }
                };
                if !self.in_scope(&vault_path, prefix) {
                    continue;
                }

                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!("Cannot stat {:?}: {}", entry.path(), e);
                        continue;
                    }
                };
                let (mtime, _) = file_times_ms(&metadata)?;

                files.push(TrackedFile {
                    path: vault_path,
                    abs_path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    mtime,
                });
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!("Scanned {} files under {:?} in {:?}", files.len(), prefix, start.elapsed());
        Ok(files)
    }

    /// Read a scanned file
    ///
    /// # Errors
    ///
    /// [`SyncError::NotText`] if the content is not UTF-8.
    pub fn load(&self, file: &TrackedFile) -> Result<LocalFileState> {
        read_local_file(&file.abs_path, &file.path)
    }

    /// Read a vault path if it exists
    pub fn load_path(&self, vault_path: &str) -> Result<Option<LocalFileState>> {
        let abs_path = crate::utils::vault_path_to_abs(&self.root_path, vault_path)?;
        if !abs_path.is_file() {
            return Ok(None);
        }
        read_local_file(&abs_path, vault_path.trim_start_matches('/')).map(Some)
    }
}

/// Read a file into a [`LocalFileState`]
pub fn read_local_file(abs_path: &Path, vault_path: &str) -> Result<LocalFileState> {
    let bytes = fs::read(abs_path)?;
    let metadata = fs::metadata(abs_path)?;
    let (mtime, ctime) = file_times_ms(&metadata)?;
    let size = bytes.len() as u64;
    let content = String::from_utf8(bytes).map_err(|_| SyncError::NotText {
        path: abs_path.to_path_buf(),
    })?;
    Ok(LocalFileState {
        path: vault_path.to_string(),
        abs_path: abs_path.to_path_buf(),
        content,
        mtime,
        ctime,
        size,
    })
}

/// Prefix without leading slashes, `None` when empty
pub(crate) fn normalize_prefix(prefix: Option<&str>) -> Option<&str> {
    prefix.map(|p| p.trim_start_matches('/')).filter(|p| !p.is_empty())
}
