//! Local files without a remote document
//!
//! After a pull, files that no live remote document describes are orphans:
//! typically notes deleted on another device. They are only removed when the
//! operator asks for it, and a dry run lists them without touching anything.

use crate::error::Result;
use crate::file_tracking::{FileTracker, TrackedFile};
use crate::index::SyncIndex;
use crate::store::ChunkStore;
use crate::types::{Document, PathError};
use crate::utils::remove_empty_parents;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// A local file scheduled for deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    /// Vault path
    pub path: String,
    /// Location on disk
    pub abs_path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

/// What an orphan cleanup did (or would do)
#[derive(Debug, Clone, Default)]
pub struct OrphanReport {
    /// Whether deletions were suppressed
    pub dry_run: bool,
    /// Orphans found, sorted by path
    pub orphans: Vec<Orphan>,
    /// Paths actually deleted
    pub deleted: Vec<String>,
    /// Directories removed because they became empty
    pub removed_dirs: usize,
    /// Deletions that failed
    pub errors: Vec<PathError>,
}

/// Orphans among `local` given the remote listing, sorted by path
///
/// Tombstoned documents do not protect a file. A record that failed to
/// decode still does unless its tombstone flag is set.
pub fn find_orphans(remote: &[Document], local: &[TrackedFile]) -> Vec<Orphan> {
    let live: BTreeSet<&str> = remote
        .iter()
        .filter(|doc| !doc.is_deleted())
        .map(|doc| doc.vault_path())
        .collect();

    let mut orphans: Vec<Orphan> = local
        .iter()
        .filter(|file| !live.contains(file.path.as_str()))
        .map(|file| Orphan {
            path: file.path.clone(),
            abs_path: file.abs_path.clone(),
            size: file.size,
        })
        .collect();
    orphans.sort_by(|a, b| a.path.cmp(&b.path));
    orphans
}

/// Finds and removes orphaned local files
pub struct OrphanReconciler<'a> {
    store: &'a dyn ChunkStore,
    tracker: &'a FileTracker,
    index: &'a SyncIndex,
}

impl<'a> OrphanReconciler<'a> {
    /// Reconciler over the tracker's vault
    pub fn new(store: &'a dyn ChunkStore, tracker: &'a FileTracker, index: &'a SyncIndex) -> Self {
        Self { store, tracker, index }
    }

    /// Compute the orphans under a prefix
    pub fn plan(&self, prefix: Option<&str>) -> Result<Vec<Orphan>> {
        let remote = self.store.list_docs(prefix)?;
        let local = self.tracker.scan(prefix)?;
        Ok(find_orphans(&remote, &local))
    }

    /// Delete orphans, or only report them when `dry_run`
    ///
    /// Failures are collected per file; one unremovable file does not stop
    /// the others.
    pub fn apply(&self, orphans: Vec<Orphan>, dry_run: bool) -> OrphanReport {
        let mut report = OrphanReport {
            dry_run,
            ..Default::default()
        };

        for orphan in &orphans {
            if dry_run {
                info!("[dry-run] would delete orphan {}", orphan.path);
                continue;
            }
            match std::fs::remove_file(&orphan.abs_path) {
                Ok(()) => {
                    debug!("Deleted orphan {}", orphan.path);
                    self.index.remove(&orphan.path);
                    report.deleted.push(orphan.path.clone());
                    match remove_empty_parents(&orphan.abs_path, self.tracker.root()) {
                        Ok(n) => report.removed_dirs += n,
                        Err(e) => warn!("Could not prune directories above {}: {}", orphan.path, e),
                    }
                }
                Err(e) => {
                    warn!("Could not delete orphan {}: {}", orphan.path, e);
                    report.errors.push(PathError {
                        path: orphan.path.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        report.orphans = orphans;
        report
    }

    /// Plan and apply in one step
    pub fn run(&self, prefix: Option<&str>, dry_run: bool) -> Result<OrphanReport> {
        let orphans = self.plan(prefix)?;
        info!("{} orphaned files under {:?}", orphans.len(), prefix);
        Ok(self.apply(orphans, dry_run))
    }
}
