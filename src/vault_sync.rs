//! Whole-vault sync runs
//!
//! [`VaultSync`] ties the pieces together: it lists the remote documents and
//! scans the vault under the run's prefix, plans every path in the union of
//! both, and hands the transfers to the [`Puller`] or [`Pusher`]. Failures are
//! confined to their path unless they mean the store itself is unusable, in
//! which case the run stops and the error is returned.
//!
//! Baselines are saved after every run that is not a dry run.

use crate::cache::ChunkCache;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::file_tracking::{FileTracker, TrackedFile};
use crate::index::SyncIndex;
use crate::orphans::{OrphanReconciler, OrphanReport};
use crate::planner::{SyncPlan, SyncPlanner};
use crate::puller::Puller;
use crate::pusher::Pusher;
use crate::repair::{RepairReport, Repairer};
use crate::retry::RetryPolicy;
use crate::store::{ChunkStore, CouchStore};
use crate::types::{Document, SyncDirection, SyncOptions, SyncSummary};
use crate::verification::{DocumentVerifier, VerificationReport};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Sync engine for one vault and one database
///
/// # Examples
///
/// ```rust,no_run
/// use vaultsync::{SyncOptions, VaultSyncBuilder};
///
/// # fn main() -> vaultsync::Result<()> {
/// let sync = VaultSyncBuilder::from_env(None, None)?.max_workers(4).build()?;
///
/// let summary = sync.pull(&SyncOptions {
///     path_prefix: Some("Notes/".to_string()),
///     changed_only: true,
///     ..Default::default()
/// })?;
/// println!("{} files updated", summary.transferred());
/// # Ok(())
/// # }
/// ```
pub struct VaultSync {
    config: SyncConfig,
    store: Arc<dyn ChunkStore>,
    tracker: FileTracker,
    index: SyncIndex,
    cache: ChunkCache,
    pool: ThreadPool,
}

impl std::fmt::Debug for VaultSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSync")
            .field("vault_root", &self.config.vault_root)
            .field("database", &self.config.store.database)
            .field("max_workers", &self.config.max_workers)
            .field("baselines", &self.index.len())
            .finish()
    }
}

impl VaultSync {
    /// Engine from a complete configuration, talking to CouchDB
    pub fn new(config: SyncConfig) -> Result<Self> {
        VaultSyncBuilder::new(config).build()
    }

    /// Effective configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Vault root
    pub fn vault_root(&self) -> &Path {
        &self.config.vault_root
    }

    /// Remote store
    pub fn store(&self) -> &dyn ChunkStore {
        self.store.as_ref()
    }

    /// Baseline index
    pub fn index(&self) -> &SyncIndex {
        &self.index
    }

    /// Local scanner
    pub fn tracker(&self) -> &FileTracker {
        &self.tracker
    }

    /// Chunk cache shared by all runs of this engine
    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    /// Bring remote changes into the vault
    ///
    /// Pulls are forced unless `changed_only` is set. With `delete_orphans`
    /// local files without a live remote document are removed afterwards.
    pub fn pull(&self, options: &SyncOptions) -> Result<SyncSummary> {
        let planner = SyncPlanner::for_pull(options.changed_only);
        let mut summary = self.run(planner, options)?;

        if options.delete_orphans {
            let report = self.delete_orphans(options.path_prefix.as_deref(), options.dry_run)?;
            summary.orphans = if options.dry_run {
                report.orphans.iter().map(|o| o.path.clone()).collect()
            } else {
                report.deleted
            };
            summary.errored.extend(report.errors);
        }

        self.finish(&summary)?;
        Ok(summary)
    }

    /// Upload local changes
    pub fn push(&self, options: &SyncOptions) -> Result<SyncSummary> {
        let planner = SyncPlanner::for_push(options.force);
        let summary = self.run(planner, options)?;
        self.finish(&summary)?;
        Ok(summary)
    }

    /// Remove local files that no live remote document describes
    pub fn delete_orphans(&self, prefix: Option<&str>, dry_run: bool) -> Result<OrphanReport> {
        let report = OrphanReconciler::new(self.store(), &self.tracker, &self.index).run(prefix, dry_run)?;
        if !dry_run {
            self.index.save()?;
        }
        Ok(report)
    }

    /// Check a sample of documents against the canonical chunking
    ///
    /// `sample_limit` of 0 checks every document under the prefix.
    pub fn verify(&self, prefix: Option<&str>, sample_limit: usize) -> Result<VerificationReport> {
        DocumentVerifier::new(self.store(), &self.cache, &self.pool)
            .with_local(&self.tracker)
            .verify(prefix, sample_limit)
    }

    /// Regenerate documents with non-canonical chunk ids
    pub fn repair(&self, prefix: Option<&str>, dry_run: bool) -> Result<RepairReport> {
        let report = Repairer::new(self.store(), &self.cache, &self.pool)
            .with_index(&self.index)
            .dry_run(dry_run)
            .run(prefix)?;
        if !dry_run {
            self.index.save()?;
        }
        Ok(report)
    }

    /// Plan and execute every path in scope
    fn run(&self, planner: SyncPlanner, options: &SyncOptions) -> Result<SyncSummary> {
        let start = Instant::now();
        let direction = planner.direction();
        let prefix = options.path_prefix.as_deref();
        let mut summary = SyncSummary::new(direction, options.dry_run);

        let remote: BTreeMap<String, Document> = self
            .store
            .list_docs(prefix)?
            .into_iter()
            .filter(|doc| self.tracker.in_scope(doc.vault_path(), prefix))
            .map(|doc| (doc.vault_path().to_string(), doc))
            .collect();
        let local: BTreeMap<String, TrackedFile> = self
            .tracker
            .scan(prefix)?
            .into_iter()
            .map(|file| (file.path.clone(), file))
            .collect();
        let paths: BTreeSet<&String> = remote.keys().chain(local.keys()).collect();
        info!(
            "{} run over {} paths ({} remote, {} local){}",
            direction,
            paths.len(),
            remote.len(),
            local.len(),
            if options.dry_run { " [dry-run]" } else { "" }
        );

        let puller = Puller::new(self.store(), &self.cache, &self.pool, &self.config.vault_root).dry_run(options.dry_run);
        let pusher = Pusher::new(self.store(), &self.pool).dry_run(options.dry_run);

        for path in paths {
            summary.total += 1;
            let doc = remote.get(path);
            let live = doc.is_some_and(|d| !d.is_deleted());

            // One-sided paths the run never writes need no reading
            let file = local.get(path);
            let skip = match direction {
                SyncDirection::Pull => !live,
                SyncDirection::Push => file.is_none(),
            };
            if skip {
                summary.skipped += 1;
                continue;
            }
            if let Some(message) = doc.and_then(|d| d.unreadable.clone()) {
                let e = SyncError::MalformedDocument {
                    path: path.clone(),
                    message,
                };
                warn!("{}", e);
                summary.record_error(path, &e);
                continue;
            }

            let local_state = match file.map(|f| self.tracker.load(f)).transpose() {
                Ok(state) => state,
                Err(e) => {
                    warn!("Cannot read {}: {}", path, e);
                    summary.record_error(path, &e);
                    continue;
                }
            };

            let baseline = self.index.get(path);
            let plan = planner.plan(path, local_state, doc.cloned(), baseline.as_ref());
            if let Err(e) = self.execute(plan, &puller, &pusher, &mut summary) {
                if e.is_fatal() {
                    warn!("Aborting {} run at {}: {}", direction, path, e);
                    if !options.dry_run {
                        self.index.save()?;
                    }
                    return Err(e);
                }
                warn!("{} failed: {}", path, e);
                summary.record_error(path, &e);
            }
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "{} done: {} created, {} updated, {} skipped, {} conflicts, {} errors in {:?}",
            direction,
            summary.created,
            summary.updated,
            summary.skipped,
            summary.conflicted.len(),
            summary.errored.len(),
            start.elapsed()
        );
        Ok(summary)
    }

    /// Carry out one plan, updating the summary and the index
    fn execute(&self, plan: SyncPlan, puller: &Puller<'_>, pusher: &Pusher<'_>, summary: &mut SyncSummary) -> Result<()> {
        let direction = summary.direction;
        match plan {
            SyncPlan::NoOp { path, reason, record } => {
                debug!("{}: {}", path, reason);
                summary.skipped += 1;
                if let Some(record) = record.filter(|_| !summary.dry_run) {
                    self.index.insert(&path, record);
                }
            }
            SyncPlan::Conflict {
                path,
                remote_revision,
                local_mtime,
                remote_mtime,
            } => {
                warn!(
                    "Conflict on {}: both sides changed (remote {:?} at {}, local at {})",
                    path, remote_revision, remote_mtime, local_mtime
                );
                summary.conflicted.push(path);
            }
            SyncPlan::Pull(doc) if direction == SyncDirection::Pull => {
                let outcome = puller.pull(&doc)?;
                if outcome.created {
                    summary.created += 1;
                } else {
                    summary.updated += 1;
                }
                summary.chunks_transferred += outcome.chunks_fetched;
                summary.bytes_transferred += outcome.bytes;
                if let Some(record) = outcome.record {
                    self.index.insert(&outcome.path, record);
                }
            }
            SyncPlan::Push { local, known, local_ids } if direction == SyncDirection::Push => {
                match pusher.push_planned(&local, known.as_ref(), local_ids) {
                    Ok(outcome) => {
                        if outcome.document_written || summary.dry_run {
                            if outcome.created {
                                summary.created += 1;
                            } else {
                                summary.updated += 1;
                            }
                        } else {
                            summary.skipped += 1;
                        }
                        summary.chunks_transferred += outcome.chunks_uploaded;
                        summary.bytes_transferred += outcome.bytes_uploaded;
                        if let Some(record) = outcome.record {
                            self.index.insert(&outcome.path, record);
                        }
                    }
                    Err(e) if e.is_conflict() => {
                        warn!("Conflict on {}: remote changed while pushing", local.path);
                        summary.conflicted.push(local.path.clone());
                    }
                    Err(e) => return Err(e),
                }
            }
            other => {
                debug!("{}: newer on the side this {} run does not write", other.path(), direction);
                summary.skipped += 1;
            }
        }
        Ok(())
    }

    fn finish(&self, summary: &SyncSummary) -> Result<()> {
        if !summary.dry_run {
            self.index.save()?;
        }
        Ok(())
    }
}

/// Builder for [`VaultSync`]
///
/// Starts from a [`SyncConfig`] and lets callers override single settings
/// or inject a store other than CouchDB.
pub struct VaultSyncBuilder {
    config: SyncConfig,
    store: Option<Arc<dyn ChunkStore>>,
}

impl VaultSyncBuilder {
    /// Builder starting from `config`
    pub fn new(config: SyncConfig) -> Self {
        Self { config, store: None }
    }

    /// Builder configured from the environment and an optional `.env` file
    ///
    /// See [`crate::config`] for the variables read.
    pub fn from_env(vault_root: Option<PathBuf>, env_file: Option<&Path>) -> Result<Self> {
        Ok(Self::new(SyncConfig::load(vault_root, env_file)?))
    }

    /// Use this store instead of connecting to the configured server
    pub fn store(mut self, store: Arc<dyn ChunkStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Concurrent chunk requests
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    /// Top-level directories to sync; empty means the whole vault
    pub fn sync_directories(mut self, directories: Vec<String>) -> Self {
        self.config.sync_directories = directories;
        self
    }

    /// Glob patterns of paths never synced
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.exclude_patterns = patterns;
        self
    }

    /// Directory holding the baseline index
    pub fn state_dir(mut self, state_dir: PathBuf) -> Self {
        self.config.state_dir = state_dir;
        self
    }

    /// Backoff for transient store failures
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Validate the configuration and assemble the engine
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidConfiguration`] for unusable settings or a
    ///   missing vault directory
    /// - [`SyncError::Pattern`] if an exclude pattern does not compile
    /// - [`SyncError::ThreadPool`] if the worker pool cannot start
    pub fn build(self) -> Result<VaultSync> {
        let config = self.config;
        config.validate()?;
        if !config.vault_root.is_dir() {
            return Err(SyncError::InvalidConfiguration(format!(
                "vault root {:?} is not a directory",
                config.vault_root
            )));
        }

        let store: Arc<dyn ChunkStore> = match self.store {
            Some(store) => store,
            None => Arc::new(CouchStore::new(config.store.clone(), config.retry)?),
        };

        let tracker = FileTracker::new(config.vault_root.clone())
            .with_sync_directories(config.sync_directories.clone())
            .with_exclude_patterns(config.exclude_patterns.clone())?
            .with_state_dir(config.state_dir.clone());

        let index = SyncIndex::open(&config.state_dir, &config.store.database)?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.max_workers)
            .thread_name(|i| format!("vaultsync-worker-{}", i))
            .build()
            .map_err(|e| SyncError::ThreadPool(e.to_string()))?;

        debug!(
            "Engine for {:?} against database {} with {} workers",
            config.vault_root, config.store.database, config.max_workers
        );

        Ok(VaultSync {
            config,
            store,
            tracker,
            index,
            cache: ChunkCache::new(),
            pool,
        })
    }
}
