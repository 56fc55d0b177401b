//! Per-path sync decisions
//!
//! The planner looks at one path at a time: the local file (if any), the
//! remote document (if any, tombstones count as absent) and the baseline
//! recorded after the last successful transfer. It decides whether the run
//! should pull, push, leave the path alone, or report a conflict.
//!
//! ```text
//!              remote absent      remote present
//! local absent NoOp               Pull
//! local present Push              compare chunk ids against the baseline
//! ```
//!
//! With both sides present, the cheap check comes first: when the local
//! mtime and the remote revision both still equal the baseline nothing has
//! changed and no content is chunked. Otherwise the local content is
//! chunked and its ids compared with the remote `children`.

use crate::chunk_id::ChunkId;
use crate::chunking::document_chunk_ids;
use crate::types::{Document, LocalFileState, SyncDirection, SyncRecord};
use chrono::Utc;
use std::fmt;
use tracing::trace;

/// Why a path needs no transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// Neither side has the path
    Absent,
    /// Both sides still match the baseline
    Unchanged,
    /// Both sides hold the same content
    ContentEqual,
    /// No baseline and identical mtimes, nothing to prefer
    SameTimestamp,
    /// The newer side is the one this run does not write to
    NewerOnOtherSide,
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            NoOpReason::Absent => "absent on both sides",
            NoOpReason::Unchanged => "unchanged since last sync",
            NoOpReason::ContentEqual => "content already equal",
            NoOpReason::SameTimestamp => "same timestamp",
            NoOpReason::NewerOnOtherSide => "newer on the other side",
        };
        f.write_str(text)
    }
}

/// Decision for one path
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPlan {
    /// Leave the path alone
    NoOp {
        /// Vault path
        path: String,
        /// Why
        reason: NoOpReason,
        /// Fresh baseline when both sides were found equal
        record: Option<SyncRecord>,
    },
    /// Write the remote document to the vault
    Pull(Document),
    /// Upload the local file
    Push {
        /// File to upload
        local: LocalFileState,
        /// Remote document it replaces, if one exists
        known: Option<Document>,
        /// Canonical chunk ids of `local`, when already computed
        local_ids: Option<Vec<ChunkId>>,
    },
    /// Both sides changed since the baseline
    Conflict {
        /// Vault path
        path: String,
        /// Remote revision at planning time
        remote_revision: Option<String>,
        /// Local mtime at planning time (ms)
        local_mtime: i64,
        /// Remote mtime at planning time (ms)
        remote_mtime: i64,
    },
}

impl SyncPlan {
    fn noop(path: &str, reason: NoOpReason) -> Self {
        SyncPlan::NoOp {
            path: path.to_string(),
            reason,
            record: None,
        }
    }

    /// Vault path the plan is for
    pub fn path(&self) -> &str {
        match self {
            SyncPlan::NoOp { path, .. } | SyncPlan::Conflict { path, .. } => path,
            SyncPlan::Pull(doc) => doc.vault_path(),
            SyncPlan::Push { local, .. } => &local.path,
        }
    }
}

/// Decides [`SyncPlan`]s for one run
#[derive(Debug, Clone, Copy)]
pub struct SyncPlanner {
    direction: SyncDirection,
    force: bool,
}

impl SyncPlanner {
    /// Planner for a run in `direction`
    ///
    /// `force` skips the timestamp shortcut and, without a baseline, moves
    /// content in the run's direction even if the other side is newer.
    pub fn new(direction: SyncDirection, force: bool) -> Self {
        Self { direction, force }
    }

    /// Planner for a pull run; pulls are forced unless `changed_only`
    pub fn for_pull(changed_only: bool) -> Self {
        Self::new(SyncDirection::Pull, !changed_only)
    }

    /// Planner for a push run
    pub fn for_push(force: bool) -> Self {
        Self::new(SyncDirection::Push, force)
    }

    /// Direction of the run
    pub fn direction(&self) -> SyncDirection {
        self.direction
    }

    /// Plan one path
    pub fn plan(
        &self,
        path: &str,
        local: Option<LocalFileState>,
        remote: Option<Document>,
        baseline: Option<&SyncRecord>,
    ) -> SyncPlan {
        let remote = remote.filter(|doc| !doc.is_deleted());

        let (local, remote) = match (local, remote) {
            (None, None) => return SyncPlan::noop(path, NoOpReason::Absent),
            (None, Some(remote)) => return SyncPlan::Pull(remote),
            (Some(local), None) => {
                return SyncPlan::Push {
                    local,
                    known: None,
                    local_ids: None,
                }
            }
            (Some(local), Some(remote)) => (local, remote),
        };

        if let Some(baseline) = baseline {
            if !self.force
                && local.mtime == baseline.local_mtime
                && remote.revision.as_deref() == Some(baseline.revision.as_str())
            {
                trace!("{}: unchanged since {}", path, baseline.revision);
                return SyncPlan::noop(path, NoOpReason::Unchanged);
            }
        }

        let local_ids = document_chunk_ids(&local.content);
        let remote_ids = remote_content_ids(&remote);
        if remote_ids == local_ids {
            let record = remote.revision.clone().map(|revision| SyncRecord {
                revision,
                chunk_ids: remote_ids,
                local_mtime: local.mtime,
                remote_mtime: remote.mtime,
                synced_at: Utc::now().timestamp_millis(),
            });
            return SyncPlan::NoOp {
                path: path.to_string(),
                reason: NoOpReason::ContentEqual,
                record,
            };
        }

        match baseline {
            Some(baseline) => {
                let local_changed = local_ids != baseline.chunk_ids;
                let remote_changed = remote_ids != baseline.chunk_ids;
                trace!("{}: local changed {}, remote changed {}", path, local_changed, remote_changed);
                match (local_changed, remote_changed) {
                    (true, true) => SyncPlan::Conflict {
                        path: path.to_string(),
                        remote_revision: remote.revision.clone(),
                        local_mtime: local.mtime,
                        remote_mtime: remote.mtime,
                    },
                    (false, true) => SyncPlan::Pull(remote),
                    (true, false) => SyncPlan::Push {
                        local,
                        known: Some(remote),
                        local_ids: Some(local_ids),
                    },
                    (false, false) => self.follow_direction(local, remote, local_ids),
                }
            }
            None if self.force => self.follow_direction(local, remote, local_ids),
            None => {
                if remote.mtime > local.mtime {
                    self.accept(SyncPlan::Pull(remote), path)
                } else if local.mtime > remote.mtime {
                    self.accept(
                        SyncPlan::Push {
                            local,
                            known: Some(remote),
                            local_ids: Some(local_ids),
                        },
                        path,
                    )
                } else {
                    SyncPlan::noop(path, NoOpReason::SameTimestamp)
                }
            }
        }
    }

    /// Transfer in the run's direction
    fn follow_direction(&self, local: LocalFileState, remote: Document, local_ids: Vec<ChunkId>) -> SyncPlan {
        match self.direction {
            SyncDirection::Pull => SyncPlan::Pull(remote),
            SyncDirection::Push => SyncPlan::Push {
                local,
                known: Some(remote),
                local_ids: Some(local_ids),
            },
        }
    }

    /// Keep a transfer only if it goes the way this run writes
    fn accept(&self, plan: SyncPlan, path: &str) -> SyncPlan {
        let direction = match plan {
            SyncPlan::Pull(_) => SyncDirection::Pull,
            _ => SyncDirection::Push,
        };
        if direction == self.direction {
            plan
        } else {
            SyncPlan::noop(path, NoOpReason::NewerOnOtherSide)
        }
    }
}

/// Chunk ids that describe a remote document's content
///
/// Inline documents have no children; their content is chunked on the fly
/// so they compare equal to an identical local file.
fn remote_content_ids(remote: &Document) -> Vec<ChunkId> {
    match &remote.data {
        Some(data) if remote.children.is_empty() => document_chunk_ids(data),
        _ => remote.children.clone(),
    }
}
