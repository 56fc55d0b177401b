//! Multi-device integration tests
//!
//! Several vault directories ("devices") share one in-memory store, the
//! way several machines share one CouchDB database.

use ::vaultsync::*;
use filetime::FileTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// One vault with its engine
pub struct Device {
    pub dir: TempDir,
    pub sync: VaultSync,
}

impl Device {
    /// Vault root
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file with a fixed mtime (seconds)
    pub fn write(&self, path: &str, content: &str, mtime_secs: i64) -> PathBuf {
        let abs = self.root().join(path);
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(&abs, content).unwrap();
        filetime::set_file_mtime(&abs, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
        abs
    }

    /// Read a file, `None` if absent
    pub fn read(&self, path: &str) -> Option<String> {
        fs::read_to_string(self.root().join(path)).ok()
    }

    pub fn push(&self) -> SyncSummary {
        self.sync.push(&SyncOptions::default()).unwrap()
    }

    pub fn pull(&self) -> SyncSummary {
        self.sync.pull(&SyncOptions::default()).unwrap()
    }
}

/// Devices sharing one store
pub struct SyncTestHarness {
    pub store: Arc<MemoryStore>,
    pub devices: Vec<Device>,
}

impl SyncTestHarness {
    /// `count` empty devices syncing the whole vault
    pub fn new(count: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let devices = (0..count).map(|_| Self::device(&store)).collect();
        Self { store, devices }
    }

    fn device(store: &Arc<MemoryStore>) -> Device {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::new(
            dir.path().to_path_buf(),
            StoreConfig::new("http://localhost:5984", "integration", "admin", "secret"),
        );
        let sync = VaultSyncBuilder::new(config)
            .store(store.clone())
            .sync_directories(Vec::new())
            .max_workers(4)
            .build()
            .unwrap();
        Device { dir, sync }
    }

    pub fn device_at(&self, index: usize) -> &Device {
        &self.devices[index]
    }

    /// Mark a remote document deleted, as the plugin does
    pub fn tombstone(&self, path: &str) {
        let mut doc = self.store.get_doc(path).unwrap().unwrap();
        let revision = doc.revision.clone();
        doc.deleted = true;
        doc.children.clear();
        self.store.put_doc(&doc, revision.as_deref()).unwrap();
    }
}

/// Generates markdown-like note content
pub struct NoteGenerator {
    rng: StdRng,
}

impl NoteGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A note of roughly `paragraphs` paragraphs
    pub fn note(&mut self, paragraphs: usize) -> String {
        const WORDS: &[&str] = &[
            "sync", "vault", "chunk", "note", "replica", "revision", "daily", "meeting", "todo", "idea",
            "draft", "한글", "über", "链接",
        ];
        let mut out = String::from("# Note\n\n");
        for _ in 0..paragraphs {
            let len = self.rng.random_range(10..60);
            let words: Vec<&str> = (0..len).map(|_| WORDS[self.rng.random_range(0..WORDS.len())]).collect();
            out.push_str(&words.join(" "));
            out.push_str("\n\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_changes_propagate_between_devices() {
        let harness = SyncTestHarness::new(3);
        let mut notes = NoteGenerator::new(7);
        let (a, b, c) = (harness.device_at(0), harness.device_at(1), harness.device_at(2));

        for i in 0..20 {
            a.write(&format!("notes/n{:02}.md", i), &notes.note(5), 1_700_000_000 + i);
        }
        assert_eq!(a.push().created, 20);
        assert_eq!(b.pull().created, 20);

        let edited = notes.note(8);
        b.write("notes/n03.md", &edited, 1_700_001_000);
        let pushed = b.push();
        assert_eq!(pushed.updated, 1);
        assert_eq!(pushed.skipped, 19);

        let pulled = a
            .sync
            .pull(&SyncOptions {
                changed_only: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pulled.updated, 1);
        assert_eq!(a.read("notes/n03.md").unwrap(), edited);

        c.pull();
        for i in 0..20 {
            let path = format!("notes/n{:02}.md", i);
            assert_eq!(c.read(&path), a.read(&path), "{}", path);
        }
        info!("store holds {} chunks", harness.store.chunk_count());
    }

    #[test]
    fn test_edit_uploads_only_changed_chunks() {
        let harness = SyncTestHarness::new(1);
        let device = harness.device_at(0);
        // Below 2560 bytes the chunk size parameters do not depend on length
        let body: String = (0..60).map(|i| format!("line {} of a long running journal\n", i)).collect();
        assert!(body.len() < 2400);
        device.write("journal.md", &body, 1_700_000_000);
        let first = device.push();
        let total_chunks = harness.store.chunk_count();
        assert!(total_chunks > 2);

        let edited = format!("{}one more line at the end\n", body);
        device.write("journal.md", &edited, 1_700_000_100);
        let second = device.push();
        assert_eq!(second.updated, 1);
        assert!(second.chunks_transferred < first.chunks_transferred);
        assert!(harness.store.chunk_count() < total_chunks * 2);
    }

    #[test]
    fn test_tombstones_delete_with_orphan_cleanup() {
        let harness = SyncTestHarness::new(2);
        let (a, b) = (harness.device_at(0), harness.device_at(1));
        a.write("notes/keep.md", "keep", 1_700_000_000);
        a.write("notes/drop.md", "drop", 1_700_000_000);
        a.push();
        b.pull();
        harness.tombstone("notes/drop.md");

        // A plain pull never recreates or deletes it
        let plain = b.pull();
        assert!(plain.orphans.is_empty());
        assert!(b.read("notes/drop.md").is_some());

        let cleaned = b
            .sync
            .pull(&SyncOptions {
                delete_orphans: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(cleaned.orphans, vec!["notes/drop.md".to_string()]);
        assert!(b.read("notes/drop.md").is_none());
        assert!(b.read("notes/keep.md").is_some());
        assert!(b.sync.index().get("notes/drop.md").is_none());
    }

    #[test]
    fn test_push_resurrects_tombstoned_path() {
        let harness = SyncTestHarness::new(1);
        let device = harness.device_at(0);
        device.write("notes/back.md", "first life", 1_700_000_000);
        device.push();
        harness.tombstone("notes/back.md");

        device.write("notes/back.md", "second life", 1_700_000_500);
        let summary = device.push();
        assert!(summary.is_success());
        let doc = harness.store.get_doc("notes/back.md").unwrap().unwrap();
        assert!(!doc.is_deleted());
        assert_eq!(doc.children, document_chunk_ids("second life"));
    }

    #[test]
    fn test_legacy_inline_documents_are_pulled() {
        let harness = SyncTestHarness::new(1);
        let mut doc = Document::new("old/inline.md");
        doc.data = Some("written by an old plugin".to_string());
        doc.mtime = 1_600_000_000_000;
        harness.store.insert_raw(doc);

        let device = harness.device_at(0);
        assert_eq!(device.pull().created, 1);
        assert_eq!(device.read("old/inline.md").unwrap(), "written by an old plugin");

        // Identical content is not pushed back
        let summary = device.push();
        assert_eq!(summary.transferred(), 0);
    }

    #[test]
    fn test_newer_local_copy_survives_changed_only_pull() {
        let harness = SyncTestHarness::new(2);
        let (a, b) = (harness.device_at(0), harness.device_at(1));
        a.write("notes/x.md", "remote version", 1_700_000_000);
        a.push();
        b.write("notes/x.md", "local newer version", 1_700_009_000);

        let summary = b
            .sync
            .pull(&SyncOptions {
                changed_only: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(summary.transferred(), 0);
        assert_eq!(b.read("notes/x.md").unwrap(), "local newer version");

        // Without --changed-only the pull is forced
        let forced = b.pull();
        assert_eq!(forced.updated, 1);
        assert_eq!(b.read("notes/x.md").unwrap(), "remote version");
    }

    #[test]
    #[traced_test]
    fn test_verify_and_repair_legacy_documents() {
        let harness = SyncTestHarness::new(1);
        let content = "legacy content ".repeat(200);
        harness.store.insert_raw_chunk(ChunkId::from_raw("h:+legacy-1"), &content[..1000]);
        harness.store.insert_raw_chunk(ChunkId::from_raw("h:+legacy-2"), &content[1000..]);
        let mut doc = Document::new("notes/legacy.md");
        doc.children = vec![ChunkId::from_raw("h:+legacy-1"), ChunkId::from_raw("h:+legacy-2")];
        doc.mtime = 1_650_000_000_000;
        harness.store.insert_raw(doc);

        let device = harness.device_at(0);
        let before = device.sync.verify(None, 0).unwrap();
        assert!(!before.is_valid());
        assert!(matches!(before.documents[0].status, DocumentStatus::ChunkIdMismatch { .. }));

        let dry = device.sync.repair(None, true).unwrap();
        assert_eq!(dry.repaired.len(), 1);
        assert!(!device.sync.verify(None, 0).unwrap().is_valid());

        let report = device.sync.repair(None, false).unwrap();
        assert!(report.is_success());
        assert_eq!(report.legacy_chunks_deleted, 2);
        assert!(device.sync.verify(None, 0).unwrap().is_valid());

        // Content is unchanged for everyone pulling afterwards
        device.pull();
        assert_eq!(device.read("notes/legacy.md").unwrap(), content);
    }
}
