//! Chaos tests
//!
//! Concurrent writers, lost races, unreachable stores and damaged state.
//! Whatever happens, a run must either finish with per-path results or
//! stop with a fatal error, and never leave a half-written document.

use ::vaultsync::*;
use filetime::FileTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use tracing::{info, warn};

fn engine(vault: &Path, store: Arc<MemoryStore>) -> VaultSync {
    let config = SyncConfig::new(
        vault.to_path_buf(),
        StoreConfig::new("http://localhost:5984", "chaos", "admin", "secret"),
    );
    VaultSyncBuilder::new(config)
        .store(store)
        .sync_directories(Vec::new())
        .max_workers(3)
        .build()
        .unwrap()
}

fn write(vault: &Path, path: &str, content: &str, mtime_secs: i64) {
    let abs = vault.join(path);
    fs::create_dir_all(abs.parent().unwrap()).unwrap();
    fs::write(&abs, content).unwrap();
    filetime::set_file_mtime(&abs, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_revision_churn_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        let sync = engine(vault.path(), store.clone());
        write(vault.path(), "notes/a.md", "v1", 1_700_000_000);
        sync.push(&SyncOptions::default()).unwrap();

        write(vault.path(), "notes/a.md", "v2", 1_700_000_100);
        store.inject_conflicts("notes/a.md", 2);
        let summary = sync.push(&SyncOptions::default()).unwrap();
        assert!(summary.is_success(), "{:?}", summary.conflicted);
        assert_eq!(summary.updated, 1);

        let doc = store.get_doc("notes/a.md").unwrap().unwrap();
        assert_eq!(doc.children, document_chunk_ids("v2"));
        assert_eq!(sync.index().get("notes/a.md").unwrap().revision, doc.revision.unwrap());
    }

    #[test]
    fn test_endless_churn_becomes_conflict() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        let sync = engine(vault.path(), store.clone());
        write(vault.path(), "notes/a.md", "v1", 1_700_000_000);
        write(vault.path(), "notes/b.md", "other", 1_700_000_000);
        sync.push(&SyncOptions::default()).unwrap();

        write(vault.path(), "notes/a.md", "v2", 1_700_000_100);
        write(vault.path(), "notes/b.md", "other v2", 1_700_000_100);
        store.inject_conflicts("notes/a.md", 10);
        let summary = sync.push(&SyncOptions::default()).unwrap();
        assert_eq!(summary.conflicted, vec!["notes/a.md".to_string()]);
        assert_eq!(summary.updated, 1);

        // The conflicted document keeps its old content
        let doc = store.get_doc("notes/a.md").unwrap().unwrap();
        assert_eq!(doc.children, document_chunk_ids("v1"));
    }

    #[test]
    fn test_parallel_devices_on_disjoint_paths() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..4)
            .map(|device| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(device);
                    let vault = TempDir::new().unwrap();
                    for i in 0..10 {
                        let len = rng.random_range(1..2000);
                        let body: String = (0..len).map(|_| rng.random_range(b'a'..=b'z') as char).collect();
                        write(vault.path(), &format!("d{}/n{}.md", device, i), &body, 1_700_000_000);
                    }
                    let summary = engine(vault.path(), store).push(&SyncOptions::default()).unwrap();
                    assert!(summary.is_success());
                    assert_eq!(summary.created, 10);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reader = TempDir::new().unwrap();
        let summary = engine(reader.path(), store.clone()).pull(&SyncOptions::default()).unwrap();
        assert_eq!(summary.created, 40);
        assert!(summary.is_success());
    }

    #[test]
    fn test_racing_identical_pushes() {
        let store = Arc::new(MemoryStore::new());
        let content = "the same text typed on two machines\n".repeat(50);
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let content = content.clone();
                thread::spawn(move || {
                    let vault = TempDir::new().unwrap();
                    write(vault.path(), "notes/same.md", &content, 1_700_000_000);
                    engine(vault.path(), store).push(&SyncOptions::default()).unwrap()
                })
            })
            .collect();

        for handle in handles {
            let summary = handle.join().unwrap();
            assert!(summary.is_success(), "{:?}", summary.conflicted);
        }
        let doc = store.get_doc("notes/same.md").unwrap().unwrap();
        assert_eq!(doc.children, document_chunk_ids(&content));
    }

    #[test]
    fn test_offline_store_stops_run_and_recovers() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        write(vault.path(), "notes/a.md", "text", 1_700_000_000);
        let sync = engine(vault.path(), store.clone());

        store.set_offline(true);
        let err = sync.push(&SyncOptions::default()).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.user_message().contains("COUCHDB_URI"));
        assert!(sync.index().is_empty());

        store.set_offline(false);
        let summary = sync.push(&SyncOptions::default()).unwrap();
        assert_eq!(summary.created, 1);
    }

    #[test]
    #[traced_test]
    fn test_missing_chunk_is_isolated() {
        let store = Arc::new(MemoryStore::new());
        let a = TempDir::new().unwrap();
        write(a.path(), "notes/good.md", "fine", 1_700_000_000);
        write(a.path(), "notes/bad.md", "damaged soon", 1_700_000_000);
        engine(a.path(), store.clone()).push(&SyncOptions::default()).unwrap();

        let bad = store.get_doc("notes/bad.md").unwrap().unwrap();
        assert!(store.delete_chunk(&bad.children[0]).unwrap());

        let b = TempDir::new().unwrap();
        let summary = engine(b.path(), store.clone()).pull(&SyncOptions::default()).unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.errored.len(), 1);
        assert_eq!(summary.errored[0].path, "notes/bad.md");
        assert!(!b.path().join("notes/bad.md").exists());
        assert!(b.path().join("notes/good.md").exists());
        warn!("corrupt document reported: {}", summary.errored[0].message);
    }

    #[test]
    fn test_damaged_index_starts_fresh() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        write(vault.path(), "notes/a.md", "content", 1_700_000_000);
        engine(vault.path(), store.clone()).push(&SyncOptions::default()).unwrap();

        let index_file = vault.path().join(".vaultsync").join("sync-index.bin");
        assert!(index_file.exists());
        fs::write(&index_file, b"\x00\xffnot an index").unwrap();

        let sync = engine(vault.path(), store.clone());
        assert!(sync.index().is_empty());
        let before = store.counters();
        let summary = sync.push(&SyncOptions::default()).unwrap();
        assert_eq!(summary.transferred(), 0);
        assert_eq!(store.counters().doc_puts, before.doc_puts);
        assert!(sync.index().get("notes/a.md").is_some());
    }

    #[test]
    fn test_random_edit_sequences_converge() {
        let store = Arc::new(MemoryStore::new());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let sync_a = engine(a.path(), store.clone());
        let sync_b = engine(b.path(), store.clone());
        let mut rng = StdRng::seed_from_u64(42);
        let mut clock = 1_700_000_000;

        for round in 0..15 {
            clock += 10;
            let path = format!("notes/f{}.md", rng.random_range(0..5));
            let body = format!("round {} {}", round, "x".repeat(rng.random_range(0..3000)));
            // Alternate writers, always syncing in between
            let (writer, sync_w, sync_r) = if round % 2 == 0 {
                (a.path(), &sync_a, &sync_b)
            } else {
                (b.path(), &sync_b, &sync_a)
            };
            sync_w.pull(&SyncOptions::default()).unwrap();
            write(writer, &path, &body, clock);
            let pushed = sync_w.push(&SyncOptions::default()).unwrap();
            assert!(pushed.is_success(), "round {}: {:?}", round, pushed.conflicted);
            sync_r.pull(&SyncOptions::default()).unwrap();
        }

        for i in 0..5 {
            let path = format!("notes/f{}.md", i);
            let left = fs::read_to_string(a.path().join(&path)).ok();
            let right = fs::read_to_string(b.path().join(&path)).ok();
            assert_eq!(left, right, "{}", path);
        }
        info!("converged with {} chunks", store.chunk_count());
    }
}
