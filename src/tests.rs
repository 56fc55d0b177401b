//! End-to-end scenarios against an in-memory store
//!
//! Each test drives whole pull/push runs through [`VaultSync`] with one or
//! two vault directories sharing a [`MemoryStore`].

#[cfg(test)]
mod scenario_tests {
    use crate::chunking::document_chunk_ids;
    use crate::*;
    use filetime::FileTime;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn engine(vault: &Path, store: &Arc<MemoryStore>) -> VaultSync {
        let config = SyncConfig::new(
            vault.to_path_buf(),
            StoreConfig::new("http://localhost:5984", "test", "admin", "secret"),
        );
        VaultSyncBuilder::new(config)
            .store(store.clone())
            .max_workers(4)
            .build()
            .unwrap()
    }

    fn write(vault: &Path, path: &str, content: &str, mtime_secs: i64) {
        let abs = vault.join(path);
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(&abs, content).unwrap();
        filetime::set_file_mtime(&abs, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
    }

    fn mtime_ms(path: &Path) -> i64 {
        let meta = fs::metadata(path).unwrap();
        FileTime::from_last_modification_time(&meta).unix_seconds() * 1000
    }

    #[test]
    fn test_push_then_pull_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let content = "# Title\n\n".to_string() + &"a paragraph of text. ".repeat(300);
        write(a.path(), "Notes/daily/2024-01-01.md", &content, 1_700_000_000);

        let pushed = engine(a.path(), &store).push(&SyncOptions::default()).unwrap();
        assert_eq!(pushed.created, 1);
        assert!(pushed.is_success());

        let pulled = engine(b.path(), &store).pull(&SyncOptions::default()).unwrap();
        assert_eq!(pulled.created, 1);
        let dest = b.path().join("Notes/daily/2024-01-01.md");
        assert_eq!(fs::read_to_string(&dest).unwrap(), content);
        assert_eq!(mtime_ms(&dest), 1_700_000_000_000);

        let doc = store.get_doc("Notes/daily/2024-01-01.md").unwrap().unwrap();
        assert_eq!(doc.children, document_chunk_ids(&content));
    }

    #[test]
    fn test_second_push_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        write(vault.path(), "Notes/a.md", &"some note\n".repeat(200), 1_700_000_000);
        write(vault.path(), "Notes/b.md", "short", 1_700_000_100);

        let sync = engine(vault.path(), &store);
        sync.push(&SyncOptions::default()).unwrap();
        let before = store.counters();

        let again = sync.push(&SyncOptions::default()).unwrap();
        assert_eq!(again.transferred(), 0);
        assert_eq!(again.skipped, 2);
        let after = store.counters();
        assert_eq!(after.doc_puts, before.doc_puts);
        assert_eq!(after.chunk_puts, before.chunk_puts);

        // A fresh engine without baselines compares content instead
        let fresh = TempDir::new().unwrap();
        let config = SyncConfig::new(
            vault.path().to_path_buf(),
            StoreConfig::new("http://localhost:5984", "test", "admin", "secret"),
        );
        let cold = VaultSyncBuilder::new(config)
            .store(store.clone())
            .state_dir(fresh.path().to_path_buf())
            .build()
            .unwrap();
        let third = cold.push(&SyncOptions::default()).unwrap();
        assert_eq!(third.transferred(), 0);
        assert_eq!(store.counters().doc_puts, before.doc_puts);
    }

    #[test]
    fn test_orphans_dry_run_then_delete() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        write(vault.path(), "Notes/kept.md", "kept", 1_700_000_000);
        let sync = engine(vault.path(), &store);
        sync.push(&SyncOptions::default()).unwrap();
        write(vault.path(), "Notes/stale/orphan.md", "orphan", 1_700_000_000);

        let dry = sync
            .pull(&SyncOptions {
                delete_orphans: true,
                dry_run: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(dry.orphans, vec!["Notes/stale/orphan.md".to_string()]);
        assert!(vault.path().join("Notes/stale/orphan.md").exists());

        let real = sync
            .pull(&SyncOptions {
                delete_orphans: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(real.orphans, vec!["Notes/stale/orphan.md".to_string()]);
        assert!(!vault.path().join("Notes/stale").exists());
        assert!(vault.path().join("Notes/kept.md").exists());
    }

    fn unreadable(path: &str) -> Document {
        let raw = serde_json::json!({"_id": path, "path": path, "children": ["h:1"], "size": 12.5});
        Document::unreadable(path, &raw, "invalid type: floating point `12.5`, expected u64")
    }

    #[test]
    fn test_unreadable_record_protects_local_file() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        write(vault.path(), "Notes/kept.md", "kept", 1_700_000_000);
        let sync = engine(vault.path(), &store);
        sync.push(&SyncOptions::default()).unwrap();
        store.insert_raw(unreadable("Notes/odd.md"));
        write(vault.path(), "Notes/odd.md", "local text", 1_700_000_000);

        let pulled = sync
            .pull(&SyncOptions {
                delete_orphans: true,
                ..Default::default()
            })
            .unwrap();
        assert!(pulled.orphans.is_empty());
        assert_eq!(fs::read_to_string(vault.path().join("Notes/odd.md")).unwrap(), "local text");
        assert_eq!(pulled.errored.len(), 1);
        assert_eq!(pulled.errored[0].path, "Notes/odd.md");
    }

    #[test]
    fn test_malformed_record_does_not_stop_push() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        write(vault.path(), "Notes/a.md", "first", 1_700_000_000);
        write(vault.path(), "Notes/b.md", "second", 1_700_000_000);
        store.insert_raw(unreadable("Notes/a.md"));

        let pushed = engine(vault.path(), &store).push(&SyncOptions::default()).unwrap();
        assert_eq!(pushed.created, 1);
        assert_eq!(pushed.errored.len(), 1);
        assert_eq!(pushed.errored[0].path, "Notes/a.md");
        assert!(store.get_doc("Notes/b.md").unwrap().is_some());
        assert!(store.get_doc("Notes/a.md").is_err());
    }

    #[test]
    fn test_conflict_is_isolated() {
        let store = Arc::new(MemoryStore::new());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write(a.path(), "Notes/shared.md", "original", 1_700_000_000);
        let sync_a = engine(a.path(), &store);
        sync_a.push(&SyncOptions::default()).unwrap();
        let sync_b = engine(b.path(), &store);
        sync_b.pull(&SyncOptions::default()).unwrap();

        write(a.path(), "Notes/shared.md", "edited on a", 1_700_000_100);
        sync_a.push(&SyncOptions::default()).unwrap();

        write(b.path(), "Notes/shared.md", "edited on b", 1_700_000_200);
        write(b.path(), "Notes/new.md", "unrelated", 1_700_000_200);
        let summary = sync_b.push(&SyncOptions::default()).unwrap();

        assert_eq!(summary.conflicted, vec!["Notes/shared.md".to_string()]);
        assert_eq!(summary.created, 1);
        assert!(!summary.is_success());
        assert_eq!(
            fs::read_to_string(b.path().join("Notes/shared.md")).unwrap(),
            "edited on b"
        );
        let remote = store.get_doc("Notes/shared.md").unwrap().unwrap();
        assert_eq!(remote.children, document_chunk_ids("edited on a"));
        assert!(store.get_doc("Notes/new.md").unwrap().is_some());

        // Forcing does not override a conflict either
        let forced = sync_b
            .push(&SyncOptions {
                force: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(forced.conflicted, vec!["Notes/shared.md".to_string()]);
    }

    #[test]
    fn test_matching_copy_becomes_baseline() {
        let store = Arc::new(MemoryStore::new());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write(a.path(), "Notes/plan.md", "v1", 1_700_000_000);
        let sync_a = engine(a.path(), &store);
        sync_a.push(&SyncOptions::default()).unwrap();

        // Same content already on disk, never synced from this vault
        write(b.path(), "Notes/plan.md", "v1", 1_700_000_050);
        let sync_b = engine(b.path(), &store);
        let first = sync_b.pull(&SyncOptions::default()).unwrap();
        assert_eq!(first.skipped, 1);
        assert!(sync_b.index().get("Notes/plan.md").is_some());

        write(a.path(), "Notes/plan.md", "v2 from device A", 1_700_000_100);
        sync_a.push(&SyncOptions::default()).unwrap();
        write(b.path(), "Notes/plan.md", "v2 from device B", 1_700_000_200);

        let second = sync_b.pull(&SyncOptions::default()).unwrap();
        assert_eq!(second.conflicted, vec!["Notes/plan.md".to_string()]);
        assert_eq!(second.updated, 0);
        assert_eq!(
            fs::read_to_string(b.path().join("Notes/plan.md")).unwrap(),
            "v2 from device B"
        );
    }

    #[test]
    fn test_dry_run_records_no_baseline() {
        let store = Arc::new(MemoryStore::new());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write(a.path(), "Notes/plan.md", "same", 1_700_000_000);
        engine(a.path(), &store).push(&SyncOptions::default()).unwrap();
        write(b.path(), "Notes/plan.md", "same", 1_700_000_000);

        let sync_b = engine(b.path(), &store);
        sync_b
            .pull(&SyncOptions {
                dry_run: true,
                ..Default::default()
            })
            .unwrap();
        assert!(sync_b.index().is_empty());
    }

    #[test]
    fn test_identical_files_share_chunks() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        let content = "identical body line\n".repeat(500);
        write(vault.path(), "Notes/one.md", &content, 1_700_000_000);
        write(vault.path(), "Notes/two.md", &content, 1_700_000_000);

        let summary = engine(vault.path(), &store).push(&SyncOptions::default()).unwrap();
        assert_eq!(summary.created, 2);
        let unique: std::collections::HashSet<_> = document_chunk_ids(&content).into_iter().collect();
        assert_eq!(store.chunk_count(), unique.len());
    }

    #[test]
    fn test_dry_run_push_mutates_nothing() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        write(vault.path(), "Notes/a.md", "draft", 1_700_000_000);
        let sync = engine(vault.path(), &store);

        let summary = sync
            .push(&SyncOptions {
                dry_run: true,
                ..Default::default()
            })
            .unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.chunks_transferred, 1);
        assert_eq!(store.counters().doc_puts, 0);
        assert_eq!(store.chunk_count(), 0);
        assert!(sync.index().is_empty());
        assert!(!vault.path().join(".vaultsync").exists());
    }

    #[test]
    fn test_unreachable_store_aborts_run() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        write(vault.path(), "Notes/a.md", "text", 1_700_000_000);
        let sync = engine(vault.path(), &store);
        store.set_offline(true);

        let err = sync.push(&SyncOptions::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_prefix_limits_the_run() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        write(vault.path(), "Notes/inbox/a.md", "a", 1_700_000_000);
        write(vault.path(), "Notes/archive/b.md", "b", 1_700_000_000);
        write(vault.path(), "Private/c.md", "c", 1_700_000_000);

        let sync = engine(vault.path(), &store);
        let summary = sync
            .push(&SyncOptions {
                path_prefix: Some("Notes/inbox".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(summary.total, 1);
        assert!(store.get_doc("Notes/inbox/a.md").unwrap().is_some());
        assert!(store.get_doc("Notes/archive/b.md").unwrap().is_none());

        // Outside the sync directories even without a prefix
        sync.push(&SyncOptions::default()).unwrap();
        assert!(store.get_doc("Private/c.md").unwrap().is_none());
    }

    #[test]
    #[traced_test]
    fn test_conflicts_are_logged() {
        let store = Arc::new(MemoryStore::new());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write(a.path(), "Notes/log.md", "v1", 1_700_000_000);
        let sync_a = engine(a.path(), &store);
        sync_a.push(&SyncOptions::default()).unwrap();
        let sync_b = engine(b.path(), &store);
        sync_b.pull(&SyncOptions::default()).unwrap();

        write(a.path(), "Notes/log.md", "v2 from a", 1_700_000_100);
        sync_a.push(&SyncOptions::default()).unwrap();
        write(b.path(), "Notes/log.md", "v2 from b", 1_700_000_200);
        sync_b.push(&SyncOptions::default()).unwrap();
        assert!(logs_contain("Conflict on Notes/log.md"));
        assert!(logs_contain("push done"));
    }
}
