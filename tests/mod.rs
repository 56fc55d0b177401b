//! Test suites for vaultsync
//!
//! - Integration tests for multi-device scenarios
//! - Chaos tests for concurrent writers and failing stores
//! - Property-based tests for chunking and sync invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::vaultsync::*;
    use filetime::FileTime;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(vault: &TempDir, store: &Arc<MemoryStore>) -> VaultSync {
        let config = SyncConfig::new(
            vault.path().to_path_buf(),
            StoreConfig::new("http://localhost:5984", "edge", "admin", "secret"),
        );
        VaultSyncBuilder::new(config)
            .store(store.clone())
            .sync_directories(Vec::new())
            .build()
            .unwrap()
    }

    fn write(vault: &TempDir, path: &str, content: &str) {
        let abs = vault.path().join(path);
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(&abs, content).unwrap();
        filetime::set_file_mtime(&abs, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
    }

    #[test]
    fn test_empty_vault() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        let sync = engine(&vault, &store);

        let pushed = sync.push(&SyncOptions::default()).unwrap();
        assert_eq!(pushed.total, 0);
        assert!(pushed.is_success());
        let pulled = sync.pull(&SyncOptions::default()).unwrap();
        assert_eq!(pulled.total, 0);
    }

    #[test]
    fn test_empty_file_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write(&a, "notes/empty.md", "");

        engine(&a, &store).push(&SyncOptions::default()).unwrap();
        let doc = store.get_doc("notes/empty.md").unwrap().unwrap();
        assert!(doc.children.is_empty());

        engine(&b, &store).pull(&SyncOptions::default()).unwrap();
        assert_eq!(fs::read_to_string(b.path().join("notes/empty.md")).unwrap(), "");
    }

    #[test]
    fn test_underscore_paths_get_prefixed_ids() {
        let store = Arc::new(MemoryStore::new());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write(&a, "_inbox/idea.md", "an idea");

        engine(&a, &store).push(&SyncOptions::default()).unwrap();
        let doc = store.get_doc("_inbox/idea.md").unwrap().unwrap();
        assert_eq!(doc.id, "/_inbox/idea.md");
        assert_eq!(doc.vault_path(), "_inbox/idea.md");

        engine(&b, &store).pull(&SyncOptions::default()).unwrap();
        assert_eq!(fs::read_to_string(b.path().join("_inbox/idea.md")).unwrap(), "an idea");
    }

    #[test]
    fn test_unicode_paths_and_content() {
        let store = Arc::new(MemoryStore::new());
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let names = ["메모/회의록.md", "заметки/план.md", "notes/🚀 launch.md"];
        let mut written = Vec::new();
        for name in names {
            let abs = a.path().join(name);
            if fs::create_dir_all(abs.parent().unwrap()).is_err() || fs::write(&abs, format!("본문 {}", name)).is_err() {
                continue;
            }
            written.push(name);
        }
        if written.is_empty() {
            return;
        }

        engine(&a, &store).push(&SyncOptions::default()).unwrap();
        engine(&b, &store).pull(&SyncOptions::default()).unwrap();
        for name in written {
            assert_eq!(fs::read_to_string(b.path().join(name)).unwrap(), format!("본문 {}", name));
        }
    }

    #[test]
    fn test_binary_file_is_a_path_error() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        let abs = vault.path().join("notes/image.png");
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(&abs, [0xff, 0xd8, 0xff, 0x00, 0x80]).unwrap();
        write(&vault, "notes/text.md", "text");

        let summary = engine(&vault, &store).push(&SyncOptions::default()).unwrap();
        assert_eq!(summary.errored.len(), 1);
        assert_eq!(summary.errored[0].path, "notes/image.png");
        assert_eq!(summary.created, 1);
    }

    #[test]
    fn test_excluded_directories_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let vault = TempDir::new().unwrap();
        write(&vault, ".obsidian/workspace.json", "{}");
        write(&vault, "notes/.git/HEAD", "ref: refs/heads/main");
        write(&vault, "notes/real.md", "real");

        let summary = engine(&vault, &store).push(&SyncOptions::default()).unwrap();
        assert_eq!(summary.created, 1);
        let paths: Vec<String> = store
            .list_docs(None)
            .unwrap()
            .iter()
            .map(|d| d.vault_path().to_string())
            .collect();
        assert_eq!(paths, vec!["notes/real.md".to_string()]);
    }
}
