//! Property-based tests
//!
//! Chunking invariants over arbitrary input, and whole-vault round trips
//! over randomly generated trees.

use ::vaultsync::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Slash-separated vault paths below one top-level directory
fn path_strategy() -> impl Strategy<Value = String> {
    let dirs = prop::collection::vec("[a-z]{1,8}", 0..=3);
    let name = prop_oneof!["[a-z]{1,8}\\.md", "note[0-9]{1,3}\\.md", "[A-Z0-9][a-z0-9 ]{0,10}[a-z]\\.txt"];
    (dirs, name).prop_map(|(dirs, name)| {
        let mut parts = vec!["vault".to_string()];
        parts.extend(dirs);
        parts.push(name);
        parts.join("/")
    })
}

/// Text content, including multi-byte characters and long runs
fn content_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z0-9 \n]{0,1000}",
        "[가-힣a-z \n]{0,600}",
        (any::<char>(), 1..4000usize).prop_map(|(c, n)| c.to_string().repeat(n)),
        prop::collection::vec("[a-z ]{0,80}\n", 0..300).prop_map(|lines| lines.concat()),
    ]
}

/// Files of a vault keyed by relative path
fn snapshot(root: &Path) -> BTreeMap<String, String> {
    WalkDir::new(root.join("vault"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            (rel, fs::read_to_string(e.path()).unwrap())
        })
        .collect()
}

fn engine(root: &Path, store: &Arc<MemoryStore>) -> VaultSync {
    let config = SyncConfig::new(
        root.to_path_buf(),
        StoreConfig::new("http://localhost:5984", "property", "admin", "secret"),
    );
    VaultSyncBuilder::new(config)
        .store(store.clone())
        .sync_directories(vec!["vault".to_string()])
        .max_workers(2)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Chunks cover the input exactly and respect the size limits
    #[test]
    fn chunks_cover_text(text in content_strategy()) {
        let params = ChunkParams::for_text(text.len());
        let chunked = chunk_document(&text);
        prop_assert_eq!(chunked.chunks.concat(), text.clone());
        for (i, chunk) in chunked.chunks.iter().enumerate() {
            prop_assert!(!chunk.is_empty());
            // A cut may move past the limit to finish a UTF-8 sequence
            prop_assert!(chunk.len() <= params.max_chunk_size + 3);
            if i + 1 < chunked.chunks.len() {
                prop_assert!(chunk.len() >= params.min_chunk_size);
            }
        }
        prop_assert_eq!(chunked.ids.len(), chunked.chunks.len());
    }

    /// Explicit parameters behave the same on arbitrary bytes
    #[test]
    fn chunks_cover_bytes(data in prop::collection::vec(any::<u8>(), 0..5000), min in 1usize..64, extra in 0usize..256) {
        let max = min + extra;
        let chunker = RollingChunker::new(ChunkParams::new(min, max, 64).unwrap());
        let chunks = chunker.chunk(&data);
        prop_assert_eq!(chunks.concat(), data);
    }

    /// Ids depend on the bytes and nothing else
    #[test]
    fn ids_are_content_addressed(a in "[a-z]{0,64}", b in "[a-z]{0,64}") {
        prop_assert_eq!(ChunkId::of(a.as_bytes()), ChunkId::of(a.clone().as_bytes()));
        prop_assert_eq!(ChunkId::of(a.as_bytes()) == ChunkId::of(b.as_bytes()), a == b);
        prop_assert!(ChunkId::of(a.as_bytes()).as_str().starts_with("h:"));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Push from one vault then pull into another reproduces the tree,
    /// and a second push changes nothing
    #[test]
    fn push_pull_reproduces_tree(files in prop::collection::btree_map(path_strategy(), content_strategy(), 1..12)) {
        let store = Arc::new(MemoryStore::new());
        let source = TempDir::new().unwrap();
        for (path, content) in &files {
            let abs = source.path().join(path);
            fs::create_dir_all(abs.parent().unwrap()).unwrap();
            fs::write(&abs, content).unwrap();
        }
        let expected = snapshot(source.path());
        prop_assert_eq!(expected.len(), files.len());

        let sync = engine(source.path(), &store);
        let pushed = sync.push(&SyncOptions::default()).unwrap();
        prop_assert!(pushed.is_success());
        prop_assert_eq!(pushed.created, expected.len());

        let before = store.counters();
        let again = sync.push(&SyncOptions::default()).unwrap();
        prop_assert_eq!(again.transferred(), 0);
        prop_assert_eq!(store.counters().doc_puts, before.doc_puts);
        prop_assert_eq!(store.counters().chunk_puts, before.chunk_puts);

        let target = TempDir::new().unwrap();
        let pulled = engine(target.path(), &store).pull(&SyncOptions::default()).unwrap();
        prop_assert!(pulled.is_success());
        prop_assert_eq!(snapshot(target.path()), expected);
    }
}
