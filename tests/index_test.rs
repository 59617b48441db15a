//! Index fallback and rebuild behavior

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ann, odyssey, StaticSource, TestVault};
use kohl::cache::CacheRegistry;
use kohl::fs::AtomicFs;
use kohl::index::{IndexState, IndexStore, RebuildPhase};
use kohl::{CancelToken, SystemClock};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupted_database_falls_back_to_memory() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(data_dir.join("index.db"), b"this is not a sqlite file").unwrap();

    let caches = CacheRegistry::new();
    let fs = Arc::new(AtomicFs::new(&caches));
    let index = IndexStore::open(&data_dir, fs, Arc::new(SystemClock)).await;

    assert_eq!(index.state(), IndexState::InMemory);

    // Queries answer empty without erroring.
    assert!(index.find_instances("any::key").await.unwrap().is_empty());
    assert!(index.get_source_record("/sd/x").await.unwrap().is_none());

    // Writes still land in the memory database.
    index
        .upsert_instance(
            &kohl::model::BookRow {
                key: "homer::the odyssey".into(),
                title: "The Odyssey".into(),
                authors: "Homer".into(),
            },
            "note.md",
        )
        .await
        .unwrap();
    assert_eq!(
        index.find_instances("homer::the odyssey").await.unwrap().len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engine_recovers_via_background_rebuild() {
    let vault = TestVault::new();
    let cancel = CancelToken::new();

    // A first healthy run creates one note.
    let source = StaticSource::new(vec![vault.source_book(
        odyssey(),
        vec![ann(1, "first"), ann(2, "second")],
        1000,
    )]);
    {
        let engine = vault.engine().await;
        engine.import_all(&source, &cancel, None).await.unwrap();
        engine.shutdown().await.unwrap();
    }

    // Corrupt the database; the next engine must fall back and rebuild
    // book/instance rows from the notes on disk.
    std::fs::write(vault.data_dir.join("index.db"), b"garbage").unwrap();
    let engine = vault.engine().await;
    let mut waited = Duration::ZERO;
    loop {
        let status = engine.status().await.unwrap();
        if status.rebuild_phase == RebuildPhase::Complete {
            break;
        }
        assert!(
            waited < Duration::from_secs(10),
            "rebuild did not complete, phase {:?}",
            status.rebuild_phase
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }

    let status = engine.status().await.unwrap();
    assert_eq!(status.index_state, IndexState::InMemory);
    assert_eq!(status.books, 1);
    assert_eq!(status.note_instances, 1);

    // Re-import finds the rebuilt instance: a merge/skip, never a duplicate
    // note creation.
    let summary = engine.import_all(&source, &cancel, None).await.unwrap();
    assert_eq!(summary.created, 0);

    let notes: Vec<_> = std::fs::read_dir(&vault.managed)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "md"))
        .collect();
    assert_eq!(notes.len(), 1, "no duplicate note after fallback");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn force_recheck_restores_persistent_state() {
    let vault = TestVault::new();
    std::fs::create_dir_all(&vault.data_dir).unwrap();
    std::fs::write(vault.data_dir.join("index.db"), b"garbage").unwrap();

    let engine = vault.engine().await;
    assert_eq!(engine.status().await.unwrap().index_state, IndexState::InMemory);

    // Operator fixed the file (deleted it); recheck should reopen fresh.
    std::fs::remove_file(vault.data_dir.join("index.db")).unwrap();
    assert!(engine.force_recheck_capabilities().await);
    assert_eq!(
        engine.status().await.unwrap().index_state,
        IndexState::Persistent
    );
}
