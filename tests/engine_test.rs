//! End-to-end import scenarios against a real tempdir vault

mod common;

use std::sync::Arc;

use common::{ann, odyssey, StaticSource, TestVault};
use kohl::index::IndexStore;
use kohl::{BookOutcome, CancelToken, Settings, SystemClock};

async fn open_index_for_inspection(vault: &TestVault) -> Arc<IndexStore> {
    let caches = kohl::cache::CacheRegistry::new();
    let fs = Arc::new(kohl::fs::AtomicFs::new(&caches));
    IndexStore::open(&vault.data_dir, fs, Arc::new(SystemClock)).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_1_fresh_import() {
    let vault = TestVault::new();
    let engine = vault.engine().await;
    let cancel = CancelToken::new();

    let annotations = vec![ann(1, "first"), ann(2, "second"), ann(3, "third")];
    let ids: Vec<String> = annotations.iter().map(|a| a.id()).collect();
    let source = StaticSource::new(vec![vault.source_book(odyssey(), annotations, 1000)]);

    let summary = engine.import_all(&source, &cancel, None).await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.failed, 0);

    // One note at the expected path, with front-matter and tracking
    // comments for all three annotations.
    let note_path = vault.managed.join("The Odyssey - Homer.md");
    let text = std::fs::read_to_string(&note_path).unwrap();
    assert!(text.starts_with("---\ntitle: The Odyssey\nauthors: Homer\n"));
    for id in &ids {
        assert!(text.contains(&format!("<!-- kohl-id: {id} -->")));
    }

    // kohl-uid present and snapshotted.
    let uid_line = text
        .lines()
        .find(|l| l.starts_with("kohl-uid: "))
        .expect("uid in front-matter");
    let uid = uid_line.trim_start_matches("kohl-uid: ");
    assert_eq!(uid.len(), 16);
    let snapshot = std::fs::read_to_string(vault.data_dir.join("snapshots").join(uid)).unwrap();
    assert_eq!(snapshot, text);

    // Index rows: one book, one instance, one source with a success mark.
    let status = engine.status().await.unwrap();
    assert_eq!(
        (status.books, status.note_instances, status.import_sources),
        (1, 1, 1)
    );
    engine.shutdown().await.unwrap();

    let index = open_index_for_inspection(&vault).await;
    let record = index
        .get_source_record(
            &vault
                .dir
                .path()
                .join("device/odyssey.sdr/metadata.epub.lua")
                .to_string_lossy(),
        )
        .await
        .unwrap()
        .expect("source record");
    assert!(record.last_success_ts.is_some());
    assert!(record.last_error.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_2_unchanged_reimport_skips() {
    let vault = TestVault::new();
    let engine = vault.engine().await;
    let cancel = CancelToken::new();

    let annotations = vec![ann(1, "first"), ann(2, "second"), ann(3, "third")];
    let source = StaticSource::new(vec![vault.source_book(odyssey(), annotations, 1000)]);

    let first = engine.import_all(&source, &cancel, None).await.unwrap();
    assert_eq!(first.created, 1);

    let note_path = vault.managed.join("The Odyssey - Homer.md");
    let before = std::fs::read_to_string(&note_path).unwrap();

    let second = engine.import_all(&source, &cancel, None).await.unwrap();
    assert_eq!(second.skipped, 1);
    assert_eq!(second.created + second.merged + second.auto_merged, 0);

    // No note bytes changed on the second run.
    assert_eq!(std::fs::read_to_string(&note_path).unwrap(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_3_additive_reimport_auto_merges() {
    let vault = TestVault::new();
    let engine = vault.engine().await;
    let cancel = CancelToken::new();

    let a = vec![ann(1, "first"), ann(2, "second"), ann(3, "third")];
    let source = StaticSource::new(vec![vault.source_book(odyssey(), a.clone(), 1000)]);
    engine.import_all(&source, &cancel, None).await.unwrap();

    // Source grows one annotation.
    let a4 = ann(4, "fourth");
    let mut grown = a.clone();
    grown.push(a4.clone());
    source.set_books(vec![vault.source_book(odyssey(), grown, 2000)]);

    let summary = engine.import_all(&source, &cancel, None).await.unwrap();
    assert_eq!(summary.auto_merged, 1, "subset extension auto-merges");

    let note_path = vault.managed.join("The Odyssey - Homer.md");
    let text = std::fs::read_to_string(&note_path).unwrap();
    for annotation in [&a[0], &a[1], &a[2], &a4] {
        assert!(text.contains(&annotation.id()));
    }
    assert!(!text.contains("conflicts:"));

    // The snapshot advanced with the merge.
    let uid = text
        .lines()
        .find(|l| l.starts_with("kohl-uid: "))
        .unwrap()
        .trim_start_matches("kohl-uid: ");
    let snapshot = std::fs::read_to_string(vault.data_dir.join("snapshots").join(uid)).unwrap();
    assert_eq!(snapshot, text);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_4_divergent_merge_preserves_user_edits() {
    let vault = TestVault::new();
    let engine = vault.engine().await;
    let cancel = CancelToken::new();

    let a1 = ann(1, "first");
    let a2 = ann(2, "second");
    let a3 = ann(3, "third");
    let source = StaticSource::new(vec![vault.source_book(
        odyssey(),
        vec![a1.clone(), a2.clone(), a3.clone()],
        1000,
    )]);
    engine.import_all(&source, &cancel, None).await.unwrap();

    // User writes a paragraph right under the second highlight.
    let note_path = vault.managed.join("The Odyssey - Homer.md");
    let text = std::fs::read_to_string(&note_path).unwrap();
    let edited = text.replace("> second\n", "> second\nWhat a line this is.\n");
    std::fs::write(&note_path, &edited).unwrap();

    // Source rewrote the second highlight: new text, new annotation id.
    let a2_new = ann(2, "second, revised in this edition");
    source.set_books(vec![vault.source_book(
        odyssey(),
        vec![a1.clone(), a2_new.clone(), a3.clone()],
        2000,
    )]);

    let summary = engine.import_all(&source, &cancel, None).await.unwrap();
    assert_eq!(summary.merged, 1);

    let merged = std::fs::read_to_string(&note_path).unwrap();
    assert!(merged.contains("What a line this is."), "user edit kept");
    assert!(merged.contains(&a2.id()), "local highlight kept");
    assert!(merged.contains(&a2_new.id()), "incoming rewrite added");
    assert!(!merged.contains("<<<<<<<"), "no conflict markers");
    assert!(!merged.contains("conflicts:"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_5_true_conflict_renders_sentinels() {
    let vault = TestVault::new();
    let engine = vault.engine().await;
    let cancel = CancelToken::new();

    let a1 = ann(1, "first");
    let a2 = ann(2, "second");
    let source = StaticSource::new(vec![vault.source_book(
        odyssey(),
        vec![a1.clone(), a2.clone()],
        1000,
    )]);
    engine.import_all(&source, &cancel, None).await.unwrap();

    // User rewrites the tracked segment itself...
    let note_path = vault.managed.join("The Odyssey - Homer.md");
    let text = std::fs::read_to_string(&note_path).unwrap();
    let edited = text.replace("> second", "> second, the way I remember it");
    std::fs::write(&note_path, &edited).unwrap();

    // ...while the source rewrites the same segment differently.
    let a2_theirs = ann(2, "second, per the corrected translation");
    source.set_books(vec![vault.source_book(
        odyssey(),
        vec![a1.clone(), a2_theirs.clone()],
        2000,
    )]);

    let summary = engine.import_all(&source, &cancel, None).await.unwrap();
    assert_eq!(summary.merged, 1);

    let merged = std::fs::read_to_string(&note_path).unwrap();
    assert!(merged.contains("<<<<<<< Your Edits"));
    assert!(merged.contains(">>>>>>> Incoming Changes"));
    assert!(merged.contains("the way I remember it"));
    assert!(merged.contains("per the corrected translation"));
    assert!(merged.contains("conflicts: unresolved"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_6_stale_location_prompt() {
    let vault = TestVault::new();
    let cancel = CancelToken::new();

    // First import into the original managed folder.
    let annotations = vec![ann(1, "first"), ann(2, "second")];
    let source = StaticSource::new(vec![vault.source_book(
        odyssey(),
        annotations.clone(),
        1000,
    )]);
    {
        let engine = vault.engine().await;
        engine.import_all(&source, &cancel, None).await.unwrap();
        engine.shutdown().await.unwrap();
    }
    let old_note = vault.managed.join("The Odyssey - Homer.md");
    assert!(old_note.exists());

    // The managed folder moves; the old note now lives outside it.
    let new_folder = vault.dir.path().join("library");
    let moved_settings = Settings {
        managed_folder: new_folder.clone(),
        ..vault.settings()
    };

    // Declined: a fresh note is created in the new folder, the old one is
    // left untouched.
    let old_bytes = std::fs::read_to_string(&old_note).unwrap();
    vault.prompt.stale_answers.lock().unwrap().push_back(false);
    let mut grown = annotations.clone();
    grown.push(ann(3, "third"));
    source.set_books(vec![vault.source_book(odyssey(), grown.clone(), 2000)]);
    {
        let engine = vault.engine_with(moved_settings.clone()).await;
        let summary = engine.import_all(&source, &cancel, None).await.unwrap();
        assert_eq!(summary.created, 1);
        engine.shutdown().await.unwrap();
    }
    assert!(new_folder.join("The Odyssey - Homer.md").exists());
    assert_eq!(std::fs::read_to_string(&old_note).unwrap(), old_bytes);

    // Confirmed: the existing out-of-folder note is merged in place.
    let vault2 = TestVault::new();
    let source2 = StaticSource::new(vec![vault2.source_book(
        odyssey(),
        annotations.clone(),
        1000,
    )]);
    {
        let engine = vault2.engine().await;
        engine.import_all(&source2, &cancel, None).await.unwrap();
        engine.shutdown().await.unwrap();
    }
    let old_note2 = vault2.managed.join("The Odyssey - Homer.md");
    vault2.prompt.stale_answers.lock().unwrap().push_back(true);
    let mut grown2 = annotations.clone();
    let a3 = ann(3, "third");
    grown2.push(a3.clone());
    source2.set_books(vec![vault2.source_book(odyssey(), grown2, 2000)]);
    {
        let settings = Settings {
            managed_folder: vault2.dir.path().join("library"),
            ..vault2.settings()
        };
        let engine = vault2.engine_with(settings).await;
        let summary = engine.import_all(&source2, &cancel, None).await.unwrap();
        assert_eq!(summary.merged + summary.auto_merged, 1);
        engine.shutdown().await.unwrap();
    }
    let merged = std::fs::read_to_string(&old_note2).unwrap();
    assert!(merged.contains(&a3.id()), "merge landed in the old location");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleted_note_is_recreated_and_index_cleaned() {
    let vault = TestVault::new();
    let engine = vault.engine().await;
    let cancel = CancelToken::new();

    let source = StaticSource::new(vec![vault.source_book(
        odyssey(),
        vec![ann(1, "first")],
        1000,
    )]);
    engine.import_all(&source, &cancel, None).await.unwrap();

    // The note vanishes without a vault event (external sync, manual rm),
    // so the index still carries the stale instance row.
    let note_path = vault.managed.join("The Odyssey - Homer.md");
    std::fs::remove_file(&note_path).unwrap();

    // Unchanged source, but the target is gone: plan falls to Create.
    let summary = engine.import_all(&source, &cancel, None).await.unwrap();
    assert_eq!(summary.created, 1);
    assert!(note_path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn import_one_with_force_merges_unchanged_source() {
    let vault = TestVault::new();
    let engine = vault.engine().await;
    let cancel = CancelToken::new();

    let a1 = ann(1, "first");
    let source = StaticSource::new(vec![vault.source_book(odyssey(), vec![a1.clone()], 1000)]);
    engine.import_all(&source, &cancel, None).await.unwrap();

    // Nothing changed, but force bypasses the unchanged check; the exact
    // match then short-circuits to a skip rather than rewriting bytes.
    let books = vec![vault.source_book(odyssey(), vec![a1.clone()], 1000)];
    let report = engine
        .import_one(&source, &books[0].source_path, true, &cancel)
        .await
        .unwrap();
    assert!(matches!(report.outcome, BookOutcome::Skipped { .. }));

    // With an actual addition, force produces a merge.
    source.set_books(vec![vault.source_book(
        odyssey(),
        vec![a1.clone(), ann(2, "second")],
        1000,
    )]);
    let report = engine
        .import_one(&source, &books[0].source_path, true, &cancel)
        .await
        .unwrap();
    assert!(matches!(
        report.outcome,
        BookOutcome::AutoMerged { .. } | BookOutcome::Merged { .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn convert_comment_style_sweep() {
    let vault = TestVault::new();
    let engine = vault.engine().await;
    let cancel = CancelToken::new();

    let source = StaticSource::new(vec![vault.source_book(
        odyssey(),
        vec![ann(1, "first"), ann(2, "second")],
        1000,
    )]);
    engine.import_all(&source, &cancel, None).await.unwrap();

    let report = engine
        .convert_comment_style(kohl::CommentStyle::Md, &cancel)
        .await
        .unwrap();
    assert_eq!(report.converted, 1);

    let text =
        std::fs::read_to_string(vault.managed.join("The Odyssey - Homer.md")).unwrap();
    assert!(text.contains("%% kohl-id:"));
    assert!(!text.contains("<!-- kohl-id:"));

    // Converting again is a no-op.
    let again = engine
        .convert_comment_style(kohl::CommentStyle::Md, &cancel)
        .await
        .unwrap();
    assert_eq!(again.converted, 0);
    assert_eq!(again.skipped, 1);

    // A later import still dedupes: the conversion refreshed the snapshot.
    let summary = engine.import_all(&source, &cancel, None).await.unwrap();
    assert_eq!(summary.skipped, 1);
}
