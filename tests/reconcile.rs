//! Catalog reconciliation: dedup, upsert, prune, and what pruning takes with
//! it.


use ics_pantry::reconcile_plannings;

#[tokio::test]
async fn the_first_occurrence_of_a_duplicate_wins() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let catalog = vec![
        scenarii::planning("a", "T1"),
        scenarii::planning("a", "T2"),
    ];

    let report = reconcile_plannings(&store, &catalog).await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.duplicate_total, 1);
    assert_eq!(report.duplicates["a"][0].title, "T2");

    let persisted = store.get_planning("a").unwrap().unwrap();
    assert_eq!(persisted.title, "T1");
}

#[tokio::test]
async fn pruning_takes_the_backup_and_queue_row_along() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    let full = vec![
        scenarii::planning("a", "A"),
        scenarii::planning("b", "B"),
        scenarii::planning("c", "C"),
    ];
    reconcile_plannings(&store, &full).await.unwrap();
    store.upsert_backup("b", &[scenarii::event("1", "Algebra")]).unwrap();
    store.enqueue_refresh("b", 5).unwrap();

    let trimmed = vec![scenarii::planning("a", "A"), scenarii::planning("c", "C")];
    let report = reconcile_plannings(&store, &trimmed).await.unwrap();
    assert_eq!(report.pruned, 1);
    assert_eq!(report.unchanged, 2);

    assert!(store.get_planning("b").unwrap().is_none());
    assert!(store.read_backup("b").unwrap().is_none());
    assert_eq!(store.queue_stats().unwrap().depth, 0);
}

#[tokio::test]
async fn an_empty_catalog_clears_the_table() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    reconcile_plannings(&store, &[scenarii::planning("a", "A")]).await.unwrap();

    let report = reconcile_plannings(&store, &[]).await.unwrap();
    assert_eq!(report.pruned, 1);
    assert_eq!(store.count_plannings().unwrap(), 0);
}

#[tokio::test]
async fn edited_entries_count_as_updates() {
    scenarii::init_logging();
    let (_dir, store) = scenarii::open_store();
    reconcile_plannings(&store, &[scenarii::planning("a", "Old title")])
        .await
        .unwrap();

    let report = reconcile_plannings(&store, &[scenarii::planning("a", "New title")])
        .await
        .unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.created, 0);
    assert_eq!(store.get_planning("a").unwrap().unwrap().title, "New title");
}
