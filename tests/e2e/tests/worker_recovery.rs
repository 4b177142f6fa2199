//! Dirty-flag recovery: inject a vector-service outage during writes,
//! assert the flag is raised, then rebuild and verify the index matches
//! the durable store exactly.

use kioku_core::{CreateMemoryInput, SearchMode, SearchRequest};
use kioku_e2e_tests::test_engine;

fn create_input(content: &str) -> CreateMemoryInput {
    CreateMemoryInput {
        content: content.to_string(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dirty_flag_raised_on_outage_and_cleared_by_rebuild() {
    let (engine, vectors, _dir) = test_engine();

    // Healthy write first so the collection exists
    engine
        .create_memory("default", create_input("before the outage"))
        .unwrap();
    engine.flush_queue().await;
    assert!(!engine.activity.is_dirty());

    // Outage: 100 writes land durably but the vector tasks all fail
    vectors.set_failing(true);
    for i in 0..100 {
        engine
            .create_memory("default", create_input(&format!("outage write {}", i)))
            .unwrap();
    }
    engine.flush_queue().await;

    assert!(engine.activity.is_dirty());
    assert_eq!(engine.memory_stats("default").unwrap().count, 101);
    // The index is lagging: only the pre-outage point is there
    assert_eq!(vectors.count("default"), 1);

    // Service recovers; a rebuild restores parity and clears the flag
    vectors.set_failing(false);
    let rebuilt = engine.rebuild_vector_indexes().await.unwrap();
    assert_eq!(rebuilt, 101);
    assert!(!engine.activity.is_dirty());
    assert_eq!(vectors.count("default"), 101);

    // Every key maps to the correct enriched content
    let handle = engine.persona("default").unwrap();
    let snapshot = handle.store.load_all().unwrap();
    for (key, record) in snapshot.iter() {
        let indexed = vectors.content("default", key).unwrap();
        assert!(indexed.contains(&record.content));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_during_rebuild_window_land_in_new_collection() {
    let (engine, vectors, _dir) = test_engine();

    for i in 0..5 {
        engine
            .create_memory("default", create_input(&format!("pre-rebuild {}", i)))
            .unwrap();
    }
    engine.flush_queue().await;

    engine.rebuild_vector_indexes().await.unwrap();

    // A write after the swap is indexed into the rebuilt collection
    engine
        .create_memory("default", create_input("post-rebuild arrival"))
        .unwrap();
    engine.flush_queue().await;
    assert_eq!(vectors.count("default"), 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn keyword_search_survives_vector_outage() {
    let (engine, vectors, _dir) = test_engine();

    engine
        .create_memory("default", create_input("resilient keyword row"))
        .unwrap();
    engine.flush_queue().await;

    vectors.set_failing(true);

    // Keyword mode never touches the vector service
    let hits = engine
        .search(
            "default",
            SearchRequest {
                query: "resilient".to_string(),
                mode: SearchMode::Keyword,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    // Hybrid degrades to its keyword leg instead of failing
    let hits = engine
        .search(
            "default",
            SearchRequest {
                query: "resilient".to_string(),
                mode: SearchMode::Hybrid,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    // Semantic mode fails fast
    let err = engine
        .search(
            "default",
            SearchRequest {
                query: "resilient".to_string(),
                mode: SearchMode::Semantic,
                ..Default::default()
            },
        )
        .await;
    assert!(err.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_delete_marks_dirty_then_rebuild_drops_row() {
    let (engine, vectors, _dir) = test_engine();

    let record = engine
        .create_memory("default", create_input("doomed row"))
        .unwrap();
    engine.flush_queue().await;
    assert_eq!(vectors.count("default"), 1);

    // The durable delete succeeds; the vector delete fails
    vectors.set_failing(true);
    assert!(engine.delete_memory("default", &record.key).unwrap());
    engine.flush_queue().await;
    assert!(engine.activity.is_dirty());
    // Stale point remains until recovery
    assert_eq!(vectors.count("default"), 1);

    vectors.set_failing(false);
    engine.rebuild_vector_indexes().await.unwrap();
    assert_eq!(vectors.count("default"), 0);
    assert!(!engine.activity.is_dirty());
}
