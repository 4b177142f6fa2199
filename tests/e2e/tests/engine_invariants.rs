//! Cross-component invariants: persona isolation, key/point parity,
//! vector idempotence, summarization linkage, smart-mode behavior.

use kioku_core::{CreateMemoryInput, SearchMode, SearchRequest, SummaryWindow, UpdateMemoryInput};
use kioku_e2e_tests::test_engine;

fn create_input(content: &str) -> CreateMemoryInput {
    CreateMemoryInput {
        content: content.to_string(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn persona_isolation_no_cross_talk() {
    let (engine, vectors, _dir) = test_engine();

    let a = engine
        .create_memory("alpha", create_input("alpha private note"))
        .unwrap();
    engine
        .create_memory("beta", create_input("beta private note"))
        .unwrap();
    engine.flush_queue().await;

    // Row-level isolation
    assert!(engine.read_memory("beta", &a.key).unwrap().is_none());
    assert_eq!(engine.memory_stats("alpha").unwrap().count, 1);
    assert_eq!(engine.memory_stats("beta").unwrap().count, 1);

    // Point-level isolation
    assert_eq!(vectors.count("alpha"), 1);
    assert_eq!(vectors.count("beta"), 1);
    assert_eq!(vectors.keys("alpha"), vec![a.key.clone()]);

    // Mutating alpha leaves beta untouched
    engine.delete_memory("alpha", &a.key).unwrap();
    engine.flush_queue().await;
    assert_eq!(vectors.count("alpha"), 0);
    assert_eq!(vectors.count("beta"), 1);
    assert_eq!(engine.memory_stats("beta").unwrap().count, 1);

    // Search on beta never sees alpha content
    let hits = engine
        .search(
            "beta",
            SearchRequest {
                query: "alpha".to_string(),
                mode: SearchMode::Keyword,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn key_and_point_counts_match_after_quiescence() {
    let (engine, vectors, _dir) = test_engine();

    let mut keys = Vec::new();
    for i in 0..20 {
        let record = engine
            .create_memory("default", create_input(&format!("entry number {}", i)))
            .unwrap();
        keys.push(record.key);
    }
    engine.flush_queue().await;

    assert_eq!(engine.memory_stats("default").unwrap().count, 20);
    assert_eq!(vectors.count("default"), 20);
    assert!(!engine.activity.is_dirty());

    let mut stored = vectors.keys("default");
    stored.sort();
    keys.sort();
    assert_eq!(stored, keys);
}

#[tokio::test(flavor = "multi_thread")]
async fn vector_upsert_is_idempotent_per_key() {
    let (engine, vectors, _dir) = test_engine();

    let record = engine
        .create_memory("default", create_input("first version"))
        .unwrap();
    engine.flush_queue().await;

    engine
        .update_memory(
            "default",
            &record.key,
            UpdateMemoryInput {
                content: Some("second version".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    engine.flush_queue().await;

    // Exactly one point, reflecting the latest content
    assert_eq!(vectors.count("default"), 1);
    let content = vectors.content("default", &record.key).unwrap();
    assert!(content.contains("second version"));
}

#[tokio::test(flavor = "multi_thread")]
async fn same_second_keys_get_distinct_suffixes() {
    let (engine, _vectors, _dir) = test_engine();

    let mut keys = std::collections::HashSet::new();
    for i in 0..5 {
        let record = engine
            .create_memory("default", create_input(&format!("burst {}", i)))
            .unwrap();
        assert!(keys.insert(record.key), "duplicate key assigned");
    }
    assert_eq!(engine.memory_stats("default").unwrap().count, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn summarization_links_members_to_summary_node() {
    let (engine, _vectors, _dir) = test_engine();

    for i in 0..4 {
        engine
            .create_memory(
                "default",
                CreateMemoryInput {
                    content: format!("important event {}", i),
                    importance: Some(0.8),
                    emotion: Some("joy".to_string()),
                    emotion_intensity: Some(0.6),
                    ..Default::default()
                },
            )
            .unwrap();
    }
    // A low-importance row stays out of the summary
    let minor = engine
        .create_memory(
            "default",
            CreateMemoryInput {
                content: "trivial aside".to_string(),
                importance: Some(0.1),
                ..Default::default()
            },
        )
        .unwrap();

    let summary_key = engine
        .summarize_recent("default", SummaryWindow::LastDay)
        .await
        .unwrap()
        .expect("summary should be produced");
    assert!(summary_key.starts_with("summary_"));

    let summary = engine.read_memory("default", &summary_key).unwrap().unwrap();
    assert_eq!(summary.related_keys.len(), 4);
    assert_eq!(summary.emotion, "joy");

    // Every included member points back at the summary node
    for key in &summary.related_keys {
        let member = engine.read_memory("default", key).unwrap().unwrap();
        assert_eq!(member.summary_ref.as_deref(), Some(summary_key.as_str()));
    }

    // The excluded row is not linked
    let minor = engine.read_memory("default", &minor.key).unwrap().unwrap();
    assert!(minor.summary_ref.is_none());

    // Re-summarizing does not fold the summary node into itself
    let second = engine
        .summarize_recent("default", SummaryWindow::LastDay)
        .await
        .unwrap()
        .unwrap();
    let summary = engine.read_memory("default", &second).unwrap().unwrap();
    assert!(!summary.related_keys.contains(&second));
}

#[tokio::test(flavor = "multi_thread")]
async fn smart_mode_falls_back_to_hybrid_with_expansion() {
    let (engine, _vectors, _dir) = test_engine();

    engine
        .create_memory(
            "default",
            CreateMemoryInput {
                content: "約束: 週末に買い物へ行く".to_string(),
                tags: vec!["promise".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
    engine.flush_queue().await;

    let hits = engine
        .search(
            "default",
            SearchRequest {
                query: "約束".to_string(),
                mode: SearchMode::Smart,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].record.tags.contains(&"promise".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn op_log_records_success_and_failure() {
    let (engine, _vectors, _dir) = test_engine();

    let record = engine
        .create_memory("default", create_input("logged"))
        .unwrap();
    engine.delete_memory("default", &record.key).unwrap();
    // Idempotent second delete also logs
    engine.delete_memory("default", &record.key).unwrap();

    let handle = engine.persona("default").unwrap();
    assert!(handle.store.op_log_count().unwrap() >= 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn decay_applies_through_engine() {
    let (engine, _vectors, _dir) = test_engine();
    engine
        .create_memory(
            "default",
            CreateMemoryInput {
                content: "freshly minted".to_string(),
                importance: Some(0.9),
                ..Default::default()
            },
        )
        .unwrap();

    let preview = engine.apply_decay("default", true).unwrap();
    assert_eq!(preview.len(), 1);
    // Fresh memories barely decay
    for value in preview.values() {
        assert!(*value > 0.85);
    }
}
