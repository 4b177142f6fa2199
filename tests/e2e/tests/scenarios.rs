//! End-to-end scenarios over the full engine: literal create/read/search
//! flows with the async queue drained between write and verify.

use kioku_core::{
    CreateMemoryInput, PrivacyLevel, SearchMode, SearchRequest, TagMatchMode,
};
use kioku_e2e_tests::test_engine;

fn create_input(content: &str) -> CreateMemoryInput {
    CreateMemoryInput {
        content: content.to_string(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_create_then_read_returns_stored_fields() {
    let (engine, _vectors, _dir) = test_engine();

    let record = engine
        .create_memory(
            "default",
            CreateMemoryInput {
                content: "Completed Phase 41".to_string(),
                importance: Some(0.8),
                emotion: Some("joy".to_string()),
                tags: vec!["milestone".to_string(), "achievement".to_string()],
                ..Default::default()
            },
        )
        .unwrap();

    assert!(record.key.starts_with("memory_"));
    assert_eq!(record.key.len(), "memory_".len() + 14);

    let read = engine.read_memory("default", &record.key).unwrap().unwrap();
    assert_eq!(read.content, "Completed Phase 41");
    assert_eq!(read.importance, 0.8);
    assert_eq!(read.emotion, "joy");
    assert_eq!(read.emotion_intensity, 0.0);
    assert_eq!(read.tags, vec!["milestone", "achievement"]);
    assert_eq!(read.privacy_level, PrivacyLevel::Internal);
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_out_of_range_inputs_stored_clamped() {
    let (engine, _vectors, _dir) = test_engine();

    let record = engine
        .create_memory(
            "default",
            CreateMemoryInput {
                content: "x".to_string(),
                importance: Some(1.7),
                emotion_intensity: Some(-0.3),
                ..Default::default()
            },
        )
        .unwrap();

    let read = engine.read_memory("default", &record.key).unwrap().unwrap();
    assert_eq!(read.importance, 1.0);
    assert_eq!(read.emotion_intensity, 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_hybrid_search_surfaces_keyword_matches() {
    let (engine, _vectors, _dir) = test_engine();

    let contents = [
        "Python programming session in the evening",
        "Python is a lovely snake",
        "Learned Python decorators today",
        "Python packaging woes",
        "Cooked dinner with friends",
    ];
    for content in contents {
        engine.create_memory("default", create_input(content)).unwrap();
    }
    engine.flush_queue().await;

    let hits = engine
        .search(
            "default",
            SearchRequest {
                query: "Python programming".to_string(),
                mode: SearchMode::Hybrid,
                top_k: 3,
                importance_weight: 0.2,
                recency_weight: 0.1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(hits.len() <= 3);
    assert!(!hits.is_empty());
    // Every returned row mentions Python; the dinner row never surfaces
    for hit in &hits {
        assert!(hit.record.content.contains("Python"));
    }
    // Composite scores are in ranked order
    for window in hits.windows(2) {
        assert!(window[0].final_score >= window[1].final_score);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_fuzzy_match_tolerates_typo() {
    let (engine, _vectors, _dir) = test_engine();
    engine
        .create_memory("default", create_input("Python is great"))
        .unwrap();

    let hits = engine
        .search(
            "default",
            SearchRequest {
                query: "Pythn".to_string(),
                mode: SearchMode::Keyword,
                fuzzy_match: true,
                fuzzy_threshold: 70,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert!(hits[0].match_score.unwrap() >= 70);
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_delete_then_search_is_empty_after_drain() {
    let (engine, vectors, _dir) = test_engine();

    let record = engine
        .create_memory("default", create_input("the vanishing memorandum"))
        .unwrap();
    engine.flush_queue().await;
    assert_eq!(vectors.count("default"), 1);

    engine.delete_memory("default", &record.key).unwrap();
    engine.flush_queue().await;
    assert_eq!(vectors.count("default"), 0);

    let hits = engine
        .search(
            "default",
            SearchRequest {
                query: "the vanishing memorandum".to_string(),
                mode: SearchMode::Hybrid,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_tag_all_vs_any_semantics() {
    let (engine, _vectors, _dir) = test_engine();

    for tags in [vec!["a"], vec!["a", "b"], vec!["a", "b", "c"]] {
        engine
            .create_memory(
                "default",
                CreateMemoryInput {
                    content: "tagged".to_string(),
                    tags: tags.into_iter().map(String::from).collect(),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    let all = engine
        .search(
            "default",
            SearchRequest {
                mode: SearchMode::Keyword,
                tags: vec!["a".to_string(), "b".to_string()],
                tag_match_mode: TagMatchMode::All,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    for hit in &all {
        assert!(hit.record.tags.contains(&"a".to_string()));
        assert!(hit.record.tags.contains(&"b".to_string()));
    }

    let any = engine
        .search(
            "default",
            SearchRequest {
                mode: SearchMode::Keyword,
                tags: vec!["a".to_string(), "b".to_string()],
                tag_match_mode: TagMatchMode::Any,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(any.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn date_range_filter_matches_oracle() {
    let (engine, _vectors, _dir) = test_engine();

    // Backdate one row by writing directly through the persona store.
    let handle = engine.persona("default").unwrap();
    let backdated = chrono::DateTime::parse_from_rfc3339("2020-01-01T12:00:00+09:00").unwrap();
    let old = kioku_core::MemoryRecord::new(
        "memory_20200101000000".to_string(),
        "ancient history".to_string(),
        backdated,
    );
    handle.store.upsert(&old).unwrap();

    engine
        .create_memory("default", create_input("fresh note"))
        .unwrap();

    // "today" matches only the fresh row
    let hits = engine
        .search(
            "default",
            SearchRequest {
                mode: SearchMode::Keyword,
                date_range: Some("today".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.content, "fresh note");

    // An explicit span around the backdated row matches only it
    let hits = engine
        .search(
            "default",
            SearchRequest {
                mode: SearchMode::Keyword,
                date_range: Some("2019-12-01..2020-02-01".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.key, "memory_20200101000000");

    // A malformed range is a validation error, not an empty result
    let err = engine
        .search(
            "default",
            SearchRequest {
                mode: SearchMode::Keyword,
                date_range: Some("not-a-date".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(err.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn semantic_search_returns_nearest_content() {
    let (engine, _vectors, _dir) = test_engine();

    engine
        .create_memory("default", create_input("rust borrow checker lifetime puzzle"))
        .unwrap();
    engine
        .create_memory("default", create_input("baking sourdough bread on sunday"))
        .unwrap();
    engine.flush_queue().await;

    let hits = engine
        .search(
            "default",
            SearchRequest {
                query: "rust borrow checker".to_string(),
                mode: SearchMode::Semantic,
                top_k: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].record.content.contains("borrow checker"));
}

#[tokio::test(flavor = "multi_thread")]
async fn related_mode_excludes_seed() {
    let (engine, _vectors, _dir) = test_engine();

    let seed = engine
        .create_memory("default", create_input("walking the dog in the park"))
        .unwrap();
    engine
        .create_memory("default", create_input("walking the dog by the river"))
        .unwrap();
    engine.flush_queue().await;

    let hits = engine
        .search(
            "default",
            SearchRequest {
                mode: SearchMode::Related,
                memory_key: Some(seed.key.clone()),
                top_k: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|hit| hit.record.key != seed.key));
}

#[tokio::test(flavor = "multi_thread")]
async fn association_generation_links_neighbors() {
    let (engine, _vectors, _dir) = test_engine();

    engine
        .create_memory("default", create_input("morning coffee ritual at home"))
        .unwrap();
    engine.flush_queue().await;

    let second = engine
        .create_memory("default", create_input("morning coffee ritual at work"))
        .unwrap();
    engine.flush_queue().await;

    let read = engine.read_memory("default", &second.key).unwrap().unwrap();
    assert!(!read.related_keys.is_empty());
    assert!(!read.related_keys.contains(&second.key));
}
