//! Search Orchestrator
//!
//! Keyword, semantic, hybrid, related and smart modes over one persona's
//! store. The durable store is the source of truth for returned records;
//! the vector service only nominates candidates. Metadata filters apply as
//! post-filters (or are pushed into the vector service where expressible),
//! and every result set is pruned by privacy level before returning.

mod query;

pub use query::{build_expanded_query, is_ambiguous_query, ExpandedQuery};

use chrono::{DateTime, FixedOffset};

use crate::config::Config;
use crate::embed::Reranker;
use crate::engine::EngineError;
use crate::privacy;
use crate::record::{MemoryRecord, PrivacyLevel};
use crate::store::MemoryStore;
use crate::timeutil;
use crate::vector::{VectorFilter, VectorStore};

// ============================================================================
// REQUEST / RESULT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    Keyword,
    Semantic,
    #[default]
    Hybrid,
    Related,
    Smart,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keyword" => Some(SearchMode::Keyword),
            "semantic" => Some(SearchMode::Semantic),
            "hybrid" => Some(SearchMode::Hybrid),
            "related" => Some(SearchMode::Related),
            "smart" => Some(SearchMode::Smart),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagMatchMode {
    #[default]
    Any,
    All,
}

impl TagMatchMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "all" => TagMatchMode::All,
            _ => TagMatchMode::Any,
        }
    }
}

/// A fully specified search. Field names mirror the tool surface.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub top_k: usize,
    pub fuzzy_match: bool,
    /// Fuzzy similarity threshold in percent (0-100).
    pub fuzzy_threshold: u32,
    pub tags: Vec<String>,
    pub tag_match_mode: TagMatchMode,
    pub date_range: Option<String>,
    pub min_importance: Option<f64>,
    pub emotion: Option<String>,
    pub action_tag: Option<String>,
    pub environment: Option<String>,
    pub physical_state: Option<String>,
    pub mental_state: Option<String>,
    pub relationship_status: Option<String>,
    /// Substring match on the snapshotted equipment map values.
    pub equipped_item: Option<String>,
    pub importance_weight: f64,
    pub recency_weight: f64,
    /// Exact key match filter; also the seed for related mode.
    pub memory_key: Option<String>,
    /// Admin flag: include secret rows.
    pub include_secret: bool,
}

impl SearchRequest {
    /// top_k default 5, bounded 1..50.
    pub fn effective_top_k(&self) -> usize {
        if self.top_k == 0 {
            5
        } else {
            self.top_k.clamp(1, 50)
        }
    }
}

/// One search result; `distance` is uniform across modes (smaller better).
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: MemoryRecord,
    pub distance: f32,
    /// Keyword/fuzzy match percentage when that leg produced the hit.
    pub match_score: Option<u32>,
    /// Composite ranking score (larger better).
    pub final_score: f64,
}

// ============================================================================
// SCORING
// ============================================================================

/// Composite score: base similarity plus weighted importance and recency.
///
/// `final = base + importance_weight x importance
///        + recency_weight x exp(-age_days / 30)`
pub fn composite_score(
    base_similarity: f64,
    record: &MemoryRecord,
    importance_weight: f64,
    recency_weight: f64,
    now: DateTime<FixedOffset>,
) -> f64 {
    let age = timeutil::age_days(record.created_at, now);
    base_similarity
        + importance_weight * record.importance
        + recency_weight * (-age / 30.0).exp()
}

fn rank_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.record.created_at.cmp(&a.record.created_at))
            .then_with(|| a.record.key.cmp(&b.record.key))
    });
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct SearchOrchestrator<'a> {
    pub store: &'a MemoryStore,
    pub vector: &'a dyn VectorStore,
    pub reranker: &'a Reranker,
    pub config: &'a Config,
}

impl SearchOrchestrator<'_> {
    pub async fn search(
        &self,
        mut request: SearchRequest,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        // Smart mode expands ambiguous queries with time/day context and a
        // promise tag filter, then runs as hybrid over the last 30 days.
        if request.mode == SearchMode::Smart {
            let expanded = build_expanded_query(&request.query, now);
            request.query = expanded.query;
            for tag in expanded.extra_tags {
                if !request.tags.contains(&tag) {
                    request.tags.push(tag);
                }
            }
            if request.date_range.is_none() {
                request.date_range = Some("last_30_days".to_string());
            }
            request.mode = SearchMode::Hybrid;
        }

        let mut hits = match request.mode {
            SearchMode::Keyword => self.keyword_search(&request, now)?,
            SearchMode::Semantic => self.semantic_search(&request, now).await?,
            SearchMode::Hybrid => self.hybrid_search(&request, now).await?,
            SearchMode::Related => self.related_search(&request, now).await?,
            SearchMode::Smart => unreachable!("smart rewrites to hybrid"),
        };

        // Privacy pruning happens last so no mode can leak a row.
        let max_level = self.config.search_max_level();
        hits.retain(|hit| {
            privacy::is_visible(hit.record.privacy_level, max_level, request.include_secret)
                && (request.include_secret
                    || hit.record.privacy_level != PrivacyLevel::Secret)
        });
        hits.truncate(request.effective_top_k());
        Ok(hits)
    }

    // ------------------------------------------------------------------
    // keyword
    // ------------------------------------------------------------------

    fn keyword_search(
        &self,
        request: &SearchRequest,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let snapshot = self.store.load_all()?;
        let date_range = self.parse_date_filter(request, now)?;

        let mut hits = Vec::new();
        for record in snapshot.values() {
            if !self.post_filter(record, request, date_range) {
                continue;
            }
            let score = if request.query.is_empty() {
                Some(100)
            } else if request.fuzzy_match {
                fuzzy_score(&request.query, &record.content)
                    .filter(|s| *s >= request.fuzzy_threshold.min(100))
            } else if record
                .content
                .to_lowercase()
                .contains(&request.query.to_lowercase())
            {
                Some(100)
            } else {
                None
            };
            let Some(score) = score else { continue };

            let base = score as f64 / 100.0;
            hits.push(SearchHit {
                record: record.clone(),
                distance: 1.0 - base as f32,
                match_score: Some(score),
                final_score: composite_score(
                    base,
                    record,
                    request.importance_weight,
                    request.recency_weight,
                    now,
                ),
            });
        }
        rank_hits(&mut hits);
        Ok(hits)
    }

    // ------------------------------------------------------------------
    // semantic
    // ------------------------------------------------------------------

    async fn semantic_search(
        &self,
        request: &SearchRequest,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let candidates = self.semantic_candidates(request, &request.query).await?;
        let mut hits = self.resolve_candidates(candidates, request, now)?;
        self.rerank_hits(&request.query, &mut hits, request, now);
        rank_hits(&mut hits);
        Ok(hits)
    }

    /// Vector-service leg: pushes the expressible filters down and fetches
    /// an over-sampled candidate list for post-filtering and reranking.
    async fn semantic_candidates(
        &self,
        request: &SearchRequest,
        query: &str,
    ) -> Result<Vec<crate::vector::VectorHit>, EngineError> {
        let top_k = request.effective_top_k();
        let k = (top_k * 3).clamp(top_k, 50);

        let mut filter = VectorFilter {
            emotion: request.emotion.clone(),
            action_tag: request.action_tag.clone(),
            environment: request.environment.clone(),
            min_importance: request.min_importance,
            tags_all: Vec::new(),
        };
        if request.tag_match_mode == TagMatchMode::All {
            filter.tags_all = request.tags.clone();
        }

        let filter_ref = (!filter.is_empty()).then_some(&filter);
        Ok(self.vector.search_by_text(query, k, filter_ref).await?)
    }

    /// Join vector candidates back to durable rows and apply post-filters.
    fn resolve_candidates(
        &self,
        candidates: Vec<crate::vector::VectorHit>,
        request: &SearchRequest,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let date_range = self.parse_date_filter(request, now)?;
        let mut hits = Vec::new();
        for candidate in candidates {
            let Some(record) = self.store.get(&candidate.key)? else {
                // Dangling point: the row was deleted and the index lags.
                continue;
            };
            if !self.post_filter(&record, request, date_range) {
                continue;
            }
            let base = 1.0 - candidate.distance as f64;
            hits.push(SearchHit {
                final_score: composite_score(
                    base,
                    &record,
                    request.importance_weight,
                    request.recency_weight,
                    now,
                ),
                distance: candidate.distance,
                match_score: None,
                record,
            });
        }
        Ok(hits)
    }

    /// Cross-encoder pass over an already-bounded candidate list. The
    /// rerank score becomes the base similarity for composite scoring.
    fn rerank_hits(
        &self,
        query: &str,
        hits: &mut Vec<SearchHit>,
        request: &SearchRequest,
        now: DateTime<FixedOffset>,
    ) {
        if query.is_empty() || hits.len() < 2 || self.config.reranker_top_n == 0 {
            return;
        }
        let documents: Vec<String> = hits.iter().map(|h| h.record.content.clone()).collect();
        let reranked = self
            .reranker
            .rerank(query, &documents, self.config.reranker_top_n.max(hits.len()));
        if reranked.is_empty() {
            return;
        }
        let mut rescored = Vec::with_capacity(reranked.len());
        for hit in reranked {
            let mut entry = hits[hit.index].clone();
            entry.final_score = composite_score(
                hit.score as f64,
                &entry.record,
                request.importance_weight,
                request.recency_weight,
                now,
            );
            rescored.push(entry);
        }
        *hits = rescored;
    }

    // ------------------------------------------------------------------
    // hybrid
    // ------------------------------------------------------------------

    async fn hybrid_search(
        &self,
        request: &SearchRequest,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let keyword_hits = self.keyword_search(request, now)?;

        // Progressive disclosure: enough keyword hits skip the semantic
        // leg, and profiles may disable the fallback entirely.
        let progressive = &self.config.progressive_search;
        if progressive.enabled && progressive.keyword_first && !request.query.is_empty() {
            if keyword_hits.len() >= progressive.keyword_threshold {
                return Ok(keyword_hits);
            }
            if !progressive.semantic_fallback {
                return Ok(keyword_hits);
            }
        }

        let mut semantic = match self.semantic_candidates(request, &request.query).await {
            Ok(candidates) => self.resolve_candidates(candidates, request, now)?,
            Err(e) => {
                // Keyword still works without the embedding stack.
                tracing::warn!("Hybrid semantic leg unavailable: {}", e);
                Vec::new()
            }
        };
        if progressive.enabled {
            semantic.truncate(progressive.max_semantic_top_k.max(1));
        }

        // Union by key; duplicates keep the better (smaller) distance.
        let mut merged: Vec<SearchHit> = Vec::new();
        for hit in keyword_hits.into_iter().chain(semantic) {
            match merged.iter_mut().find(|m| m.record.key == hit.record.key) {
                Some(existing) => {
                    if hit.distance < existing.distance {
                        *existing = hit;
                    }
                }
                None => merged.push(hit),
            }
        }

        self.rerank_hits(&request.query, &mut merged, request, now);
        rank_hits(&mut merged);
        Ok(merged)
    }

    // ------------------------------------------------------------------
    // related
    // ------------------------------------------------------------------

    async fn related_search(
        &self,
        request: &SearchRequest,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<SearchHit>, EngineError> {
        let seed_key = request
            .memory_key
            .as_deref()
            .unwrap_or(request.query.as_str());
        let seed = self
            .store
            .get(seed_key)?
            .ok_or_else(|| EngineError::NotFound(seed_key.to_string()))?;

        let top_k = request.effective_top_k();
        let candidates = self
            .vector
            .search_by_text(&seed.content, top_k + 1, None)
            .await?;
        let candidates: Vec<_> = candidates
            .into_iter()
            .filter(|c| c.key != seed.key)
            .take(top_k)
            .collect();

        let mut related_request = request.clone();
        related_request.memory_key = None;
        let mut hits = self.resolve_candidates(candidates, &related_request, now)?;
        rank_hits(&mut hits);
        Ok(hits)
    }

    // ------------------------------------------------------------------
    // filters
    // ------------------------------------------------------------------

    fn parse_date_filter(
        &self,
        request: &SearchRequest,
        now: DateTime<FixedOffset>,
    ) -> Result<Option<(DateTime<FixedOffset>, DateTime<FixedOffset>)>, EngineError> {
        match &request.date_range {
            Some(range) => timeutil::parse_date_query(range, now)
                .map(Some)
                .map_err(EngineError::Validation),
            None => Ok(None),
        }
    }

    fn post_filter(
        &self,
        record: &MemoryRecord,
        request: &SearchRequest,
        date_range: Option<(DateTime<FixedOffset>, DateTime<FixedOffset>)>,
    ) -> bool {
        if let Some(key) = &request.memory_key {
            if &record.key != key {
                return false;
            }
        }
        if let Some((start, end)) = date_range {
            if record.created_at < start || record.created_at > end {
                return false;
            }
        }
        if let Some(min) = request.min_importance {
            if record.importance < min {
                return false;
            }
        }
        for (filter, value) in [
            (&request.emotion, &record.emotion),
            (&request.environment, &record.environment),
            (&request.physical_state, &record.physical_state),
            (&request.mental_state, &record.mental_state),
            (&request.relationship_status, &record.relationship_status),
        ] {
            if let Some(expected) = filter {
                if expected != value {
                    return false;
                }
            }
        }
        if let Some(action) = &request.action_tag {
            if record.action_tag.as_deref() != Some(action.as_str()) {
                return false;
            }
        }
        if let Some(item) = &request.equipped_item {
            let needle = item.to_lowercase();
            let matched = record
                .equipped_items
                .as_ref()
                .map(|items| {
                    items
                        .values()
                        .any(|name| name.to_lowercase().contains(&needle))
                })
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if !request.tags.is_empty() {
            let matched = match request.tag_match_mode {
                TagMatchMode::All => {
                    !record.tags.is_empty()
                        && request.tags.iter().all(|t| record.tags.contains(t))
                }
                TagMatchMode::Any => request.tags.iter().any(|t| record.tags.contains(t)),
            };
            if !matched {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// FUZZY MATCHING
// ============================================================================

/// Fuzzy similarity in percent: the better of a partial-ratio over the
/// whole content and the best per-word ratio.
fn fuzzy_score(query: &str, content: &str) -> Option<u32> {
    let q = query.to_lowercase();
    let c = content.to_lowercase();
    let partial = rapidfuzz::fuzz::partial_ratio(q.chars(), c.chars());
    let best_word = c
        .split_whitespace()
        .filter(|w| w.chars().count() >= 2)
        .map(|w| rapidfuzz::fuzz::ratio(q.chars(), w.chars()))
        .fold(0.0_f64, f64::max);
    let score = partial.max(best_word);
    (score > 0.0).then_some(score.round() as u32)
}

// ============================================================================
// TESTS
// ============================================================================
