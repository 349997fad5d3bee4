//! Hybrid retrieval over the chunk store.
//!
//! Two stages: a keyword candidate fetch (disjunctive LIKE over the
//! query's tokens, bounded) followed by a cosine rerank against the query
//! embedding. Candidate vectors decode through a bounded LRU keyed by
//! chunk id so repeated queries skip the blob decode. Top-K selection
//! uses a min-heap, bounding memory to O(K) regardless of the candidate
//! count. When no embedding is available — engine down, model mismatch,
//! chunks stored without vectors — the first K keyword candidates are
//! returned in storage order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::cache::LruTtlCache;
use crate::config::RetrievalConfig;
use crate::engine::{blob_to_vec, cosine_similarity, EngineHandle};
use crate::error::{Error, Result};
use crate::models::KbChunk;
use crate::store;

/// Hard cap on K at the debug boundary.
pub const MAX_DEBUG_LIMIT: usize = 50;

pub struct Retriever {
    pool: SqlitePool,
    engine: EngineHandle,
    config: RetrievalConfig,
    vec_cache: LruTtlCache<i64, Arc<Vec<f32>>>,
}

impl Retriever {
    pub fn new(pool: SqlitePool, engine: EngineHandle, config: RetrievalConfig) -> Self {
        Self {
            pool,
            engine,
            config,
            vec_cache: LruTtlCache::new(2048, Duration::from_secs(600)),
        }
    }

    /// Return up to `top_k` chunks relevant to `q`, best first.
    pub async fn query(&self, q: &str, top_k: usize) -> Result<Vec<KbChunk>> {
        let q = q.trim();
        if q.is_empty() {
            return Ok(Vec::new());
        }
        let top_k = if top_k == 0 { self.config.top_k } else { top_k };
        let tokens = tokenize(q);

        if let Some(query_vec) = self.query_embedding(q).await {
            let limit = if q.chars().count() >= self.config.long_query_runes {
                self.config.candidate_limit_long
            } else {
                self.config.candidate_limit_short
            };
            let candidates = store::search_chunk_candidates(&self.pool, &tokens, limit).await?;
            if !candidates.is_empty() {
                let ranked = self.rank(&query_vec, candidates, top_k);
                if !ranked.is_empty() {
                    return Ok(ranked);
                }
            }
        }

        store::search_chunk_candidates(&self.pool, &tokens, top_k as i64).await
    }

    /// Embed the query, or `None` when the vector stage must be skipped:
    /// engine unavailable, or the stored embedding model no longer
    /// matches the active one (degraded, keyword-only mode).
    async fn query_embedding(&self, q: &str) -> Option<Vec<f32>> {
        let kb_model = store::get_kb_embedding_model(&self.pool)
            .await
            .ok()
            .flatten()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());

        let text = q.to_string();
        let result = self
            .engine
            .with_locked(move |e| {
                if let Some(kb) = &kb_model {
                    let current = e.model_path().trim().to_string();
                    if !current.is_empty() && current != *kb {
                        return Err(Error::EmbeddingModelMismatch {
                            kb: kb.clone(),
                            current,
                        });
                    }
                }
                e.embed(&text)
            })
            .await;

        match result {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(err) => {
                debug!("query embedding unavailable, keyword fallback: {err}");
                None
            }
        }
    }

    fn rank(&self, query_vec: &[f32], candidates: Vec<KbChunk>, top_k: usize) -> Vec<KbChunk> {
        let mut heap: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(top_k + 1);

        for chunk in candidates {
            if chunk.vector.is_empty() || chunk.id == 0 {
                continue;
            }
            let vec = match self.vec_cache.get(&chunk.id) {
                Some(v) => v,
                None => {
                    let decoded = Arc::new(blob_to_vec(&chunk.vector));
                    self.vec_cache.set(chunk.id, decoded.clone());
                    decoded
                }
            };
            if vec.len() != query_vec.len() {
                continue;
            }
            let sim = cosine_similarity(query_vec, &vec);

            if heap.len() < top_k {
                heap.push(Reverse(Scored { sim, chunk }));
            } else if let Some(Reverse(min)) = heap.peek() {
                if sim > min.sim {
                    heap.pop();
                    heap.push(Reverse(Scored { sim, chunk }));
                }
            }
        }

        let mut scored: Vec<Scored> = heap.into_iter().map(|Reverse(s)| s).collect();
        scored.sort_by(|a, b| b.sim.total_cmp(&a.sim));
        scored.into_iter().map(|s| s.chunk).collect()
    }

    /// Diagnostic search: keyword candidates plus per-hit similarity,
    /// reporting why the vector stage was or wasn't used.
    pub async fn debug_search(&self, q: &str, limit: usize) -> Result<DebugSearch> {
        let q = q.trim();
        if q.is_empty() {
            return Err(Error::InvalidInput("q is required".to_string()));
        }
        let limit = limit.clamp(1, MAX_DEBUG_LIMIT);

        let current_model = self.engine.model_path().await.unwrap_or_default();
        let kb_model = store::get_kb_embedding_model(&self.pool)
            .await?
            .unwrap_or_default();

        let tokens = tokenize(q);
        let candidates =
            store::search_chunk_candidates(&self.pool, &tokens, self.config.candidate_limit_long)
                .await?;

        let query_vec = self.query_embedding(q).await;
        let mut out = DebugSearch {
            q: q.to_string(),
            current_model,
            kb_embedding_model: kb_model,
            vector_dim: query_vec.as_ref().map(Vec::len),
            candidates: candidates.len(),
            results: Vec::new(),
        };

        match query_vec {
            None => {
                for chunk in candidates.iter().take(limit) {
                    out.results.push(DebugHit {
                        id: chunk.id,
                        file_id: chunk.file_id,
                        similarity: 0.0,
                        has_vector: !chunk.vector.is_empty(),
                        snippet: snippet(&chunk.content, 120),
                    });
                }
            }
            Some(qv) => {
                // Full sort is fine at the debug boundary.
                let mut scored: Vec<(f32, &KbChunk)> = candidates
                    .iter()
                    .filter(|c| !c.vector.is_empty())
                    .filter_map(|c| {
                        let v = blob_to_vec(&c.vector);
                        (v.len() == qv.len()).then(|| (cosine_similarity(&qv, &v), c))
                    })
                    .collect();
                scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                for (sim, chunk) in scored.into_iter().take(limit) {
                    out.results.push(DebugHit {
                        id: chunk.id,
                        file_id: chunk.file_id,
                        similarity: sim,
                        has_vector: true,
                        snippet: snippet(&chunk.content, 120),
                    });
                }
            }
        }
        Ok(out)
    }
}

struct Scored {
    sim: f32,
    chunk: KbChunk,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.sim.total_cmp(&other.sim).is_eq()
    }
}
impl Eq for Scored {}
impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sim.total_cmp(&other.sim)
    }
}

#[derive(Debug, Serialize)]
pub struct DebugSearch {
    pub q: String,
    pub current_model: String,
    pub kb_embedding_model: String,
    pub vector_dim: Option<usize>,
    pub candidates: usize,
    pub results: Vec<DebugHit>,
}

#[derive(Debug, Serialize)]
pub struct DebugHit {
    pub id: i64,
    pub file_id: i64,
    pub similarity: f32,
    pub has_vector: bool,
    pub snippet: String,
}

/// Split a query on whitespace and CJK punctuation, dropping pure-ASCII
/// tokens shorter than two runes. Single CJK characters are kept — they
/// carry real signal.
pub fn tokenize(q: &str) -> Vec<String> {
    q.split(|r: char| matches!(r, ' ' | ',' | '，' | '。' | '?' | '？' | '!' | '！'))
        .filter(|w| !w.is_empty())
        .filter(|w| w.chars().count() >= 2 || contains_cjk(w))
        .map(str::to_string)
        .collect()
}

fn contains_cjk(s: &str) -> bool {
    s.chars().any(|r| ('\u{4e00}'..='\u{9fa5}').contains(&r))
}

fn snippet(s: &str, n: usize) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(n).collect()
}
