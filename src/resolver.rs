//! Intent resolver: ranks a project's endpoints against a user query by
//! blending semantic, keyword, and intent-pattern similarity.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::catalog::{EndpointDetail, ProjectSnapshot};
use crate::context::meaningful_tokens;
use crate::llm::LlmGateway;

/// Minimum blended score for an endpoint to count as a match.
pub const MATCH_THRESHOLD: f32 = 0.2;

const SEMANTIC_WEIGHT: f32 = 0.4;
const KEYWORD_WEIGHT: f32 = 0.3;
const INTENT_WEIGHT: f32 = 0.3;
const PROMPT_TEXT_BONUS: f32 = 0.1;
const PROMPT_TEXT_MIN_LEN: usize = 20;

/// One ranked endpoint.
#[derive(Clone, Debug)]
pub struct ScoredEndpoint {
    pub endpoint_id: u64,
    pub route: String,
    pub score: f32,
}

pub struct IntentResolver {
    gateway: Arc<dyn LlmGateway>,
}

impl IntentResolver {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }

    /// Rank all endpoints of the snapshot. Endpoints scoring at or above
    /// [`MATCH_THRESHOLD`] are returned sorted by score descending; if
    /// none qualify the full catalog is returned instead (fail-open, the
    /// planner still chooses). Embedding failures degrade to lexical
    /// scoring only.
    pub async fn resolve(&self, snapshot: &ProjectSnapshot, query: &str) -> Vec<ScoredEndpoint> {
        let query_embedding = match self.gateway.embed(query).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(error = %err, "query embedding failed, scoring without semantics");
                Vec::new()
            }
        };

        let mut scored: Vec<ScoredEndpoint> = snapshot
            .endpoints
            .iter()
            .map(|detail| ScoredEndpoint {
                endpoint_id: detail.endpoint.id,
                route: detail.endpoint.route_label(),
                score: blended_score(detail, query, &query_embedding),
            })
            .collect();

        // Deterministic ordering: score desc, then (method, path) lex.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.route.cmp(&b.route))
        });

        let matching = scored
            .iter()
            .filter(|s| s.score >= MATCH_THRESHOLD)
            .count();
        if matching > 0 {
            scored.truncate(matching);
        } else {
            debug!(
                endpoints = scored.len(),
                "no endpoint above threshold, failing open with full catalog"
            );
        }
        scored
    }
}

fn blended_score(detail: &EndpointDetail, query: &str, query_embedding: &[f32]) -> f32 {
    let endpoint = &detail.endpoint;
    let semantic = clamp01(cosine(query_embedding, &endpoint.embedding));
    let keyword = clamp01(keyword_score(query, endpoint.keywords.iter()));
    let intent = clamp01(intent_score(query, &endpoint.intent_patterns));
    let bonus = if endpoint.prompt_text.len() > PROMPT_TEXT_MIN_LEN {
        PROMPT_TEXT_BONUS
    } else {
        0.0
    };
    SEMANTIC_WEIGHT * semantic + KEYWORD_WEIGHT * keyword + INTENT_WEIGHT * intent + bonus
}

/// Cosine similarity; 0 when either vector is missing or zero.
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let norm_a = l2(a);
    let norm_b = l2(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let len = a.len().min(b.len());
    let mut dot = 0.0;
    for i in 0..len {
        dot += a[i] * b[i];
    }
    dot / (norm_a * norm_b)
}

fn l2(vec: &[f32]) -> f32 {
    vec.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Share of endpoint keywords that substring-match some query token, in
/// either direction.
fn keyword_score<'a>(query: &str, keywords: impl Iterator<Item = &'a String>) -> f32 {
    let tokens = meaningful_tokens(query);
    let mut total = 0usize;
    let mut matched = 0usize;
    for keyword in keywords {
        total += 1;
        let needle = keyword.to_lowercase();
        if tokens
            .iter()
            .any(|t| t.contains(needle.as_str()) || needle.contains(t.as_str()))
        {
            matched += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        matched as f32 / total as f32
    }
}

/// Best intent-pattern similarity: containment either way scores 1.0,
/// otherwise 0.7 times the share of pattern words present in the query.
fn intent_score(query: &str, patterns: &[String]) -> f32 {
    let query_lower = query.to_lowercase();
    let query_words: Vec<&str> = query_lower.split_whitespace().collect();
    patterns
        .iter()
        .map(|pattern| {
            let pattern_lower = pattern.to_lowercase();
            if query_lower.contains(&pattern_lower) || pattern_lower.contains(&query_lower) {
                return 1.0;
            }
            let pattern_words: Vec<&str> = pattern_lower.split_whitespace().collect();
            if pattern_words.is_empty() {
                return 0.0;
            }
            let overlap = pattern_words
                .iter()
                .filter(|w| query_words.contains(w))
                .count();
            0.7 * overlap as f32 / pattern_words.len() as f32
        })
        .fold(0.0, f32::max)
}

fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}
