//! Context cache: past interactions, per-user session lists, and chat
//! history, each with its own TTL and cap.
//!
//! Relevance ranking is lexical: meaningful tokens of the new query are
//! compared against cached queries, exact matches scoring double partial
//! ones. Expiry is enforced lazily on read and opportunistically on write.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const RESPONSE_TTL_SECS: i64 = 60 * 60;
const SESSION_TTL_SECS: i64 = 30 * 60;
const HISTORY_TTL_SECS: i64 = 24 * 60 * 60;
const SESSION_CAP: usize = 20;
const HISTORY_CAP: usize = 100;
const RELEVANT_LIMIT: usize = 5;
const ANONYMOUS_KEY: &str = "anonymous";

const STOP_WORDS: &[&str] = &[
    "get", "find", "show", "list", "create", "update", "delete", "the", "a", "an", "and", "or",
    "with", "for", "of", "in", "on", "at", "to", "from",
];

/// A cached `{query -> result}` interaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedInteraction {
    pub project_id: u64,
    pub query: String,
    /// Stop-word-stripped, lowercased form used as the relevance key.
    pub normalized_query: String,
    pub user_id: Option<String>,
    /// `METHOD PATH` label of the endpoint that produced the data.
    pub endpoint: Option<String>,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// One entry of a user's recent-session list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionEntry {
    pub query: String,
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One chat-history item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryItem {
    pub query: String,
    pub response: String,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheMetrics {
    lookups: AtomicU64,
    hits: AtomicU64,
}

/// Snapshot of cache effectiveness counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ContextCacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub response_entries: usize,
    pub session_users: usize,
    pub history_keys: usize,
}

/// Thread-safe context cache. Created once at startup; shared via `Arc`.
#[derive(Default)]
pub struct ContextCache {
    responses: DashMap<u64, Vec<CachedInteraction>>,
    sessions: DashMap<String, Vec<SessionEntry>>,
    history: DashMap<String, Vec<HistoryItem>>,
    metrics: CacheMetrics,
}

impl ContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished interaction in the response tier and the caller's
    /// session list.
    pub fn store_interaction(
        &self,
        project_id: u64,
        query: impl Into<String>,
        user_id: Option<&str>,
        endpoint: Option<String>,
        data: Value,
    ) {
        let query = query.into();
        let now = Utc::now();
        let entry = CachedInteraction {
            project_id,
            normalized_query: meaningful_tokens(&query).join(" "),
            query: query.clone(),
            user_id: user_id.map(str::to_string),
            endpoint: endpoint.clone(),
            data,
            created_at: now,
        };
        self.responses
            .entry(project_id)
            .or_default()
            .push(entry);

        if let Some(user) = user_id {
            let mut sessions = self.sessions.entry(user.to_string()).or_default();
            sessions.push(SessionEntry {
                query,
                endpoint,
                created_at: now,
            });
            prune(&mut sessions, SESSION_TTL_SECS, SESSION_CAP);
        }
        self.sweep();
    }

    /// Top entries from the response tier ordered by relevance then
    /// recency. Only entries of the given project are ever considered.
    pub fn find_relevant(
        &self,
        project_id: u64,
        query: &str,
        user_id: Option<&str>,
    ) -> Vec<CachedInteraction> {
        self.metrics.lookups.fetch_add(1, Ordering::Relaxed);
        let tokens = meaningful_tokens(query);
        let cutoff = Utc::now() - Duration::seconds(RESPONSE_TTL_SECS);

        let mut scored: Vec<(u32, CachedInteraction)> = match self.responses.get(&project_id) {
            Some(entries) => entries
                .iter()
                .filter(|e| e.created_at >= cutoff)
                .filter(|e| match (&e.user_id, user_id) {
                    (Some(owner), Some(caller)) => owner == caller,
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .filter_map(|e| {
                    let score = relevance(&tokens, &e.normalized_query);
                    (score > 0).then(|| (score, e.clone()))
                })
                .collect(),
            None => Vec::new(),
        };

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
        });
        scored.truncate(RELEVANT_LIMIT);
        if !scored.is_empty() {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        }
        scored.into_iter().map(|(_, e)| e).collect()
    }

    /// The caller's recent session entries, newest first.
    pub fn session(&self, user_id: &str) -> Vec<SessionEntry> {
        let cutoff = Utc::now() - Duration::seconds(SESSION_TTL_SECS);
        let mut entries: Vec<SessionEntry> = self
            .sessions
            .get(user_id)
            .map(|v| v.iter().filter(|e| e.created_at >= cutoff).cloned().collect())
            .unwrap_or_default();
        entries.reverse();
        entries
    }

    /// Append to a user's (or the anonymous) chat history.
    pub fn append_history(
        &self,
        user_id: Option<&str>,
        query: impl Into<String>,
        response: impl Into<String>,
        success: bool,
    ) {
        let key = user_id.unwrap_or(ANONYMOUS_KEY).to_string();
        let mut items = self.history.entry(key).or_default();
        items.push(HistoryItem {
            query: query.into(),
            response: response.into(),
            success,
            created_at: Utc::now(),
        });
        prune(&mut items, HISTORY_TTL_SECS, HISTORY_CAP);
    }

    pub fn history(&self, user_id: Option<&str>) -> Vec<HistoryItem> {
        let key = user_id.unwrap_or(ANONYMOUS_KEY);
        let cutoff = Utc::now() - Duration::seconds(HISTORY_TTL_SECS);
        self.history
            .get(key)
            .map(|v| v.iter().filter(|i| i.created_at >= cutoff).cloned().collect())
            .unwrap_or_default()
    }

    /// Drop expired entries across all tiers.
    pub fn sweep(&self) {
        let now = Utc::now();
        let response_cutoff = now - Duration::seconds(RESPONSE_TTL_SECS);
        self.responses.retain(|_, entries| {
            entries.retain(|e| e.created_at >= response_cutoff);
            !entries.is_empty()
        });
        let session_cutoff = now - Duration::seconds(SESSION_TTL_SECS);
        self.sessions.retain(|_, entries| {
            entries.retain(|e| e.created_at >= session_cutoff);
            !entries.is_empty()
        });
        let history_cutoff = now - Duration::seconds(HISTORY_TTL_SECS);
        self.history.retain(|_, items| {
            items.retain(|i| i.created_at >= history_cutoff);
            !items.is_empty()
        });
    }

    pub fn stats(&self) -> ContextCacheStats {
        ContextCacheStats {
            lookups: self.metrics.lookups.load(Ordering::Relaxed),
            hits: self.metrics.hits.load(Ordering::Relaxed),
            response_entries: self.responses.iter().map(|e| e.value().len()).sum(),
            session_users: self.sessions.len(),
            history_keys: self.history.len(),
        }
    }
}

fn prune<T>(entries: &mut Vec<T>, ttl_secs: i64, cap: usize)
where
    T: HasCreatedAt,
{
    let cutoff = Utc::now() - Duration::seconds(ttl_secs);
    entries.retain(|e| e.created_at() >= cutoff);
    if entries.len() > cap {
        let excess = entries.len() - cap;
        entries.drain(0..excess);
    }
}

trait HasCreatedAt {
    fn created_at(&self) -> DateTime<Utc>;
}

impl HasCreatedAt for SessionEntry {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl HasCreatedAt for HistoryItem {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Lowercased tokens with stop words removed.
pub(crate) fn meaningful_tokens(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Keyword-overlap score: +2 per exact token match, +1 per partial
/// (substring either direction) match.
fn relevance(query_tokens: &[String], cached_query: &str) -> u32 {
    let cached_tokens = meaningful_tokens(cached_query);
    let mut score = 0;
    for token in query_tokens {
        if cached_tokens.iter().any(|c| c == token) {
            score += 2;
        } else if cached_tokens
            .iter()
            .any(|c| c.contains(token.as_str()) || token.contains(c.as_str()))
        {
            score += 1;
        }
    }
    score
}
