//! LLM gateway: chat completion, JSON-mode extraction, and text
//! embeddings behind one trait so tests substitute deterministic fakes.

mod openai;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use openai::OpenAiGateway;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm provider returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("llm response decode failed: {0}")]
    Decode(String),
    #[error("no scripted reply available")]
    Exhausted,
}

impl LlmError {
    /// Transient failures are retried once by providers before surfacing.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Transport(_) => true,
            LlmError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

/// Oracle interface over chat-completion and embedding providers.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Free-form chat completion.
    async fn chat(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError>;

    /// Chat completion decoded as JSON: the largest balanced `{...}` region
    /// of the reply is extracted before decoding, so fenced or prose-wrapped
    /// objects still parse.
    async fn json(&self, system: &str, user: &str, temperature: f32) -> Result<Value, LlmError> {
        let reply = self.chat(system, user, temperature, 2048).await?;
        let object = extract_json_object(&reply)
            .ok_or_else(|| LlmError::Decode("no JSON object in reply".to_string()))?;
        serde_json::from_str(object).map_err(|err| LlmError::Decode(err.to_string()))
    }

    /// Fixed-dimension text embedding.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

/// Largest balanced `{...}` region of a reply, brace-counting with string
/// and escape awareness.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut start: Option<usize> = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let s = start.take().expect("open brace recorded");
                        let span = (s, i + 1);
                        if best.map_or(true, |(bs, be)| span.1 - span.0 > be - bs) {
                            best = Some(span);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(s, e)| &text[s..e])
}

/// Deterministic gateway for tests and offline development.
///
/// Replies are matched by marker first (a substring of the user prompt),
/// then drained from a FIFO queue. Embeddings hash the input so identical
/// texts always embed identically.
#[derive(Default)]
pub struct MockGateway {
    responders: Mutex<Vec<(String, String)>>,
    queue: Mutex<VecDeque<Result<String, LlmError>>>,
    chat_calls: AtomicUsize,
    embed_calls: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` whenever the user prompt contains `marker`.
    pub fn stub(&self, marker: impl Into<String>, reply: impl Into<String>) {
        self.responders.lock().push((marker.into(), reply.into()));
    }

    /// Queue a one-shot reply consumed by the next unmatched chat call.
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.queue.lock().push_back(Ok(reply.into()));
    }

    /// Queue a one-shot failure.
    pub fn push_error(&self, error: LlmError) {
        self.queue.lock().push_back(Err(error));
    }

    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::Relaxed)
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::Relaxed)
    }

    /// Deterministic pseudo-embedding: 32 dims derived from a SHA-256 of
    /// the input, normalized into [0, 1].
    pub fn deterministic_embedding(text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.to_lowercase().as_bytes());
        digest.iter().map(|b| *b as f32 / 255.0).collect()
    }
}

#[async_trait]
impl LlmGateway for MockGateway {
    async fn chat(
        &self,
        _system: &str,
        user: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, LlmError> {
        self.chat_calls.fetch_add(1, Ordering::Relaxed);
        {
            let responders = self.responders.lock();
            if let Some((_, reply)) = responders.iter().find(|(marker, _)| user.contains(marker)) {
                return Ok(reply.clone());
            }
        }
        self.queue
            .lock()
            .pop_front()
            .unwrap_or(Err(LlmError::Exhausted))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::Relaxed);
        Ok(Self::deterministic_embedding(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_from_fenced_reply() {
        let reply = "Sure, here you go:\n```json\n{\"steps\": []}\n```\nLet me know!";
        assert_eq!(extract_json_object(reply), Some("{\"steps\": []}"));
    }

    #[test]
    fn extracts_largest_of_several_objects() {
        let reply = r#"{"a":1} and then {"steps":[{"endpoint":"GET /x","params":{}}]}"#;
        let extracted = extract_json_object(reply).unwrap();
        assert!(extracted.contains("steps"));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let reply = r#"{"note":"curly } inside","ok":true}"#;
        let extracted = extract_json_object(reply).unwrap();
        let value: Value = serde_json::from_str(extracted).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn no_object_yields_none() {
        assert!(extract_json_object("plain prose, no json here").is_none());
        assert!(extract_json_object("unbalanced { brace").is_none());
    }

    #[tokio::test]
    async fn mock_prefers_marker_over_queue() {
        let mock = MockGateway::new();
        mock.stub("plan", r#"{"steps":[]}"#);
        mock.push_reply("queued");

        let by_marker = mock.chat("", "make a plan please", 0.0, 16).await.unwrap();
        assert_eq!(by_marker, r#"{"steps":[]}"#);
        let queued = mock.chat("", "anything else", 0.0, 16).await.unwrap();
        assert_eq!(queued, "queued");
        assert!(mock.chat("", "drained", 0.0, 16).await.is_err());
    }

    #[tokio::test]
    async fn mock_embeddings_are_deterministic() {
        let mock = MockGateway::new();
        let a = mock.embed("Find pets").await.unwrap();
        let b = mock.embed("find pets").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn json_helper_decodes_through_extraction() {
        let mock = MockGateway::new();
        mock.push_reply("noise before {\"x\": 42} noise after");
        let value = mock.json("", "prompt", 0.1).await.unwrap();
        assert_eq!(value["x"], 42);
    }

    #[test]
    fn transient_classification() {
        assert!(LlmError::Transport("reset".into()).is_transient());
        assert!(LlmError::Status {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(LlmError::Status {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(!LlmError::Status {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!LlmError::Decode("bad".into()).is_transient());
    }
}
