//! OpenAI-compatible chat-completion and embedding provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::config::LlmConfig;

use super::{LlmError, LlmGateway};

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";
const EMBEDDINGS_PATH: &str = "embeddings";

pub struct OpenAiGateway {
    client: Client,
    chat_url: Url,
    embeddings_url: Url,
    chat_model: String,
    embedding_model: String,
    limiter: Arc<Semaphore>,
}

impl OpenAiGateway {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.api_key.as_deref() {
            let auth = format!("Bearer {key}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth)
                    .map_err(|err| LlmError::Transport(format!("invalid api key: {err}")))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| LlmError::Transport(format!("client build failed: {err}")))?;

        let base = normalize_base_url(&config.base_url)?;
        let chat_url = base
            .join(CHAT_COMPLETIONS_PATH)
            .map_err(|err| LlmError::Transport(format!("chat url join failed: {err}")))?;
        let embeddings_url = base
            .join(EMBEDDINGS_PATH)
            .map_err(|err| LlmError::Transport(format!("embeddings url join failed: {err}")))?;

        Ok(Self {
            client,
            chat_url,
            embeddings_url,
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            limiter: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        })
    }

    async fn chat_once(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let _permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| LlmError::Transport(format!("limiter closed: {err}")))?;

        let payload = ChatCompletionRequest {
            model: &self.chat_model,
            messages: vec![
                OutboundMessage {
                    role: "system",
                    content: system,
                },
                OutboundMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature,
            max_tokens,
        };

        let response = self
            .client
            .post(self.chat_url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let decoded: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Decode(err.to_string()))?;
        decoded
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Decode("completion had no content".to_string()))
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let _permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| LlmError::Transport(format!("limiter closed: {err}")))?;

        let payload = EmbeddingRequest {
            model: &self.embedding_model,
            input: text,
        };
        let response = self
            .client
            .post(self.embeddings_url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let decoded: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Decode(err.to_string()))?;
        decoded
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LlmError::Decode("embedding response was empty".to_string()))
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    async fn chat(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        match self.chat_once(system, user, temperature, max_tokens).await {
            Ok(reply) => Ok(reply),
            Err(err) if err.is_transient() => {
                warn!(error = %err, "chat call failed, retrying once");
                self.chat_once(system, user, temperature, max_tokens).await
            }
            Err(err) => Err(err),
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        match self.embed_once(text).await {
            Ok(vector) => {
                debug!(dims = vector.len(), "embedding produced");
                Ok(vector)
            }
            Err(err) if err.is_transient() => {
                warn!(error = %err, "embedding call failed, retrying once");
                self.embed_once(text).await
            }
            Err(err) => Err(err),
        }
    }
}

fn normalize_base_url(raw: &str) -> Result<Url, LlmError> {
    let mut url = Url::parse(raw)
        .map_err(|err| LlmError::Transport(format!("base url parse failed: {err}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    Ok(url)
}

fn classify_transport(err: reqwest::Error) -> LlmError {
    LlmError::Transport(err.to_string())
}

fn status_error(status: StatusCode, body: String) -> LlmError {
    LlmError::Status {
        status: status.as_u16(),
        message: body.chars().take(300).collect(),
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<OutboundMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: InboundMessage,
}

#[derive(Deserialize)]
struct InboundMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}
