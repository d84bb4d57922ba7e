//! Transport-agnostic request, response, and streaming-update types.
//!
//! Transport shells (HTTP, WebSocket) marshal in and out of these; the
//! engine itself never sees a socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Credential blob forwarded verbatim to the target service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthBlob {
    Bearer {
        token: String,
    },
    Cookie {
        name: String,
        value: String,
    },
    #[default]
    None,
}

impl AuthBlob {
    pub fn is_none(&self) -> bool {
        matches!(self, AuthBlob::None)
    }
}

/// An incoming chat request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub project_id: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub auth: AuthBlob,
}

impl ChatRequest {
    pub fn new(project_id: u64, message: impl Into<String>) -> Self {
        Self {
            project_id,
            message: message.into(),
            user_id: None,
            auth: AuthBlob::None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_auth(mut self, auth: AuthBlob) -> Self {
        self.auth = auth;
        self
    }
}

/// Execution accounting attached to every terminal response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetails {
    pub plan_steps: usize,
    pub steps_executed: usize,
    pub execution_time_ms: u64,
    pub retry_count: u32,
    pub early_termination: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
}

/// Terminal response for a chat request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_response: Option<Value>,
    pub execution_details: ExecutionDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatResponse {
    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            formatted_response: None,
            visual_response: None,
            execution_details: ExecutionDetails::default(),
            error: Some(error.into()),
        }
    }
}

/// Progress phases surfaced to streaming callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Planning,
    Executing,
    StepCompleted,
    Formatting,
    Completed,
    Error,
}

/// One progressive update emitted while a request runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<usize>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl ChatStreamUpdate {
    pub fn new(kind: UpdateKind, message: impl Into<String>, progress: u8) -> Self {
        Self {
            kind,
            step: None,
            total_steps: None,
            message: message.into(),
            progress: Some(progress),
            data: None,
            execution_time_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn planning(message: impl Into<String>, progress: u8) -> Self {
        Self::new(UpdateKind::Planning, message, progress)
    }

    pub fn step_completed(step: usize, total_steps: usize, message: impl Into<String>) -> Self {
        let progress = 40 + (40 * (step + 1) / total_steps.max(1)) as u8;
        Self {
            step: Some(step),
            total_steps: Some(total_steps),
            ..Self::new(UpdateKind::StepCompleted, message, progress.min(80))
        }
    }

    pub fn formatting(message: impl Into<String>) -> Self {
        Self::new(UpdateKind::Formatting, message, 85)
    }

    pub fn completed(message: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            execution_time_ms: Some(execution_time_ms),
            ..Self::new(UpdateKind::Completed, message, 100)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            progress: None,
            ..Self::new(UpdateKind::Error, message, 0)
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Outcome of one executed plan step.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub index: usize,
    pub endpoint: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satisfies_intent: Option<bool>,
}
