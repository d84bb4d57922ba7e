//! Plan executor: interpolates parameters, dispatches HTTP calls with
//! credential forwarding, retries transient failures, and consults the
//! termination judge between steps.

use std::time::{Duration, Instant};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, COOKIE};
use reqwest::{Client, Method};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{EndpointDetail, HttpMethod, ParamLocation, ProjectSnapshot};
use crate::config::ExecutorConfig;
use crate::judge::TerminationJudge;
use crate::jsonpath;
use crate::plan::{ExecutionPlan, ParamValue, PlanStep};
use crate::types::{AuthBlob, ChatStreamUpdate, StepResult, UpdateKind};

const MAX_ATTEMPTS: u32 = 2;

/// Unreserved characters survive; everything else in a path segment is
/// percent-encoded.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution cancelled")]
    Cancelled,
    #[error("project base URL '{0}' is not an absolute http(s) URL")]
    InvalidBaseUrl(String),
}

/// Result of running one plan.
#[derive(Clone, Debug, Default)]
pub struct ExecutionOutcome {
    pub steps: Vec<StepResult>,
    pub success: bool,
    pub early_termination: bool,
    pub termination_reason: Option<String>,
    /// User-facing message for the failing step, when the plan failed.
    pub failure_message: Option<String>,
}

impl ExecutionOutcome {
    pub fn steps_executed(&self) -> usize {
        self.steps.len()
    }

    pub fn last_response(&self) -> Option<&Value> {
        self.steps.iter().rev().find_map(|s| s.response.as_ref())
    }

    pub fn last_endpoint(&self) -> Option<&str> {
        self.steps.last().map(|s| s.endpoint.as_str())
    }
}

pub struct Executor {
    client: Client,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Run the plan sequentially. Step failures end the plan and are
    /// reported inside the outcome; only cancellation and an unusable
    /// base URL surface as errors.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        snapshot: &ProjectSnapshot,
        plan: &ExecutionPlan,
        auth: &AuthBlob,
        query: &str,
        judge: &TerminationJudge,
        updates: Option<&mpsc::Sender<ChatStreamUpdate>>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let base_url = self.resolve_base_url(&snapshot.project.base_url)?;
        let total = plan.steps.len();
        let mut outcome = ExecutionOutcome::default();
        let mut steps_ctx: Vec<Value> = Vec::with_capacity(total);

        for (index, step) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            emit(
                updates,
                ChatStreamUpdate {
                    step: Some(index),
                    total_steps: Some(total),
                    ..ChatStreamUpdate::new(
                        UpdateKind::Executing,
                        format!("Executing step {} of {total}: {}", index + 1, step.endpoint),
                        (40 + 40 * index / total.max(1)) as u8,
                    )
                },
            );

            let started = Instant::now();
            let mut result = match self
                .run_step(snapshot, &base_url, step, index, auth, &steps_ctx, cancel)
                .await?
            {
                Ok(result) => result,
                Err(failure) => {
                    let message = self.user_message(snapshot, step, &failure);
                    warn!(step = index, endpoint = %step.endpoint, error = %failure.error,
                        "plan step failed");
                    outcome.steps.push(StepResult {
                        index,
                        endpoint: step.endpoint.clone(),
                        success: false,
                        status_code: failure.status_code,
                        response: failure.body,
                        error: Some(failure.error),
                        duration_ms: started.elapsed().as_millis() as u64,
                        satisfies_intent: None,
                    });
                    outcome.failure_message = Some(message);
                    return Ok(outcome);
                }
            };
            result.duration_ms = started.elapsed().as_millis() as u64;

            steps_ctx.push(serde_json::json!({
                "response": result.response.clone().unwrap_or(Value::Null),
                "statusCode": result.status_code,
            }));

            let is_last = index + 1 == total;
            if !is_last {
                if cancel.is_cancelled() {
                    return Err(ExecutionError::Cancelled);
                }
                let response = result.response.clone().unwrap_or(Value::Null);
                if let Some(reason) = judge
                    .satisfied(query, &step.endpoint, index, total, &response)
                    .await
                {
                    result.satisfies_intent = Some(true);
                    emit(
                        updates,
                        ChatStreamUpdate::step_completed(
                            index,
                            total,
                            format!("Step {} satisfied the request", index + 1),
                        ),
                    );
                    outcome.steps.push(result);
                    outcome.success = true;
                    outcome.early_termination = true;
                    outcome.termination_reason = Some(reason);
                    info!(steps = index + 1, total, "execution terminated early");
                    return Ok(outcome);
                }
                result.satisfies_intent = Some(false);
            }

            emit(
                updates,
                ChatStreamUpdate::step_completed(
                    index,
                    total,
                    format!("Completed step {} of {total}", index + 1),
                )
                .with_data(result.response.clone().unwrap_or(Value::Null)),
            );
            outcome.steps.push(result);
        }

        outcome.success = true;
        Ok(outcome)
    }

    fn resolve_base_url(&self, raw: &str) -> Result<url::Url, ExecutionError> {
        let mut base = url::Url::parse(raw)
            .map_err(|_| ExecutionError::InvalidBaseUrl(raw.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ExecutionError::InvalidBaseUrl(raw.to_string()));
        }
        if let Some(host) = base.host_str().map(|h| h.to_string()) {
            if let Some(prefix) = self.config.host_aliases.get(&host) {
                if !base.path().starts_with(prefix.as_str()) {
                    let merged = format!(
                        "{}{}",
                        prefix.trim_end_matches('/'),
                        base.path().trim_end_matches('/')
                    );
                    base.set_path(&merged);
                    debug!(host = %host, prefix = %prefix, "applied base URL alias");
                }
            }
        }
        Ok(base)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        snapshot: &ProjectSnapshot,
        base_url: &url::Url,
        step: &PlanStep,
        index: usize,
        auth: &AuthBlob,
        steps_ctx: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Result<StepResult, StepFailure>, ExecutionError> {
        let Some(detail) = snapshot.endpoint_by_label(&step.endpoint) else {
            return Ok(Err(StepFailure::internal(format!(
                "endpoint '{}' is not registered",
                step.endpoint
            ))));
        };

        let resolved = match interpolate_params(step, steps_ctx) {
            Ok(resolved) => resolved,
            Err(err) => return Ok(Err(StepFailure::internal(err))),
        };

        let request = match build_request(base_url, detail, &resolved) {
            Ok(parts) => parts,
            Err(err) => return Ok(Err(StepFailure::internal(err))),
        };

        let mut headers = request.headers;
        apply_auth(&mut headers, auth);

        for attempt in 0..MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let mut builder = self
                .client
                .request(to_reqwest_method(detail.endpoint.method), request.url.clone())
                .headers(headers.clone());
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let sent = tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                sent = builder.send() => sent,
            };

            match sent {
                Ok(response) => {
                    let status = response.status();
                    let body_text = response.text().await.unwrap_or_default();
                    let body = decode_body(&body_text);

                    if status.is_success() {
                        debug!(endpoint = %step.endpoint, status = status.as_u16(), "step succeeded");
                        return Ok(Ok(StepResult {
                            index,
                            endpoint: step.endpoint.clone(),
                            success: true,
                            status_code: Some(status.as_u16()),
                            response: Some(body),
                            error: None,
                            duration_ms: 0,
                            satisfies_intent: None,
                        }));
                    }

                    if status.is_server_error() && attempt + 1 < MAX_ATTEMPTS {
                        self.backoff(attempt, cancel).await?;
                        continue;
                    }

                    return Ok(Err(StepFailure {
                        status_code: Some(status.as_u16()),
                        body: Some(body),
                        error: format!("{} returned {}", step.endpoint, status.as_u16()),
                    }));
                }
                Err(err) => {
                    let transient = err.is_timeout() || err.is_connect();
                    if transient && attempt + 1 < MAX_ATTEMPTS {
                        warn!(endpoint = %step.endpoint, error = %err, "transient dispatch failure, retrying");
                        self.backoff(attempt, cancel).await?;
                        continue;
                    }
                    return Ok(Err(StepFailure::internal(format!(
                        "request to {} failed: {err}",
                        step.endpoint
                    ))));
                }
            }
        }

        unreachable!("attempt loop always returns")
    }

    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), ExecutionError> {
        let delay = Duration::from_millis(self.config.backoff_base_ms * (attempt as u64 + 1));
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Message chain: endpoint-specific ResponseMessage, project-wide
    /// ResponseMessage, fixed generic table, raw error.
    fn user_message(
        &self,
        snapshot: &ProjectSnapshot,
        step: &PlanStep,
        failure: &StepFailure,
    ) -> String {
        let Some(status) = failure.status_code else {
            return failure.error.clone();
        };

        let detail = snapshot.endpoint_by_label(&step.endpoint);
        if let Some(message) = detail.and_then(|d| d.message_for_status(status)) {
            return if message.suggestion.is_empty() {
                message.message.clone()
            } else {
                format!("{} {}", message.message, message.suggestion)
            };
        }

        let mut project_wide: Vec<_> = snapshot
            .endpoints
            .iter()
            .flat_map(|d| d.messages.iter())
            .filter(|m| m.status_code == status)
            .collect();
        project_wide.sort_by_key(|m| m.id);
        if let Some(message) = project_wide.first() {
            return message.message.clone();
        }

        generic_status_message(status)
            .map(str::to_string)
            .unwrap_or_else(|| failure.error.clone())
    }
}

struct StepFailure {
    status_code: Option<u16>,
    body: Option<Value>,
    error: String,
}

impl StepFailure {
    fn internal(error: impl Into<String>) -> Self {
        Self {
            status_code: None,
            body: None,
            error: error.into(),
        }
    }
}

struct RequestParts {
    url: url::Url,
    headers: HeaderMap,
    body: Option<Value>,
}

/// Resolve every parameter of a step: references against the accumulated
/// step context, literals as-is.
fn interpolate_params(
    step: &PlanStep,
    steps_ctx: &[Value],
) -> Result<Vec<(String, Value)>, String> {
    let mut resolved = Vec::with_capacity(step.params.len());
    for (name, value) in &step.params {
        let value = match value {
            ParamValue::Literal(v) => v.clone(),
            ParamValue::Reference(step_ref) => {
                let source = steps_ctx
                    .get(step_ref.step)
                    .and_then(|ctx| ctx.get("response"))
                    .ok_or_else(|| {
                        format!("parameter '{name}' references step {} which has no recorded response", step_ref.step)
                    })?;
                jsonpath::resolve(&step_ref.path, source).map_err(|err| {
                    format!("parameter '{name}' could not be resolved: {err}")
                })?
            }
        };
        resolved.push((name.clone(), value));
    }
    Ok(resolved)
}

/// Route parameters by declared location and assemble the outgoing URL,
/// headers and JSON body. Undeclared parameters are dropped with a warning.
fn build_request(
    base_url: &url::Url,
    detail: &EndpointDetail,
    resolved: &[(String, Value)],
) -> Result<RequestParts, String> {
    let mut path = detail.endpoint.path.clone();
    let mut headers = HeaderMap::new();
    let mut query: Vec<(String, String)> = Vec::new();
    let mut body = Map::new();

    for (name, value) in resolved {
        let Some(declared) = detail.parameter(name) else {
            warn!(parameter = %name, endpoint = %detail.endpoint.route_label(),
                "dropping undeclared parameter");
            continue;
        };
        match declared.location {
            ParamLocation::Path => {
                let rendered = value_to_string(value);
                let encoded = utf8_percent_encode(&rendered, PATH_SEGMENT).to_string();
                path = path.replace(&format!("{{{name}}}"), &encoded);
            }
            ParamLocation::Query => {
                query.push((name.clone(), value_to_string(value)));
            }
            ParamLocation::Header => {
                let header_name = HeaderName::from_bytes(name.as_bytes());
                let header_value = HeaderValue::from_str(&value_to_string(value));
                match (header_name, header_value) {
                    (Ok(n), Ok(v)) => {
                        headers.insert(n, v);
                    }
                    _ => warn!(parameter = %name, "dropping unrepresentable header parameter"),
                }
            }
            ParamLocation::Body => {
                body.insert(name.clone(), value.clone());
            }
        }
    }

    if path.contains('{') {
        return Err(format!(
            "path '{path}' still has unfilled segments after interpolation"
        ));
    }

    let mut url = base_url.clone();
    let merged = format!("{}{}", url.path().trim_end_matches('/'), path);
    url.set_path(&merged);
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in &query {
            pairs.append_pair(name, value);
        }
    }

    let body = if detail.endpoint.method.has_body() && !body.is_empty() {
        Some(Value::Object(body))
    } else {
        None
    };

    Ok(RequestParts { url, headers, body })
}

fn apply_auth(headers: &mut HeaderMap, auth: &AuthBlob) {
    match auth {
        AuthBlob::Bearer { token } => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        AuthBlob::Cookie { name, value } => {
            if let Ok(header) = HeaderValue::from_str(&format!("{name}={value}")) {
                headers.insert(COOKIE, header);
            }
        }
        AuthBlob::None => {}
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Options => Method::OPTIONS,
    }
}

/// Non-JSON bodies are stored verbatim as strings.
fn decode_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Fixed user-facing messages for common statuses.
fn generic_status_message(status: u16) -> Option<&'static str> {
    let message = match status {
        400 => "The request was malformed. Some parameters may be missing or invalid.",
        401 => "Authentication is required for this operation.",
        403 => "You are not allowed to perform this operation.",
        404 => "The requested resource was not found.",
        422 => "The service could not process the supplied data.",
        429 => "The service is rate-limiting requests. Try again shortly.",
        500 => "The service encountered an internal error.",
        502 => "The service gateway returned an invalid response.",
        503 => "The service is temporarily unavailable.",
        _ => return None,
    };
    Some(message)
}

fn emit(updates: Option<&mpsc::Sender<ChatStreamUpdate>>, update: ChatStreamUpdate) {
    if let Some(sender) = updates {
        let _ = sender.try_send(update);
    }
}
