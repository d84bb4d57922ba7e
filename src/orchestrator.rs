//! Orchestrator: the public entry point. Wires the context cache, planner,
//! executor, judge and healer into the retry-bounded pipeline and emits
//! progressive updates.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::CatalogStore;
use crate::config::EngineConfig;
use crate::context::ContextCache;
use crate::executor::{ExecutionError, ExecutionOutcome, Executor};
use crate::heal::Healer;
use crate::judge::TerminationJudge;
use crate::llm::LlmGateway;
use crate::plan::ExecutionPlan;
use crate::planner::Planner;
use crate::types::{ChatRequest, ChatResponse, ChatStreamUpdate, ExecutionDetails};

/// External rendering layer: receives the final raw data and the label of
/// the last executed endpoint, returns a structured display object.
#[async_trait]
pub trait ResponseFormatter: Send + Sync {
    async fn format(&self, data: &Value, endpoint_label: &str) -> Option<Value>;
}

/// Default formatter: passes raw data through untouched.
pub struct PassthroughFormatter;

#[async_trait]
impl ResponseFormatter for PassthroughFormatter {
    async fn format(&self, _data: &Value, _endpoint_label: &str) -> Option<Value> {
        None
    }
}

pub struct Orchestrator {
    catalog: Arc<CatalogStore>,
    cache: Arc<ContextCache>,
    planner: Planner,
    executor: Executor,
    judge: TerminationJudge,
    healer: Healer,
    formatter: Arc<dyn ResponseFormatter>,
    retry_budget: u32,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<CatalogStore>,
        cache: Arc<ContextCache>,
        gateway: Arc<dyn LlmGateway>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            planner: Planner::new(Arc::clone(&gateway), config.orchestrator.clone()),
            executor: Executor::new(config.executor.clone()),
            judge: TerminationJudge::new(Arc::clone(&gateway)),
            healer: Healer::new(Arc::clone(&gateway), Arc::clone(&catalog)),
            formatter: Arc::new(PassthroughFormatter),
            retry_budget: config.orchestrator.retry_budget,
            catalog,
            cache,
        }
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn ResponseFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// Blocking entry point: runs the pipeline and returns the terminal
    /// response, discarding progress updates.
    pub async fn process(&self, request: ChatRequest) -> ChatResponse {
        let (sender, _receiver) = mpsc::channel(16);
        self.run(request, sender, CancellationToken::new()).await
    }

    /// Streaming entry point: progress updates are emitted best-effort on
    /// `updates`; a terminal `completed` or `error` update always precedes
    /// the return. Cancellation is honored at every suspension point.
    pub async fn process_stream(
        &self,
        request: ChatRequest,
        updates: mpsc::Sender<ChatStreamUpdate>,
        cancel: CancellationToken,
    ) -> ChatResponse {
        self.run(request, updates, cancel).await
    }

    async fn run(
        &self,
        request: ChatRequest,
        updates: mpsc::Sender<ChatStreamUpdate>,
        cancel: CancellationToken,
    ) -> ChatResponse {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let user_id = request.user_id.as_deref();
        let mut query = request.message.clone();
        let mut retry_count: u32 = 0;

        info!(%request_id, project_id = request.project_id, "chat request accepted");
        emit(&updates, ChatStreamUpdate::planning("Analyzing your request", 10));

        let context = self
            .cache
            .find_relevant(request.project_id, &query, user_id);
        if !context.is_empty() {
            emit(
                &updates,
                ChatStreamUpdate::planning(
                    format!("Found {} related past results", context.len()),
                    20,
                ),
            );
        }

        loop {
            if cancel.is_cancelled() {
                return self.finish_cancelled(&updates, retry_count, started);
            }
            emit(&updates, ChatStreamUpdate::planning("Generating execution plan", 30));

            let snapshot = match self.catalog.snapshot(request.project_id) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    return self.finish_failure(
                        &updates,
                        "The requested project is not registered.",
                        err.to_string(),
                        retry_count,
                        0,
                        0,
                        started,
                    );
                }
            };

            let plan = match self.planner.plan(&snapshot, &query, &context).await {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(%request_id, error = %err, "planning failed");
                    match self
                        .try_heal(&request, &query, &err.to_string(), None, &[], retry_count)
                        .await
                    {
                        Some(corrected) => {
                            query = corrected;
                            retry_count += 1;
                            continue;
                        }
                        None => {
                            return self.finish_failure(
                                &updates,
                                "I couldn't work out a plan for that request.",
                                err.to_string(),
                                retry_count,
                                0,
                                0,
                                started,
                            );
                        }
                    }
                }
            };

            emit(
                &updates,
                ChatStreamUpdate::planning(
                    format!("Plan ready with {} step(s)", plan.steps.len()),
                    40,
                )
                .with_data(json!({
                    "steps": plan.steps.iter().map(|s| s.endpoint.clone()).collect::<Vec<_>>(),
                })),
            );

            let outcome = match self
                .executor
                .execute(
                    &snapshot,
                    &plan,
                    &request.auth,
                    &query,
                    &self.judge,
                    Some(&updates),
                    &cancel,
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(ExecutionError::Cancelled) => {
                    return self.finish_cancelled(&updates, retry_count, started);
                }
                Err(err) => {
                    return self.finish_failure(
                        &updates,
                        "The project's base URL is not usable.",
                        err.to_string(),
                        retry_count,
                        plan.steps.len(),
                        0,
                        started,
                    );
                }
            };

            if outcome.success {
                return self
                    .finish_success(&request, &updates, &plan, outcome, retry_count, started)
                    .await;
            }

            let failure = outcome
                .failure_message
                .clone()
                .unwrap_or_else(|| "plan execution failed".to_string());
            debug!(%request_id, failure = %failure, "pipeline pass failed");
            match self
                .try_heal(
                    &request,
                    &query,
                    &failure,
                    Some(&plan),
                    &outcome.steps,
                    retry_count,
                )
                .await
            {
                Some(corrected) => {
                    query = corrected;
                    retry_count += 1;
                }
                None => {
                    let steps = outcome.steps_executed();
                    return self.finish_failure(
                        &updates,
                        &failure,
                        failure.clone(),
                        retry_count,
                        plan.steps.len(),
                        steps,
                        started,
                    );
                }
            }
        }
    }

    /// One healing attempt, gated by the retry budget.
    async fn try_heal(
        &self,
        request: &ChatRequest,
        query: &str,
        error: &str,
        plan: Option<&ExecutionPlan>,
        results: &[crate::types::StepResult],
        retry_count: u32,
    ) -> Option<String> {
        if retry_count >= self.retry_budget {
            debug!(retry_count, "retry budget exhausted");
            return None;
        }
        self.healer
            .heal(request.project_id, query, error, plan, results)
            .await
    }

    async fn finish_success(
        &self,
        request: &ChatRequest,
        updates: &mpsc::Sender<ChatStreamUpdate>,
        plan: &ExecutionPlan,
        outcome: ExecutionOutcome,
        retry_count: u32,
        started: Instant,
    ) -> ChatResponse {
        emit(updates, ChatStreamUpdate::formatting("Formatting the result"));

        let data = outcome.last_response().cloned();
        let endpoint_label = outcome.last_endpoint().unwrap_or_default().to_string();
        let visual = match &data {
            Some(data) => self.formatter.format(data, &endpoint_label).await,
            None => None,
        };

        let message = if outcome.early_termination {
            outcome
                .termination_reason
                .clone()
                .unwrap_or_else(|| "Request satisfied early.".to_string())
        } else {
            format!("Completed {} step(s) successfully.", outcome.steps_executed())
        };

        self.cache.store_interaction(
            request.project_id,
            request.message.clone(),
            request.user_id.as_deref(),
            Some(endpoint_label),
            data.clone().unwrap_or(Value::Null),
        );
        self.cache.append_history(
            request.user_id.as_deref(),
            request.message.clone(),
            message.clone(),
            true,
        );

        let execution_time_ms = started.elapsed().as_millis() as u64;
        emit(
            updates,
            ChatStreamUpdate::completed("Request completed", execution_time_ms),
        );
        info!(
            steps = outcome.steps_executed(),
            planned = plan.steps.len(),
            retry_count,
            early = outcome.early_termination,
            "chat request completed"
        );

        ChatResponse {
            success: true,
            message,
            data,
            formatted_response: None,
            visual_response: visual,
            execution_details: ExecutionDetails {
                plan_steps: plan.steps.len(),
                steps_executed: outcome.steps_executed(),
                execution_time_ms,
                retry_count,
                early_termination: outcome.early_termination,
                termination_reason: outcome.termination_reason,
            },
            error: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_failure(
        &self,
        updates: &mpsc::Sender<ChatStreamUpdate>,
        message: &str,
        error: String,
        retry_count: u32,
        plan_steps: usize,
        steps_executed: usize,
        started: Instant,
    ) -> ChatResponse {
        emit(updates, ChatStreamUpdate::error(message));
        let mut response = ChatResponse::failure(message, error);
        response.execution_details = ExecutionDetails {
            plan_steps,
            steps_executed,
            execution_time_ms: started.elapsed().as_millis() as u64,
            retry_count,
            early_termination: false,
            termination_reason: None,
        };
        response
    }

    fn finish_cancelled(
        &self,
        updates: &mpsc::Sender<ChatStreamUpdate>,
        retry_count: u32,
        started: Instant,
    ) -> ChatResponse {
        warn!("chat request cancelled");
        emit(updates, ChatStreamUpdate::error("Request cancelled"));
        let mut response = ChatResponse::failure("Request cancelled", "cancelled");
        response.execution_details.retry_count = retry_count;
        response.execution_details.execution_time_ms = started.elapsed().as_millis() as u64;
        response
    }
}

fn emit(updates: &mpsc::Sender<ChatStreamUpdate>, update: ChatStreamUpdate) {
    let _ = updates.try_send(update);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{HttpMethod, NewEndpoint, NewProject};
    use crate::llm::MockGateway;
    use crate::types::UpdateKind;

    #[tokio::test]
    async fn unknown_project_fails_cleanly() {
        let catalog = Arc::new(CatalogStore::new());
        let cache = Arc::new(ContextCache::new());
        let gateway = Arc::new(MockGateway::new());
        let orchestrator =
            Orchestrator::new(catalog, cache, gateway, &EngineConfig::default());

        let response = orchestrator.process(ChatRequest::new(99, "anything")).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("project 99 not found"));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let catalog = Arc::new(CatalogStore::new());
        let project = catalog.create_project(NewProject::new("p", "https://api.example.com"));
        catalog
            .add_endpoint(project.id, NewEndpoint::new(HttpMethod::Get, "/x"))
            .unwrap();
        let orchestrator = Orchestrator::new(
            Arc::clone(&catalog),
            Arc::new(ContextCache::new()),
            Arc::new(MockGateway::new()),
            &EngineConfig::default(),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (sender, mut receiver) = mpsc::channel(16);
        let response = orchestrator
            .process_stream(ChatRequest::new(project.id, "q"), sender, cancel)
            .await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("cancelled"));

        let mut saw_error_update = false;
        while let Ok(update) = receiver.try_recv() {
            if update.kind == UpdateKind::Error {
                saw_error_update = true;
            }
        }
        assert!(saw_error_update);
    }
}
