//! Planner: turns a user query plus ranked endpoint candidates into a
//! validated execution plan, with a deterministic fallback when the LLM
//! cannot produce one.

use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::{EndpointDetail, ProjectSnapshot};
use crate::config::OrchestratorConfig;
use crate::context::CachedInteraction;
use crate::llm::LlmGateway;
use crate::plan::{ExecutionPlan, PlanError, PlanStep, PlanValidator};
use crate::resolver::{IntentResolver, ScoredEndpoint};

const PLANNING_TEMPERATURE: f32 = 0.1;
const CONTEXT_SNIPPET_LEN: usize = 200;

const SYSTEM_PROMPT: &str = "You translate user requests into API execution plans. \
Reply with JSON only: an object with a \"steps\" array. Each step has an \
\"endpoint\" (exactly \"METHOD PATH\" from the candidate list) and a \"params\" \
object. Parameter values are literals, or references of the form \
\"$.steps[i].response.<path>\" naming data returned by an earlier step i.";

pub struct Planner {
    gateway: Arc<dyn LlmGateway>,
    resolver: IntentResolver,
    validator: PlanValidator,
    limits: OrchestratorConfig,
}

impl Planner {
    pub fn new(gateway: Arc<dyn LlmGateway>, limits: OrchestratorConfig) -> Self {
        let resolver = IntentResolver::new(Arc::clone(&gateway));
        Self {
            gateway,
            resolver,
            validator: PlanValidator,
            limits,
        }
    }

    /// Produce a validated plan for `query` against the snapshot.
    pub async fn plan(
        &self,
        snapshot: &ProjectSnapshot,
        query: &str,
        context: &[CachedInteraction],
    ) -> Result<ExecutionPlan, PlanError> {
        if snapshot.endpoints.is_empty() {
            return Err(PlanError::NoSuitablePlan);
        }

        let mut ranked = self.resolver.resolve(snapshot, query).await;
        ranked.truncate(self.limits.top_candidates);

        let prompt = self.build_prompt(snapshot, query, context, &ranked);
        let plan = match self
            .gateway
            .json(SYSTEM_PROMPT, &prompt, PLANNING_TEMPERATURE)
            .await
        {
            Ok(reply) => match ExecutionPlan::from_json(&reply) {
                Ok(plan) if plan.is_empty() => {
                    debug!("planner returned an empty plan, falling back");
                    self.fallback(snapshot)?
                }
                Ok(plan) => plan,
                Err(err) => {
                    warn!(error = %err, "plan JSON did not decode, falling back");
                    self.fallback(snapshot)?
                }
            },
            Err(err) => {
                warn!(error = %err, "plan generation failed, falling back");
                self.fallback(snapshot)?
            }
        };

        self.validator.validate(&plan, snapshot)?;
        Ok(plan)
    }

    /// Simplest viable plan: the first `GET` endpoint with no path
    /// parameters and no required parameters, else any endpoint without
    /// required parameters. Snapshot order is `(method, path)` lex, so the
    /// choice is deterministic.
    fn fallback(&self, snapshot: &ProjectSnapshot) -> Result<ExecutionPlan, PlanError> {
        let simple_get = snapshot.endpoints.iter().find(|d| {
            d.endpoint.method == crate::catalog::HttpMethod::Get
                && !d.has_path_parameters()
                && d.required_parameters().next().is_none()
        });
        let chosen = simple_get.or_else(|| {
            snapshot
                .endpoints
                .iter()
                .find(|d| d.required_parameters().next().is_none())
        });
        match chosen {
            Some(detail) => {
                debug!(endpoint = %detail.endpoint.route_label(), "fallback plan selected");
                Ok(ExecutionPlan::single(PlanStep::new(
                    detail.endpoint.route_label(),
                )))
            }
            None => Err(PlanError::NoSuitablePlan),
        }
    }

    fn build_prompt(
        &self,
        snapshot: &ProjectSnapshot,
        query: &str,
        context: &[CachedInteraction],
        ranked: &[ScoredEndpoint],
    ) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "User request: {query}");

        if !context.is_empty() {
            let _ = writeln!(prompt, "\nRecent related results:");
            for entry in context {
                let snippet = truncate(&to_snippet(&entry.data), CONTEXT_SNIPPET_LEN);
                let endpoint = entry.endpoint.as_deref().unwrap_or("-");
                let _ = writeln!(prompt, "- \"{}\" via {} -> {}", entry.query, endpoint, snippet);
            }
        }

        let _ = writeln!(prompt, "\nCandidate endpoints:");
        let candidates: Vec<&EndpointDetail> = ranked
            .iter()
            .take(self.limits.prompt_candidates)
            .filter_map(|s| {
                snapshot
                    .endpoints
                    .iter()
                    .find(|d| d.endpoint.id == s.endpoint_id)
            })
            .collect();
        for detail in &candidates {
            let _ = writeln!(prompt, "- {}", render_candidate(detail));
        }

        let hints = field_link_hints(snapshot, &candidates, self.limits.field_link_hints);
        if !hints.is_empty() {
            let _ = writeln!(prompt, "\nData-flow hints:");
            for hint in hints {
                let _ = writeln!(prompt, "- {hint}");
            }
        }

        let _ = writeln!(
            prompt,
            "\nProduce the JSON plan now. Use only listed endpoints, include \
every required parameter, and reference earlier steps as \
\"$.steps[i].response.<path>\" where needed."
        );
        prompt
    }
}

fn render_candidate(detail: &EndpointDetail) -> String {
    let mut line = detail.endpoint.route_label();
    if !detail.endpoint.summary.is_empty() {
        let _ = write!(line, " — {}", detail.endpoint.summary);
    }
    if !detail.parameters.is_empty() {
        let params: Vec<String> = detail
            .parameters
            .iter()
            .map(|p| {
                format!(
                    "{}({}{})",
                    p.name,
                    p.location,
                    if p.required { ", required" } else { "" }
                )
            })
            .collect();
        let _ = write!(line, ". Params: {}", params.join(", "));
    }
    line
}

/// Render up to `cap` field links of the candidates as
/// `fromPath from "METHOD PATH" -> toParam in "METHOD PATH"`.
fn field_link_hints(
    snapshot: &ProjectSnapshot,
    candidates: &[&EndpointDetail],
    cap: usize,
) -> Vec<String> {
    let mut hints = Vec::new();
    for detail in candidates {
        for link in &detail.field_links {
            if hints.len() >= cap {
                return hints;
            }
            let from_path = detail
                .response_fields
                .iter()
                .find(|f| f.id == link.from_field_id)
                .map(|f| f.json_path.as_str())
                .unwrap_or("$");
            let to_route = snapshot
                .endpoints
                .iter()
                .find(|d| d.endpoint.id == link.to_endpoint_id)
                .map(|d| d.endpoint.route_label());
            if let Some(to_route) = to_route {
                hints.push(format!(
                    "{} from \"{}\" -> {} in \"{}\"",
                    from_path,
                    detail.endpoint.route_label(),
                    link.to_param_name,
                    to_route
                ));
            }
        }
    }
    hints
}

fn to_snippet(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        CatalogStore, HttpMethod, NewEndpoint, NewParameter, NewProject, ParamLocation,
    };
    use crate::llm::MockGateway;
    use serde_json::json;

    fn petstore() -> (CatalogStore, u64) {
        let store = CatalogStore::new();
        let project = store.create_project(NewProject::new("petstore", "https://api.example.com"));
        let find = store
            .add_endpoint(
                project.id,
                NewEndpoint::new(HttpMethod::Get, "/pet/findByStatus")
                    .with_summary("Find pets by status")
                    .with_keywords(["pet", "status"])
                    .with_intent_patterns(["find available pets"]),
            )
            .unwrap();
        store
            .add_parameter(
                find.id,
                NewParameter::new("status", ParamLocation::Query).required(),
            )
            .unwrap();
        store
            .add_endpoint(
                project.id,
                NewEndpoint::new(HttpMethod::Get, "/store/inventory")
                    .with_summary("Store inventory"),
            )
            .unwrap();
        (store, project.id)
    }

    fn planner_with(gateway: Arc<MockGateway>) -> Planner {
        Planner::new(gateway, OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn llm_plan_is_parsed_and_validated() {
        let (store, project_id) = petstore();
        let snapshot = store.snapshot(project_id).unwrap();
        let gateway = Arc::new(MockGateway::new());
        gateway.stub(
            "User request:",
            r#"{"steps":[{"endpoint":"GET /pet/findByStatus","params":{"status":"available"}}]}"#,
        );

        let plan = planner_with(Arc::clone(&gateway))
            .plan(&snapshot, "Find available pets", &[])
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].endpoint, "GET /pet/findByStatus");
    }

    #[tokio::test]
    async fn empty_steps_fall_back_to_parameterless_get() {
        let (store, project_id) = petstore();
        let snapshot = store.snapshot(project_id).unwrap();
        let gateway = Arc::new(MockGateway::new());
        gateway.stub("User request:", r#"{"steps":[]}"#);

        let plan = planner_with(gateway)
            .plan(&snapshot, "anything", &[])
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 1);
        // /pet/findByStatus requires `status`; the fallback must skip it.
        assert_eq!(plan.steps[0].endpoint, "GET /store/inventory");
        assert!(plan.steps[0].params.is_empty());
    }

    #[tokio::test]
    async fn llm_failure_also_falls_back() {
        let (store, project_id) = petstore();
        let snapshot = store.snapshot(project_id).unwrap();
        // Exhausted mock: every chat call errors.
        let gateway = Arc::new(MockGateway::new());

        let plan = planner_with(gateway)
            .plan(&snapshot, "anything", &[])
            .await
            .unwrap();
        assert_eq!(plan.steps[0].endpoint, "GET /store/inventory");
    }

    #[tokio::test]
    async fn unknown_endpoint_from_llm_is_a_validation_error() {
        let (store, project_id) = petstore();
        let snapshot = store.snapshot(project_id).unwrap();
        let gateway = Arc::new(MockGateway::new());
        gateway.stub(
            "User request:",
            r#"{"steps":[{"endpoint":"GET /made-up","params":{}}]}"#,
        );

        let err = planner_with(gateway)
            .plan(&snapshot, "anything", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::UnknownEndpoint(_)));
    }

    #[tokio::test]
    async fn empty_catalog_is_a_clean_failure() {
        let store = CatalogStore::new();
        let project = store.create_project(NewProject::new("empty", "https://api.example.com"));
        let snapshot = store.snapshot(project.id).unwrap();
        let gateway = Arc::new(MockGateway::new());

        let err = planner_with(gateway)
            .plan(&snapshot, "anything", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::NoSuitablePlan));
    }

    #[tokio::test]
    async fn prompt_lists_candidates_context_and_hints() {
        let (store, project_id) = petstore();
        // Wire a field link: findByStatus response id -> inventory param petId.
        let snapshot = store.snapshot(project_id).unwrap();
        let find = snapshot.endpoint_by_label("GET /pet/findByStatus").unwrap();
        let inventory = snapshot.endpoint_by_label("GET /store/inventory").unwrap();
        let field = store
            .add_response_field(find.endpoint.id, "$[0].id", "integer", "first pet id")
            .unwrap();
        store
            .add_field_link(field.id, inventory.endpoint.id, "petId", "feeds", "")
            .unwrap();
        let snapshot = store.snapshot(project_id).unwrap();

        let gateway = Arc::new(MockGateway::new());
        let planner = planner_with(gateway);
        let ranked = planner.resolver.resolve(&snapshot, "find pets").await;
        let context = vec![CachedInteraction {
            project_id,
            query: "find available pets".into(),
            normalized_query: "available pets".into(),
            user_id: None,
            endpoint: Some("GET /pet/findByStatus".into()),
            data: json!([{"id": 1}]),
            created_at: chrono::Utc::now(),
        }];

        let prompt = planner.build_prompt(&snapshot, "find pets", &context, &ranked);
        assert!(prompt.contains("GET /pet/findByStatus — Find pets by status"));
        assert!(prompt.contains("status(query, required)"));
        assert!(prompt.contains("Recent related results:"));
        assert!(prompt.contains("$[0].id from \"GET /pet/findByStatus\" -> petId in \"GET /store/inventory\""));
    }
}
