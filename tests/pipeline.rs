//! End-to-end pipeline scenarios: scripted LLM, fake HTTP service.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use apiweaver::catalog::{
    CatalogStore, HttpMethod, NewEndpoint, NewParameter, NewProject, ParamLocation,
};
use apiweaver::context::ContextCache;
use apiweaver::llm::MockGateway;
use apiweaver::types::UpdateKind;
use apiweaver::{AuthBlob, ChatRequest, EngineConfig, Orchestrator};

const PLANNER_MARKER: &str = "Produce the JSON plan";
const JUDGE_MARKER: &str = "Answer YES or NO";
const EXTRACTOR_MARKER: &str = "Propose schema corrections";
const ANALYST_MARKER: &str = "Failure:";

fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.executor.backoff_base_ms = 10;
    config
}

fn orchestrator(catalog: Arc<CatalogStore>, gateway: Arc<MockGateway>) -> Orchestrator {
    Orchestrator::new(
        catalog,
        Arc::new(ContextCache::new()),
        gateway,
        &engine_config(),
    )
}

/// Petstore-style catalog: GET /pet/findByStatus (status required, query)
/// plus GET /user/{username} and GET /orders for multi-step scenarios.
fn seed_catalog(base_url: &str) -> (Arc<CatalogStore>, u64) {
    let catalog = Arc::new(CatalogStore::new());
    let project = catalog.create_project(NewProject::new("petstore", base_url));

    let find = catalog
        .add_endpoint(
            project.id,
            NewEndpoint::new(HttpMethod::Get, "/pet/findByStatus")
                .with_summary("Find pets by status")
                .with_keywords(["pet", "pets", "status", "available"])
                .with_intent_patterns(["find available pets"])
                .with_prompt_text("Finds pets filtered by their adoption status."),
        )
        .unwrap();
    catalog
        .add_parameter(
            find.id,
            NewParameter::new("status", ParamLocation::Query).required(),
        )
        .unwrap();

    let user = catalog
        .add_endpoint(
            project.id,
            NewEndpoint::new(HttpMethod::Get, "/user/{username}")
                .with_summary("Get a user by name")
                .with_keywords(["user", "username"])
                .with_intent_patterns(["get user"]),
        )
        .unwrap();
    catalog
        .add_parameter(
            user.id,
            NewParameter::new("username", ParamLocation::Path).required(),
        )
        .unwrap();

    let orders = catalog
        .add_endpoint(
            project.id,
            NewEndpoint::new(HttpMethod::Get, "/orders")
                .with_summary("List orders for a user")
                .with_keywords(["orders"])
                .with_intent_patterns(["show orders"]),
        )
        .unwrap();
    catalog
        .add_parameter(
            orders.id,
            NewParameter::new("userId", ParamLocation::Query).required(),
        )
        .unwrap();

    (catalog, project.id)
}

#[tokio::test]
async fn single_get_with_literal_param() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pet/findByStatus"))
        .and(query_param("status", "available"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": 1, "name": "Rex"}])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (catalog, project_id) = seed_catalog(&server.uri());
    let gateway = Arc::new(MockGateway::new());
    gateway.stub(JUDGE_MARKER, "NO");
    gateway.stub(
        PLANNER_MARKER,
        r#"{"steps":[{"endpoint":"GET /pet/findByStatus","params":{"status":"available"}}]}"#,
    );

    let orchestrator = orchestrator(catalog, gateway);
    let response = orchestrator
        .process(ChatRequest::new(project_id, "Find available pets"))
        .await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.execution_details.plan_steps, 1);
    assert_eq!(response.execution_details.steps_executed, 1);
    assert_eq!(response.execution_details.retry_count, 0);
    assert!(!response.execution_details.early_termination);
    assert_eq!(response.data, Some(json!([{"id": 1, "name": "Rex"}])));
}

#[tokio::test]
async fn two_step_plan_with_cross_step_reference() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/john_doe"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": 123, "name": "John"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param("userId", "123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"orderId": 9}])))
        .expect(1)
        .mount(&server)
        .await;

    let (catalog, project_id) = seed_catalog(&server.uri());
    let gateway = Arc::new(MockGateway::new());
    gateway.stub(JUDGE_MARKER, "NO");
    gateway.stub(
        PLANNER_MARKER,
        r#"{"steps":[
            {"endpoint":"GET /user/{username}","params":{"username":"john_doe"}},
            {"endpoint":"GET /orders","params":{"userId":"$.steps[0].response.id"}}
        ]}"#,
    );

    let orchestrator = orchestrator(catalog, gateway);
    let response = orchestrator
        .process(ChatRequest::new(
            project_id,
            "Get user john_doe and show his orders",
        ))
        .await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.execution_details.plan_steps, 2);
    assert_eq!(response.execution_details.steps_executed, 2);
    assert_eq!(response.data, Some(json!([{"orderId": 9}])));
}

#[tokio::test]
async fn judge_yes_terminates_early() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user/john_doe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 123})))
        .expect(1)
        .mount(&server)
        .await;
    // No /orders mock: a second call would fail the test's expectations.

    let (catalog, project_id) = seed_catalog(&server.uri());
    let gateway = Arc::new(MockGateway::new());
    gateway.stub(JUDGE_MARKER, "YES");
    gateway.stub(
        PLANNER_MARKER,
        r#"{"steps":[
            {"endpoint":"GET /user/{username}","params":{"username":"john_doe"}},
            {"endpoint":"GET /orders","params":{"userId":"$.steps[0].response.id"}}
        ]}"#,
    );

    let orchestrator = orchestrator(catalog, gateway);
    let response = orchestrator
        .process(ChatRequest::new(project_id, "Who is john_doe?"))
        .await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.execution_details.plan_steps, 2);
    assert_eq!(response.execution_details.steps_executed, 1);
    assert!(response.execution_details.early_termination);
    assert!(response
        .execution_details
        .termination_reason
        .as_deref()
        .unwrap()
        .contains("step 1 of 2"));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn heal_adds_missing_required_parameter_and_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pet"))
        .and(body_partial_json(json!({"photoUrls": ["x"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/pet"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": "photoUrls required"})),
        )
        .mount(&server)
        .await;

    let (catalog, project_id) = seed_catalog(&server.uri());
    let create = catalog
        .add_endpoint(
            project_id,
            NewEndpoint::new(HttpMethod::Post, "/pet")
                .with_summary("Add a pet")
                .with_keywords(["pet", "add", "new"])
                .with_intent_patterns(["add a new pet"]),
        )
        .unwrap();
    catalog
        .add_parameter(
            create.id,
            NewParameter::new("name", ParamLocation::Body).required(),
        )
        .unwrap();

    let gateway = Arc::new(MockGateway::new());
    gateway.stub(JUDGE_MARKER, "NO");
    // Second-pass prompt carries the corrected query, so this stub must
    // be registered before the generic planner stub.
    gateway.stub(
        "photoUrls=['x']",
        r#"{"steps":[{"endpoint":"POST /pet","params":{"name":"Rex","photoUrls":["x"]}}]}"#,
    );
    gateway.stub(
        PLANNER_MARKER,
        r#"{"steps":[{"endpoint":"POST /pet","params":{"name":"Rex"}}]}"#,
    );
    gateway.stub(
        EXTRACTOR_MARKER,
        r#"{"missingParameters":[{"endpointPath":"/pet","method":"POST",
            "parameterName":"photoUrls","parameterType":"array",
            "isRequired":true,"location":"body"}],
            "parameterCorrections":[],"errorMessages":[]}"#,
    );
    gateway.stub(
        ANALYST_MARKER,
        r#"{"shouldRetry":true,"correctedQuery":"Add a new pet with photoUrls=['x']","analysis":"missing field"}"#,
    );

    let orchestrator = orchestrator(Arc::clone(&catalog), gateway);
    let response = orchestrator
        .process(ChatRequest::new(project_id, "Add a new pet"))
        .await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.execution_details.retry_count, 1);
    assert_eq!(response.data, Some(json!({"id": 7})));

    let snapshot = catalog.snapshot(project_id).unwrap();
    let healed = snapshot
        .endpoint_by_label("POST /pet")
        .unwrap()
        .parameter("photoUrls")
        .expect("parameter healed into catalog");
    assert!(healed.required);
    assert_eq!(healed.param_type, "array");
}

#[tokio::test]
async fn retry_budget_exhaustion_caps_pipeline_passes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pet/findByStatus"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (catalog, project_id) = seed_catalog(&server.uri());
    let gateway = Arc::new(MockGateway::new());
    gateway.stub(JUDGE_MARKER, "NO");
    gateway.stub(
        PLANNER_MARKER,
        r#"{"steps":[{"endpoint":"GET /pet/findByStatus","params":{"status":"available"}}]}"#,
    );
    gateway.stub(
        EXTRACTOR_MARKER,
        r#"{"missingParameters":[],"parameterCorrections":[],"errorMessages":[]}"#,
    );
    gateway.stub(
        ANALYST_MARKER,
        r#"{"shouldRetry":true,"correctedQuery":"Find available pets again","analysis":"server trouble"}"#,
    );

    let orchestrator = orchestrator(catalog, gateway);
    let response = orchestrator
        .process(ChatRequest::new(project_id, "Find available pets"))
        .await;

    assert!(!response.success);
    assert_eq!(response.execution_details.retry_count, 2);
    // Three pipeline passes, each dispatching twice (one retry with backoff).
    assert_eq!(server.received_requests().await.unwrap().len(), 6);
}

#[tokio::test]
async fn resolver_fails_open_and_request_still_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pet/findByStatus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let (catalog, project_id) = seed_catalog(&server.uri());
    let gateway = Arc::new(MockGateway::new());
    gateway.stub(JUDGE_MARKER, "NO");
    gateway.stub(
        PLANNER_MARKER,
        r#"{"steps":[{"endpoint":"GET /pet/findByStatus","params":{"status":"available"}}]}"#,
    );

    let orchestrator = orchestrator(catalog, gateway);
    // No token overlaps any keyword or intent pattern.
    let response = orchestrator
        .process(ChatRequest::new(project_id, "zzz qqq xyzzy"))
        .await;

    assert!(response.success, "error: {:?}", response.error);
    assert_eq!(response.execution_details.steps_executed, 1);
}

#[tokio::test]
async fn bearer_auth_is_forwarded_to_the_target_service() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pet/findByStatus"))
        .and(header("authorization", "Bearer caller-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let (catalog, project_id) = seed_catalog(&server.uri());
    let gateway = Arc::new(MockGateway::new());
    gateway.stub(JUDGE_MARKER, "NO");
    gateway.stub(
        PLANNER_MARKER,
        r#"{"steps":[{"endpoint":"GET /pet/findByStatus","params":{"status":"available"}}]}"#,
    );

    let orchestrator = orchestrator(catalog, gateway);
    let response = orchestrator
        .process(
            ChatRequest::new(project_id, "Find available pets").with_auth(AuthBlob::Bearer {
                token: "caller-token".into(),
            }),
        )
        .await;
    assert!(response.success, "error: {:?}", response.error);
}

#[tokio::test]
async fn stream_updates_progress_from_planning_to_completed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pet/findByStatus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let (catalog, project_id) = seed_catalog(&server.uri());
    let gateway = Arc::new(MockGateway::new());
    gateway.stub(JUDGE_MARKER, "NO");
    gateway.stub(
        PLANNER_MARKER,
        r#"{"steps":[{"endpoint":"GET /pet/findByStatus","params":{"status":"available"}}]}"#,
    );

    let orchestrator = orchestrator(catalog, gateway);
    let (sender, mut receiver) = mpsc::channel(64);
    let response = orchestrator
        .process_stream(
            ChatRequest::new(project_id, "Find available pets"),
            sender,
            CancellationToken::new(),
        )
        .await;
    assert!(response.success);

    let mut updates = Vec::new();
    while let Ok(update) = receiver.try_recv() {
        updates.push(update);
    }

    assert_eq!(updates.first().unwrap().kind, UpdateKind::Planning);
    assert_eq!(updates.first().unwrap().progress, Some(10));
    assert!(updates.iter().any(|u| u.kind == UpdateKind::StepCompleted));
    assert!(updates.iter().any(|u| u.kind == UpdateKind::Formatting));

    let last = updates.last().unwrap();
    assert_eq!(last.kind, UpdateKind::Completed);
    assert_eq!(last.progress, Some(100));
    assert!(last.execution_time_ms.is_some());

    // Progress never regresses.
    let progresses: Vec<u8> = updates.iter().filter_map(|u| u.progress).collect();
    for window in progresses.windows(2) {
        assert!(window[0] <= window[1], "progress regressed: {progresses:?}");
    }
}

#[tokio::test]
async fn successful_requests_feed_the_context_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pet/findByStatus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 2}])))
        .mount(&server)
        .await;

    let (catalog, project_id) = seed_catalog(&server.uri());
    let cache = Arc::new(ContextCache::new());
    let gateway = Arc::new(MockGateway::new());
    gateway.stub(JUDGE_MARKER, "NO");
    gateway.stub(
        PLANNER_MARKER,
        r#"{"steps":[{"endpoint":"GET /pet/findByStatus","params":{"status":"available"}}]}"#,
    );

    let orchestrator = Orchestrator::new(
        catalog,
        Arc::clone(&cache),
        gateway,
        &engine_config(),
    );
    let response = orchestrator
        .process(ChatRequest::new(project_id, "Find available pets").with_user("alice"))
        .await;
    assert!(response.success);

    let related = cache.find_relevant(project_id, "available pets", Some("alice"));
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].endpoint.as_deref(), Some("GET /pet/findByStatus"));
    assert_eq!(cache.history(Some("alice")).len(), 1);
}
