use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use task_market_runtime::background::BackgroundRunner;
use task_market_runtime::budget_gate::BudgetGate;
use task_market_runtime::dispatcher::Dispatcher;
use task_market_runtime::domain::{Account, Agent, AgentAvailability, AgentRole};
use task_market_runtime::ledger::Ledger;
use task_market_runtime::matchmaker::Matchmaker;
use task_market_runtime::schema_registry::SchemaRegistry;
use task_market_runtime::server::{build_router, AppState};
use task_market_runtime::store::{InMemoryStore, Store};

struct Harness {
    router: Router,
    store: Arc<InMemoryStore>,
    platform_account_id: Uuid,
}

fn bearer(agent_id: Uuid) -> String {
    format!("Bearer agent:{agent_id}")
}

async fn build_harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let dyn_store: Arc<dyn Store> = store.clone();
    let schema_registry = Arc::new(
        SchemaRegistry::load_from_dir(&PathBuf::from("config/capabilities")).unwrap(),
    );
    let ledger = Arc::new(Ledger::new(dyn_store.clone()));
    let budget_gate = Arc::new(BudgetGate::new(dyn_store.clone(), chrono::FixedOffset::east_opt(0).unwrap()));
    let matchmaker = Arc::new(Matchmaker::new(dyn_store.clone()));
    let platform_account_id = Uuid::new_v4();
    let dispatcher = Arc::new(Dispatcher::new(
        dyn_store.clone(),
        ledger.clone(),
        matchmaker,
        schema_registry.clone(),
        platform_account_id,
        "http://test-harness.invalid".to_string(),
    ));
    let runner = Arc::new(BackgroundRunner::new(dyn_store.clone(), dispatcher.clone(), 4));
    runner.spawn();

    store
        .seed_account(Account {
            account_id: platform_account_id,
            balance: 0,
            per_task_cap: None,
            per_day_cap: None,
            is_system: true,
            created_at: Utc::now(),
        })
        .await;

    let state = AppState {
        store: dyn_store,
        ledger,
        budget_gate,
        schema_registry,
        dispatcher,
        db: None,
    };
    Harness {
        router: build_router(state),
        store,
        platform_account_id,
    }
}

async fn seed_requester(store: &InMemoryStore, balance: i64, per_task_cap: Option<i64>) -> (Uuid, Uuid) {
    let account_id = Uuid::new_v4();
    let agent_id = Uuid::new_v4();
    store
        .seed_account(Account {
            account_id,
            balance,
            per_task_cap,
            per_day_cap: None,
            is_system: false,
            created_at: Utc::now(),
        })
        .await;
    store
        .seed_agent(Agent {
            agent_id,
            account_id,
            role: AgentRole::Requester,
            availability: AgentAvailability::Online,
            endpoint_url: None,
            capability_prices: Default::default(),
            avg_response_ms: 0.0,
            success_rate: None,
            reputation: None,
            schema_compliance: None,
            created_at: Utc::now(),
        })
        .await;
    (account_id, agent_id)
}

async fn seed_worker(store: &InMemoryStore, capability: &str, price: i64, endpoint: &str) -> (Uuid, Uuid) {
    let account_id = Uuid::new_v4();
    let agent_id = Uuid::new_v4();
    store
        .seed_account(Account {
            account_id,
            balance: 0,
            per_task_cap: None,
            per_day_cap: None,
            is_system: false,
            created_at: Utc::now(),
        })
        .await;
    let mut prices = std::collections::BTreeMap::new();
    prices.insert(capability.to_string(), price);
    store
        .seed_agent(Agent {
            agent_id,
            account_id,
            role: AgentRole::Worker,
            availability: AgentAvailability::Online,
            endpoint_url: Some(endpoint.to_string()),
            capability_prices: prices,
            avg_response_ms: 100.0,
            success_rate: Some(0.9),
            reputation: Some(0.9),
            schema_compliance: Some(0.9),
            created_at: Utc::now(),
        })
        .await;
    (account_id, agent_id)
}

/// Spawns a fake worker HTTP server that replies with a fixed status code to
/// every dispatch POST, and returns its base endpoint URL.
async fn spawn_fake_worker(status: StatusCode) -> String {
    let app = Router::new().route(
        "/dispatch",
        post(move || async move { status }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/dispatch")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn poll_status(router: &Router, agent_token: &str, task_id: Uuid, want: &str, timeout: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(format!("/v1/tasks/{task_id}"))
                    .header("authorization", agent_token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let task = body_json(response).await;
        if task["status"] == want {
            return task;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for status {want}, last seen: {task:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn settlement_split_and_duplicate_settle_is_rejected() {
    let harness = build_harness().await;
    let (_requester_account, requester_agent) = seed_requester(&harness.store, 1000, None).await;
    let worker_endpoint = spawn_fake_worker(StatusCode::OK).await;
    let (worker_account, worker_agent) = seed_worker(&harness.store, "summarize", 10, &worker_endpoint).await;
    let requester_token = bearer(requester_agent);
    let worker_token = bearer(worker_agent);

    let create_response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tasks")
                .header("authorization", &requester_token)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "capability": "summarize",
                        "input_payload": {"text": "a document to summarize"},
                        "budget": 100
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), StatusCode::ACCEPTED);
    let created = body_json(create_response).await;
    let task_id: Uuid = created["task_id"].as_str().unwrap().parse().unwrap();
    assert_eq!(harness.store.balance_of(_requester_account).await, 900);

    poll_status(&harness.router, &requester_token, task_id, "in_progress", Duration::from_secs(5)).await;

    let settle_response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/tasks/{task_id}/result"))
                .header("authorization", &worker_token)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "output_status": "success",
                        "actual_cost": 80,
                        "output_payload": {"summary": "done"}
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(settle_response.status(), StatusCode::OK);
    let settled = body_json(settle_response).await;
    assert_eq!(settled["status"], "completed");
    assert_eq!(settled["actual_cost"], 80);
    assert_eq!(settled["platform_fee"], 8);

    assert_eq!(harness.store.balance_of(_requester_account).await, 920);
    assert_eq!(harness.store.balance_of(worker_account).await, 72);
    assert_eq!(harness.store.balance_of(harness.platform_account_id).await, 8);

    let duplicate_response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/tasks/{task_id}/result"))
                .header("authorization", &worker_token)
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"output_status": "success", "actual_cost": 80, "output_payload": {}}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(duplicate_response.status(), StatusCode::CONFLICT);
    assert_eq!(harness.store.balance_of(worker_account).await, 72);
}

#[tokio::test]
async fn schema_rejection_leaves_ledger_untouched() {
    let harness = build_harness().await;
    let (requester_account, requester_agent) = seed_requester(&harness.store, 1000, None).await;

    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tasks")
                .header("authorization", bearer(requester_agent))
                .header("content-type", "application/json")
                .body(Body::from(json!({"capability": "research", "input_payload": {"query": "ab"}, "budget": 10}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(harness.store.balance_of(requester_account).await, 1000);
}

#[tokio::test]
async fn budget_above_per_task_cap_is_forbidden() {
    let harness = build_harness().await;
    let (requester_account, requester_agent) = seed_requester(&harness.store, 1000, Some(4)).await;

    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tasks")
                .header("authorization", bearer(requester_agent))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "capability": "data_extraction",
                        "input_payload": {"document_url": "https://example.test/doc", "fields": ["title"]},
                        "budget": 5
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(harness.store.balance_of(requester_account).await, 1000);
}

#[tokio::test]
async fn exhausted_dispatch_attempts_refund_in_full() {
    let harness = build_harness().await;
    let (requester_account, requester_agent) = seed_requester(&harness.store, 500, None).await;
    for _ in 0..3 {
        let endpoint = spawn_fake_worker(StatusCode::INTERNAL_SERVER_ERROR).await;
        seed_worker(&harness.store, "summarize", 10, &endpoint).await;
    }
    let requester_token = bearer(requester_agent);

    let create_response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tasks")
                .header("authorization", &requester_token)
                .header("content-type", "application/json")
                .body(Body::from(json!({"capability": "summarize", "input_payload": {"text": "retry me"}, "budget": 50}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), StatusCode::ACCEPTED);
    let created = body_json(create_response).await;
    let task_id: Uuid = created["task_id"].as_str().unwrap().parse().unwrap();

    let failed = poll_status(&harness.router, &requester_token, task_id, "failed", Duration::from_secs(5)).await;
    assert_eq!(failed["retry_count"], 3);
    assert_eq!(harness.store.balance_of(requester_account).await, 500);
}

#[tokio::test]
async fn insufficient_funds_rejects_admission_without_going_negative() {
    let harness = build_harness().await;
    let (requester_account, requester_agent) = seed_requester(&harness.store, 10, None).await;

    let response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tasks")
                .header("authorization", bearer(requester_agent))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"capability": "summarize", "input_payload": {"text": "too expensive"}, "budget": 50}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(harness.store.balance_of(requester_account).await, 10);
}

#[tokio::test]
async fn budget_above_per_day_cap_is_forbidden_on_second_task() {
    let harness = build_harness().await;
    let (requester_account, requester_agent) = seed_requester(&harness.store, 1000, None).await;
    harness
        .store
        .seed_account(Account {
            account_id: requester_account,
            balance: 1000,
            per_task_cap: None,
            per_day_cap: Some(60),
            is_system: false,
            created_at: Utc::now(),
        })
        .await;
    let requester_token = bearer(requester_agent);

    let first = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tasks")
                .header("authorization", &requester_token)
                .header("content-type", "application/json")
                .body(Body::from(json!({"capability": "summarize", "input_payload": {"text": "first"}, "budget": 50}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tasks")
                .header("authorization", &requester_token)
                .header("content-type", "application/json")
                .body(Body::from(json!({"capability": "summarize", "input_payload": {"text": "second"}, "budget": 20}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::FORBIDDEN);
    assert_eq!(harness.store.balance_of(requester_account).await, 950);
}

#[tokio::test]
async fn callback_from_non_assigned_agent_is_rejected() {
    let harness = build_harness().await;
    let (_requester_account, requester_agent) = seed_requester(&harness.store, 1000, None).await;
    let worker_endpoint = spawn_fake_worker(StatusCode::OK).await;
    let (worker_account, _worker_agent) = seed_worker(&harness.store, "summarize", 10, &worker_endpoint).await;
    let (_impostor_account, impostor_agent) = seed_requester(&harness.store, 0, None).await;
    let requester_token = bearer(requester_agent);

    let create_response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tasks")
                .header("authorization", &requester_token)
                .header("content-type", "application/json")
                .body(Body::from(json!({"capability": "summarize", "input_payload": {"text": "guard the callback"}, "budget": 100}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(create_response.status(), StatusCode::ACCEPTED);
    let created = body_json(create_response).await;
    let task_id: Uuid = created["task_id"].as_str().unwrap().parse().unwrap();

    poll_status(&harness.router, &requester_token, task_id, "in_progress", Duration::from_secs(5)).await;

    let impostor_response = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/tasks/{task_id}/result"))
                .header("authorization", bearer(impostor_agent))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"output_status": "success", "actual_cost": 100, "output_payload": {}}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(impostor_response.status(), StatusCode::FORBIDDEN);
    let still_in_progress = harness
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/v1/tasks/{task_id}"))
                .header("authorization", &requester_token)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let task = body_json(still_in_progress).await;
    assert_eq!(task["status"], "in_progress");
    assert_eq!(harness.store.balance_of(worker_account).await, 0);
}
