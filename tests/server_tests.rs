use actix_web::{test, web, App};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keyrelay::clock::ManualClock;
use keyrelay::conversation_manager::{ConversationConfig, ConversationManager};
use keyrelay::ingress::{IngressConfig, IngressRateLimiter};
use keyrelay::key_registry::{ApiKeyConfig, KeyFile, KeyRegistry, Provider};
use keyrelay::key_selector::KeySelector;
use keyrelay::provider::{
    ProviderClient, ProviderError, ProviderRequest, ProviderResponse, ProviderTarget,
};
use keyrelay::quota::{QuotaManager, QuotaPolicy, QuotaStore};
use keyrelay::quota_memory::MemoryQuotaStore;
use keyrelay::request_router::{RequestRouter, RouterConfig};
use keyrelay::secrets::{ApiSecret, StaticSecretStore};
use keyrelay::server::{config_routes, AppState};

/// Echoes the last user message back, counting calls.
#[derive(Default)]
struct EchoProvider {
    calls: Mutex<u32>,
}

#[async_trait]
impl ProviderClient for EchoProvider {
    async fn send(
        &self,
        _secret: &ApiSecret,
        _target: &ProviderTarget,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ProviderResponse {
            content: format!("echo: {}", last),
            tokens: Some(6),
            raw_status: 200,
            finish_reason: Some("stop".to_string()),
        })
    }
}

fn key(id: &str, model: &str) -> ApiKeyConfig {
    ApiKeyConfig {
        key_id: id.to_string(),
        provider: Provider::Openai,
        model_name: model.to_string(),
        rpm: 100,
        tpm: 1_000_000,
        active: true,
        tags: HashMap::new(),
        base_url: None,
    }
}

fn app_state(ingress: IngressConfig) -> (Arc<ManualClock>, AppState) {
    let clock = ManualClock::shared(100.0);
    let registry = Arc::new(
        KeyRegistry::from_key_file(KeyFile {
            models: vec!["flash".to_string(), "pro".to_string()],
            fallbacks: HashMap::from([("flash".to_string(), vec!["pro".to_string()])]),
            keys: vec![key("k1", "flash"), key("k2", "flash"), key("p1", "pro")],
        })
        .unwrap(),
    );
    let store: Arc<dyn QuotaStore> = Arc::new(MemoryQuotaStore::new(clock.clone()));
    let quota = Arc::new(QuotaManager::new(
        store.clone(),
        clock.clone(),
        "test",
        QuotaPolicy::default(),
    ));
    let secrets = Arc::new(StaticSecretStore::for_keys(["k1", "k2", "p1"]));
    let selector = Arc::new(KeySelector::new(registry, quota, secrets));
    let conversations = Arc::new(ConversationManager::with_store(
        Arc::new(keyrelay::conversation_memory::MemoryConversationStore::new(
            clock.clone(),
            Duration::from_secs(3_600),
        )),
        ConversationConfig::default(),
        clock.clone(),
    ));
    let router = Arc::new(RequestRouter::new(
        selector,
        Arc::new(EchoProvider::default()),
        Some(conversations),
        RouterConfig::default(),
    ));
    let limiter = Arc::new(IngressRateLimiter::new(store, clock.clone(), ingress));
    (clock, AppState::new(router, limiter))
}

macro_rules! init_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state))
                .configure(config_routes),
        )
        .await
    };
}

#[actix_web::test]
async fn status_reports_health_and_routes() {
    let (_clock, state) = app_state(IngressConfig::default());
    let app = init_app!(state);

    let req = test::TestRequest::get().uri("/status").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["name"], "keyrelay");
    assert_eq!(body["health"]["healthy"], true);
    assert_eq!(body["health"]["quota_backend"], "memory");
    assert_eq!(body["health"]["registry"]["total_keys"], 3);
    assert!(body["routes"]
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r == "/v1/one_shot"));
}

#[actix_web::test]
async fn one_shot_returns_router_result() {
    let (_clock, state) = app_state(IngressConfig::default());
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/one_shot")
        .set_json(json!({"prompt": "ping", "model": "flash"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["content"], "echo: ping");
    assert_eq!(body["key_id"], "k1");
    assert_eq!(body["attempts"], 1);
    assert!(body.get("error_type").is_none());
}

#[actix_web::test]
async fn unknown_model_is_bad_request() {
    let (_clock, state) = app_state(IngressConfig::default());
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/v1/one_shot")
        .set_json(json!({"prompt": "ping", "model": "nonexistent"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["type"], "unknown_model");
}

#[actix_web::test]
async fn ingress_limit_returns_429_with_retry_after() {
    let (clock, state) = app_state(IngressConfig {
        user_rpm: 60,
        user_burst: 1,
        ..Default::default()
    });
    let app = init_app!(state);

    let send = |user: &'static str| {
        test::TestRequest::post()
            .uri("/v1/one_shot")
            .insert_header(("x-user-id", user))
            .set_json(json!({"prompt": "hi"}))
            .to_request()
    };

    let resp = test::call_service(&app, send("alice")).await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(&app, send("alice")).await;
    assert_eq!(resp.status(), 429);
    assert_eq!(
        resp.headers().get("retry-after").unwrap().to_str().unwrap(),
        "1"
    );
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["scope"], "user");

    let resp = test::call_service(&app, send("bob")).await;
    assert_eq!(resp.status(), 200);

    let req = test::TestRequest::get()
        .uri("/ingress/users/alice")
        .to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["available"], 0.0);
    assert_eq!(status["capacity"], 1.0);

    let req = test::TestRequest::post()
        .uri("/ingress/users/alice/reset")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let resp = test::call_service(&app, send("alice")).await;
    assert_eq!(resp.status(), 200);

    clock.advance(Duration::from_secs(1));
    let req = test::TestRequest::get().uri("/ingress/global").to_request();
    let global: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(global["scope"], "global");
}

#[actix_web::test]
async fn chat_round_trip_and_conversation_admin() {
    let (_clock, state) = app_state(IngressConfig::default());
    let app = init_app!(state);

    for message in ["first", "second"] {
        let req = test::TestRequest::post()
            .uri("/v1/chat/conv-1")
            .insert_header(("x-user-id", "alice"))
            .set_json(json!({"message": message, "model": "flash"}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["content"], format!("echo: {}", message));
    }

    let req = test::TestRequest::get()
        .uri("/conversations/conv-1")
        .to_request();
    let history: Value = test::call_and_read_body_json(&app, req).await;
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "first");
    assert!(messages[0].get("metadata").is_none());

    let req = test::TestRequest::get()
        .uri("/conversations/conv-1?include_metadata=true&limit=1")
        .to_request();
    let history: Value = test::call_and_read_body_json(&app, req).await;
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["metadata"]["model"], "flash");

    let req = test::TestRequest::get()
        .uri("/conversations/conv-1/metadata")
        .to_request();
    let meta: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(meta["message_count"], 4);
    assert_eq!(meta["last_model"], "flash");
    assert_eq!(meta["user_id"], "alice");

    let req = test::TestRequest::get()
        .uri("/conversations?user_id=alice")
        .to_request();
    let listed: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["conv_id"], "conv-1");

    let req = test::TestRequest::post()
        .uri("/conversations/conv-1/truncate")
        .set_json(json!({"keep_last_n": 2}))
        .to_request();
    let truncated: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(truncated["truncated"], true);

    let req = test::TestRequest::delete()
        .uri("/conversations/conv-1")
        .to_request();
    let deleted: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(deleted["deleted"], true);

    let req = test::TestRequest::get()
        .uri("/conversations/conv-1/metadata")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn key_admin_routes() {
    let (_clock, state) = app_state(IngressConfig::default());
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/keys/k1/unhealthy")
        .set_json(json!({"cooldown_seconds": 90, "reason": "maintenance"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let req = test::TestRequest::get().uri("/keys").to_request();
    let keys: Value = test::call_and_read_body_json(&app, req).await;
    let keys = keys.as_array().unwrap();
    assert_eq!(keys.len(), 3);
    let k1 = keys.iter().find(|k| k["key_id"] == "k1").unwrap();
    assert_eq!(k1["in_cooldown"], true);
    assert_eq!(k1["cooldown_remaining_secs"], 90);

    // cooled key is skipped
    let req = test::TestRequest::post()
        .uri("/v1/one_shot")
        .set_json(json!({"prompt": "hi", "model": "flash"}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["key_id"], "k2");

    let req = test::TestRequest::post()
        .uri("/keys/missing/unhealthy")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post().uri("/keys/reload").to_request();
    let reloaded: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(reloaded["reloaded"], true);
    assert_eq!(reloaded["keys"], 3);
}
