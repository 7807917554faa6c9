//! REST engine end-to-end behavior against a mock API server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;
use wiremock::matchers::{header, header_regex, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use lanyard::model::Snowflake;
use lanyard::rest::{ApiRequest, CreateMessage, Priority};
use lanyard::{ClientConfig, Error, RestEngine};

fn test_config(server: &MockServer) -> ClientConfig {
    let mut config = ClientConfig::new("test_token_12345");
    config.api_url = server.uri();
    config.retry.base_delay_ms = 10;
    config.retry.jitter = false;
    config.timeouts.total = Duration::from_secs(5);
    config
}

fn user_body() -> serde_json::Value {
    json!({
        "id": "123456789",
        "username": "TestBot",
        "discriminator": "0",
        "bot": true
    })
}

#[tokio::test]
async fn current_user_sends_auth_and_user_agent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .and(header("Authorization", "Bot test_token_12345"))
        .and(header_regex("user-agent", "^Lanyard/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(1)
        .mount(&server)
        .await;

    let engine = RestEngine::new(&test_config(&server)).unwrap();
    let user = engine.get_current_user().await.unwrap();
    assert_eq!(user.id, Snowflake(123_456_789));
    assert_eq!(user.username, "TestBot");
    assert!(user.bot);
}

#[tokio::test]
async fn unauthorized_is_a_terminal_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "code": 0,
            "message": "401: Unauthorized"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let engine = RestEngine::new(&test_config(&server)).unwrap();
    let err = engine.get_current_user().await.unwrap_err();
    assert!(matches!(err, Error::Auth { status: 401, .. }));
    assert!(!err.is_retryable());
}

struct RateLimitOnce {
    hits: AtomicUsize,
}

impl Respond for RateLimitOnce {
    fn respond(&self, _: &Request) -> ResponseTemplate {
        if self.hits.fetch_add(1, Ordering::SeqCst) == 0 {
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "0.05")
                .insert_header("X-RateLimit-Scope", "user")
                .set_body_json(json!({
                    "message": "You are being rate limited.",
                    "retry_after": 0.05,
                    "global": false
                }))
        } else {
            ResponseTemplate::new(200).set_body_json(user_body())
        }
    }
}

#[tokio::test]
async fn rate_limited_request_requeues_without_spending_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(RateLimitOnce {
            hits: AtomicUsize::new(0),
        })
        .expect(2)
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    // Zero retry budget: proves the 429 requeue does not consume it.
    config.retry.max_attempts = 0;
    let engine = RestEngine::new(&config).unwrap();

    let started = Instant::now();
    let user = engine.get_current_user().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(45));
    assert_eq!(user.username, "TestBot");
}

struct FailFirst {
    hits: AtomicUsize,
    failures: usize,
}

impl Respond for FailFirst {
    fn respond(&self, _: &Request) -> ResponseTemplate {
        if self.hits.fetch_add(1, Ordering::SeqCst) < self.failures {
            ResponseTemplate::new(502).set_body_json(json!({"message": "Bad Gateway"}))
        } else {
            ResponseTemplate::new(200).set_body_json(user_body())
        }
    }
}

#[tokio::test]
async fn server_errors_retry_with_backoff_then_succeed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(FailFirst {
            hits: AtomicUsize::new(0),
            failures: 2,
        })
        .expect(3)
        .mount(&server)
        .await;

    let engine = RestEngine::new(&test_config(&server)).unwrap();
    let response = engine.execute(ApiRequest::get("/users/@me")).await.unwrap();
    assert_eq!(response.timing.attempts, 3);
}

#[tokio::test]
async fn retries_exhaust_into_a_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"message": "down"})))
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.retry.max_attempts = 1;
    let engine = RestEngine::new(&config).unwrap();

    let err = engine.get_current_user().await.unwrap_err();
    assert!(matches!(err, Error::Api { status: 503, .. }));
}

#[tokio::test]
async fn repeated_failures_open_the_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "boom"})))
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.retry.max_attempts = 0;
    config.circuit.failure_threshold = 5;
    config.circuit.open_timeout = Duration::from_secs(60);
    let engine = RestEngine::new(&config).unwrap();

    for _ in 0..5 {
        let err = engine.get_current_user().await.unwrap_err();
        assert!(matches!(err, Error::Api { status: 500, .. }));
    }

    // Sixth call fails fast without touching the server.
    let err = engine.get_current_user().await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert!(err.retry_after().is_some());
}

#[tokio::test]
async fn response_headers_drive_the_bucket_window() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/channels/42"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Limit", "2")
                .insert_header("X-RateLimit-Remaining", "0")
                .insert_header("X-RateLimit-Reset-After", "0.08")
                .insert_header("X-RateLimit-Bucket", "chan42")
                .set_body_json(json!({"id": "42", "type": 0, "name": "general"})),
        )
        .mount(&server)
        .await;

    let engine = RestEngine::new(&test_config(&server)).unwrap();
    engine.get_channel(Snowflake(42)).await.unwrap();

    // The window is dry; the next call waits out reset-after.
    let started = Instant::now();
    engine.get_channel(Snowflake(42)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(70));
}

#[tokio::test]
async fn global_rate_limit_pauses_unrelated_routes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "0.08")
                .insert_header("X-RateLimit-Global", "true")
                .set_body_json(json!({"message": "global limit", "retry_after": 0.08, "global": true})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guilds/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "9",
            "name": "Test Server"
        })))
        .mount(&server)
        .await;

    let engine = RestEngine::new(&test_config(&server)).unwrap();
    let started = Instant::now();
    engine.get_current_user().await.unwrap();

    // A completely different route also waits out the global pause.
    engine.get_guild(Snowflake(9)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(70));
}

#[tokio::test]
async fn audit_log_reason_is_percent_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/channels/1/messages/2"))
        .and(header("X-Audit-Log-Reason", "spam%20cleanup"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let engine = RestEngine::new(&test_config(&server)).unwrap();
    engine
        .execute(
            ApiRequest::delete("/channels/1/messages/2").audit_log_reason("spam cleanup"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn create_message_round_trips_embeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/channels/987654321/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "111222333",
            "channel_id": "987654321",
            "content": "",
            "timestamp": "2024-01-01T00:00:00.000000+00:00",
            "embeds": [{
                "title": "Test Embed",
                "description": "This is a test embed",
                "color": 16711680
            }]
        })))
        .mount(&server)
        .await;

    let engine = RestEngine::new(&test_config(&server)).unwrap();
    let embed = lanyard::model::EmbedBuilder::new()
        .title("Test Embed")
        .description("This is a test embed")
        .color(0xFF0000)
        .build()
        .unwrap();

    let message = engine
        .create_message(
            Snowflake(987_654_321),
            &CreateMessage {
                embeds: vec![embed],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(message.id, Snowflake(111_222_333));
    assert_eq!(message.embeds.len(), 1);
    assert_eq!(message.embeds[0].title.as_deref(), Some("Test Embed"));
}

#[tokio::test]
async fn pre_cancelled_requests_never_reach_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_body()))
        .expect(0)
        .mount(&server)
        .await;

    let engine = RestEngine::new(&test_config(&server)).unwrap();
    let request = ApiRequest::get("/users/@me");
    request.cancel_token().cancel();
    let err = engine.execute(request).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn cached_gets_are_served_locally() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gateway/bot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "wss://gateway.discord.gg",
            "shards": 1
        })))
        .expect(1)
        .mount(&server)
        .await;

    let engine = RestEngine::new(&test_config(&server)).unwrap();
    let fresh = engine
        .execute(ApiRequest::get("/gateway/bot").cached("gateway", Duration::from_secs(60)))
        .await
        .unwrap();
    assert!(!fresh.from_cache);

    let cached = engine
        .execute(ApiRequest::get("/gateway/bot").cached("gateway", Duration::from_secs(60)))
        .await
        .unwrap();
    assert!(cached.from_cache);
    assert_eq!(cached.body, fresh.body);
}

#[tokio::test]
async fn high_priority_rides_the_burst_reserve() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/channels/7"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Limit", "1")
                .insert_header("X-RateLimit-Remaining", "0")
                .insert_header("X-RateLimit-Reset-After", "2.0")
                .set_body_json(json!({"id": "7", "type": 0})),
        )
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.rate_limit.burst_capacity = 1;
    let engine = RestEngine::new(&config).unwrap();

    // First call teaches the engine the window is dry for 2s.
    engine.get_channel(Snowflake(7)).await.unwrap();

    // A HIGH-priority request jumps via the burst reserve instead of
    // waiting out the window.
    let started = Instant::now();
    engine
        .execute(ApiRequest::get("/channels/7").priority(Priority::High))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn typed_delete_returns_unit() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/channels/987654321/messages/111222333"))
        .and(header("Authorization", "Bot test_token_12345"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let engine = RestEngine::new(&test_config(&server)).unwrap();
    engine
        .delete_message(Snowflake(987_654_321), Snowflake(111_222_333))
        .await
        .unwrap();
}
