//! REST dispatch engine.
//!
//! Every call runs the same pipeline: derive the route key, gate on the
//! bucket (priority queue + burst), gate on the host circuit breaker, lease
//! a pool slot, send, fold the rate-limit headers back into the bucket
//! before anything else, then classify. 429s re-queue without touching the
//! caller's retry budget; 5xx and transport faults retry with exponential
//! backoff when the method (or transport state) makes that safe.

pub mod backoff;
pub mod bucket;
pub mod circuit;
pub mod headers;
pub mod pool;
mod request;
mod route;

pub use request::{
    ApiRequest, ApiResponse, CachePolicy, CancelToken, Cookie, Middleware, Priority, RetryPolicy,
    Timing,
};
pub use route::route_key;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result, TimeoutPhase};
use crate::model::{
    Channel, Deletable, Embed, Guild, Message, MessageReference, Reactable, Sendable, Snowflake,
    User,
};
use backoff::{ExponentialBackoff, Jitter};
use bucket::BucketRegistry;
use circuit::CircuitRegistry;
use headers::{RateLimitHeaders, RateLimitScope};
use pool::ConnectionPool;

const MAX_AUDIT_LOG_REASON: usize = 512;

struct CachedEntry {
    stored_at: Instant,
    ttl: Duration,
    status: StatusCode,
    headers: HeaderMap,
    body: bytes::Bytes,
}

/// The REST engine. Cheap to share behind an [`Arc`]; requests to different
/// buckets run concurrently, requests within a bucket serialize.
pub struct RestEngine {
    http: reqwest::Client,
    base_url: String,
    host: String,
    port: u16,
    auth: String,
    timeouts: crate::config::TimeoutConfig,
    retry: crate::config::RetryConfig,
    buckets: BucketRegistry,
    circuits: CircuitRegistry,
    pool: Arc<ConnectionPool>,
    middleware: Mutex<Vec<Arc<dyn Middleware>>>,
    response_cache: Mutex<HashMap<String, CachedEntry>>,
}

impl std::fmt::Debug for RestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestEngine")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RestEngine {
    /// Build an engine from configuration.
    ///
    /// # Errors
    ///
    /// `Error::Validation` for an unparseable base URL, `Error::Network` if
    /// the TLS backend fails to initialize.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let base_url = config.api_url.trim_end_matches('/').to_owned();
        let url = Url::parse(&base_url)
            .map_err(|e| Error::Validation(format!("invalid api_url: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Validation("api_url has no host".into()))?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(443);

        let http = reqwest::Client::builder()
            .connect_timeout(config.timeouts.connect)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Network {
                route: String::new(),
                message: format!("failed to build HTTP client: {e}"),
                source: Some(e),
            })?;

        Ok(Self {
            http,
            base_url,
            host,
            port,
            auth: normalize_auth(&config.token),
            timeouts: config.timeouts.clone(),
            retry: config.retry.clone(),
            buckets: BucketRegistry::new(config.rate_limit.clone()),
            circuits: CircuitRegistry::new(config.circuit.clone()),
            pool: Arc::new(ConnectionPool::new(config.pool.clone())),
            middleware: Mutex::new(Vec::new()),
            response_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Register an engine-wide middleware.
    pub fn add_middleware(&self, mw: Arc<dyn Middleware>) {
        self.middleware.lock().push(mw);
    }

    #[must_use]
    pub fn buckets(&self) -> &BucketRegistry {
        &self.buckets
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    // ─────────────────────────────────────────────────────────────────────
    // Typed verbs
    // ─────────────────────────────────────────────────────────────────────

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.execute(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.execute(ApiRequest::post(path, body)).await
    }

    pub async fn put(&self, path: &str) -> Result<ApiResponse> {
        self.execute(ApiRequest::put(path)).await
    }

    pub async fn patch(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.execute(ApiRequest::patch(path, body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.execute(ApiRequest::delete(path)).await
    }

    /// Execute and deserialize a JSON body.
    pub async fn request_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        self.execute(request).await?.json()
    }

    /// The pipeline.
    #[instrument(
        skip(self, request),
        fields(
            method = %request.method,
            path = %request.path,
            request_id = %request.request_id,
            priority = ?request.priority,
        )
    )]
    pub async fn execute(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        if let Some(reason) = &request.audit_log_reason {
            if reason.chars().count() > MAX_AUDIT_LOG_REASON {
                return Err(Error::Validation(format!(
                    "audit log reason is {} characters, limit is {MAX_AUDIT_LOG_REASON}",
                    reason.chars().count()
                )));
            }
        }

        // Engine chain plus per-request overlay, ascending priority.
        let mut chain: Vec<Arc<dyn Middleware>> = self.middleware.lock().clone();
        chain.extend(request.middleware.clone());
        chain.sort_by_key(|mw| mw.priority());
        for mw in &chain {
            mw.on_request(&mut request);
        }

        let route = route_key(request.method.as_str(), &request.path);

        if let Some(cached) = self.cache_lookup(&request) {
            return Ok(cached);
        }

        let timeouts = request.timeouts.clone().unwrap_or_else(|| self.timeouts.clone());
        let policy = request
            .retry
            .clone()
            .unwrap_or_else(|| RetryPolicy::from(&self.retry));
        let started = Instant::now();
        let deadline = started + timeouts.total;
        let circuit = self.circuits.for_host(&self.host);

        let mut attempt: u32 = 0;
        let mut redirects_followed: u32 = 0;
        let mut url_override: Option<String> = None;
        let mut queued_time = Duration::ZERO;

        loop {
            if request.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Global 429 pause applies before any bucket is consulted.
            if let Some(wait) = self.buckets.global_delay() {
                sleep_within(wait, deadline, &route).await?;
            }

            // Circuit gate: fail fast while the host is down.
            if let Err(retry_in) = circuit.try_acquire() {
                return Err(Error::CircuitOpen {
                    host: self.host.clone(),
                    retry_in,
                });
            }

            let bucket = self.buckets.bucket_for(&route);
            let queue_started = Instant::now();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let permit = match tokio::time::timeout(remaining, bucket.acquire(request.priority))
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(e)) => {
                    circuit.record_cancel();
                    return Err(e);
                }
                Err(_) => {
                    circuit.record_cancel();
                    return Err(Error::Timeout {
                        route,
                        phase: TimeoutPhase::Total,
                    });
                }
            };
            queued_time += queue_started.elapsed();

            if request.cancel.is_cancelled() {
                permit.refund();
                circuit.record_cancel();
                return Err(Error::Cancelled);
            }

            let mut lease = match self
                .pool
                .acquire(&self.host, self.port, request.priority)
            {
                Ok(lease) => lease,
                Err(e) => {
                    permit.refund();
                    circuit.record_cancel();
                    return Err(e);
                }
            };

            // Send.
            let url = url_override
                .clone()
                .unwrap_or_else(|| format!("{}{}", self.base_url, request.path));
            let per_attempt = timeouts
                .read
                .min(deadline.saturating_duration_since(Instant::now()));
            let builder = self
                .build_request(&request, &url)
                .timeout(per_attempt);

            debug!(attempt, %url, "sending request");
            let transfer_started = Instant::now();
            let sent = builder.send().await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    lease.mark_unhealthy();
                    drop(lease);
                    drop(permit);
                    let bytes_never_sent = e.is_connect();
                    let err = Error::from_reqwest(e, &route);
                    if err.counts_as_circuit_failure() {
                        circuit.record_failure();
                    } else {
                        circuit.record_cancel();
                    }

                    let safe = request.is_idempotent() || bytes_never_sent;
                    if safe && policy.allows(&err, attempt) {
                        self.retry_sleep(&policy, attempt, deadline, &err).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            };

            let status = response.status();
            let response_headers = response.headers().clone();
            let rl = RateLimitHeaders::parse(&response_headers);

            // Header refresh first, so concurrent callers see fresh state.
            self.buckets.observe(&route, &rl);
            permit.release(&rl);

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    lease.mark_unhealthy();
                    drop(lease);
                    let err = Error::from_reqwest(e, &route);
                    circuit.record_failure();
                    if request.is_idempotent() && policy.allows(&err, attempt) {
                        self.retry_sleep(&policy, attempt, deadline, &err).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            };
            drop(lease);

            // reqwest inflates gzip/deflate/brotli transparently; anything
            // still marked encoded is something we cannot read.
            if let Some(encoding) = response_headers
                .get("content-encoding")
                .and_then(|v| v.to_str().ok())
            {
                if !encoding.eq_ignore_ascii_case("identity") {
                    circuit.record_success();
                    return Err(Error::Compression {
                        encoding: encoding.to_owned(),
                    });
                }
            }

            let timing = Timing {
                queued: queued_time,
                transfer: transfer_started.elapsed(),
                total: started.elapsed(),
                attempts: attempt + 1,
            };

            // Classify.
            if status.is_success() {
                circuit.record_success();
                let response = ApiResponse {
                    status,
                    headers: response_headers,
                    body,
                    timing,
                    from_cache: false,
                };
                self.cache_store(&request, &response);
                return Ok(response);
            }

            if status.is_redirection() {
                let location = response_headers
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                circuit.record_success();
                if request.follow_redirects && redirects_followed < request.max_redirects {
                    if let Some(location) = location {
                        redirects_followed += 1;
                        url_override = Some(self.resolve_location(&url, &location)?);
                        continue;
                    }
                }
                return Err(Error::Redirect {
                    status: status.as_u16(),
                    location,
                });
            }

            if status == StatusCode::UNAUTHORIZED {
                circuit.record_success();
                return Err(Error::Auth {
                    status: 401,
                    message: parse_api_error(&body).1,
                });
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let body_info: RateLimitBody =
                    serde_json::from_slice(&body).unwrap_or_default();
                let retry_after = rl
                    .suggested_wait()
                    .or(body_info.retry_after)
                    .unwrap_or(1.0)
                    .clamp(0.0, 3600.0);
                let scope = if body_info.global.unwrap_or(false) {
                    RateLimitScope::Global
                } else {
                    rl.effective_scope()
                };
                let wait = Duration::from_secs_f64(retry_after);

                match scope {
                    RateLimitScope::Global => self.buckets.pause_all(wait),
                    RateLimitScope::User | RateLimitScope::Shared => bucket.pause(wait),
                }

                let err = Error::RateLimited {
                    route: route.clone(),
                    retry_after,
                    scope,
                };
                if err.counts_as_circuit_failure() {
                    circuit.record_failure();
                } else {
                    circuit.record_success();
                }

                warn!(route = %route, retry_after, ?scope, "rate limited");
                // Re-queue after the pause; deliberately not counted against
                // the retry budget.
                sleep_within(wait, deadline, &route).await.map_err(|_| err)?;
                continue;
            }

            if status.is_client_error() {
                circuit.record_success();
                let (code, message) = parse_api_error(&body);
                return Err(Error::Api {
                    status: status.as_u16(),
                    code,
                    message,
                    route,
                    attempt,
                });
            }

            // 5xx.
            circuit.record_failure();
            let (code, message) = parse_api_error(&body);
            let err = Error::Api {
                status: status.as_u16(),
                code,
                message,
                route: route.clone(),
                attempt,
            };
            if policy.allows(&err, attempt) {
                self.retry_sleep(&policy, attempt, deadline, &err).await?;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }

    fn build_request(&self, request: &ApiRequest, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(request.method.clone(), url);

        builder = builder.header(AUTHORIZATION, self.auth.clone());

        if let Some(reason) = &request.audit_log_reason {
            let encoded = percent_encoding::utf8_percent_encode(
                reason,
                percent_encoding::NON_ALPHANUMERIC,
            )
            .to_string();
            if let Ok(value) = HeaderValue::from_str(&encoded) {
                builder = builder.header("X-Audit-Log-Reason", value);
            }
        }

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    fn resolve_location(&self, current: &str, location: &str) -> Result<String> {
        if location.starts_with("http://") || location.starts_with("https://") {
            return Ok(location.to_owned());
        }
        let base = Url::parse(current)
            .map_err(|e| Error::Validation(format!("bad redirect base: {e}")))?;
        base.join(location)
            .map(Into::into)
            .map_err(|e| Error::Validation(format!("bad redirect target: {e}")))
    }

    async fn retry_sleep(
        &self,
        policy: &RetryPolicy,
        attempt: u32,
        deadline: Instant,
        err: &Error,
    ) -> Result<()> {
        let jitter = if policy.jitter { Jitter::Half } else { Jitter::None };
        let delay = ExponentialBackoff::new(
            policy.base_delay,
            policy.backoff_factor,
            Duration::from_secs(60),
        )
        .with_jitter(jitter)
        .delay(attempt);
        let delay = err.retry_after().map_or(delay, |ra| ra.max(delay));

        if Instant::now() + delay > deadline {
            return Err(Error::Timeout {
                route: String::new(),
                phase: TimeoutPhase::Total,
            });
        }
        debug!(?delay, attempt, "backing off before retry");
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn cache_lookup(&self, request: &ApiRequest) -> Option<ApiResponse> {
        let policy = request.cache.as_ref()?;
        if request.method != Method::GET {
            return None;
        }
        let mut cache = self.response_cache.lock();
        if let Some(entry) = cache.get(&policy.key) {
            if entry.stored_at.elapsed() <= entry.ttl {
                return Some(ApiResponse {
                    status: entry.status,
                    headers: entry.headers.clone(),
                    body: entry.body.clone(),
                    timing: Timing::default(),
                    from_cache: true,
                });
            }
        }
        // Stale or absent either way; dropping a missing key is a no-op.
        cache.remove(&policy.key);
        None
    }

    fn cache_store(&self, request: &ApiRequest, response: &ApiResponse) {
        let Some(policy) = &request.cache else { return };
        if request.method != Method::GET {
            return;
        }
        self.response_cache.lock().insert(
            policy.key.clone(),
            CachedEntry {
                stored_at: Instant::now(),
                ttl: policy.ttl,
                status: response.status,
                headers: response.headers.clone(),
                body: response.body.clone(),
            },
        );
    }
}

async fn sleep_within(wait: Duration, deadline: Instant, route: &str) -> Result<()> {
    if Instant::now() + wait > deadline {
        return Err(Error::Timeout {
            route: route.to_owned(),
            phase: TimeoutPhase::Total,
        });
    }
    tokio::time::sleep(wait).await;
    Ok(())
}

fn normalize_auth(token: &str) -> String {
    if token.starts_with("Bearer ") {
        return token.to_owned();
    }
    let bare = token.strip_prefix("Bot ").unwrap_or(token);
    format!("Bot {bare}")
}

fn parse_api_error(body: &[u8]) -> (i64, String) {
    #[derive(Deserialize)]
    struct ApiErrorBody {
        code: Option<i64>,
        message: Option<String>,
    }

    let parsed: ApiErrorBody = serde_json::from_slice(body).unwrap_or(ApiErrorBody {
        code: None,
        message: None,
    });
    (
        parsed.code.unwrap_or(0),
        parsed
            .message
            .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned()),
    )
}

#[derive(Deserialize, Default)]
struct RateLimitBody {
    retry_after: Option<f64>,
    global: Option<bool>,
}

// ─────────────────────────────────────────────────────────────────────────
// Typed endpoints
// ─────────────────────────────────────────────────────────────────────────

/// Body for `POST /channels/{id}/messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_reference: Option<MessageReference>,
}

/// Body for `PATCH /channels/{id}/messages/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

/// `GET /gateway/bot` response.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,

    #[serde(default)]
    pub shards: u32,

    #[serde(default)]
    pub session_start_limit: Option<SessionStartLimit>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    pub max_concurrency: u32,
}

impl RestEngine {
    pub async fn get_current_user(&self) -> Result<User> {
        self.request_json(ApiRequest::get("/users/@me")).await
    }

    pub async fn get_user(&self, user_id: Snowflake) -> Result<User> {
        self.request_json(ApiRequest::get(format!("/users/{user_id}")))
            .await
    }

    pub async fn get_channel(&self, channel_id: Snowflake) -> Result<Channel> {
        self.request_json(ApiRequest::get(format!("/channels/{channel_id}")))
            .await
    }

    pub async fn get_guild(&self, guild_id: Snowflake) -> Result<Guild> {
        self.request_json(ApiRequest::get(format!("/guilds/{guild_id}")))
            .await
    }

    pub async fn get_guild_channels(&self, guild_id: Snowflake) -> Result<Vec<Channel>> {
        self.request_json(ApiRequest::get(format!("/guilds/{guild_id}/channels")))
            .await
    }

    pub async fn create_message(
        &self,
        channel_id: Snowflake,
        message: &CreateMessage,
    ) -> Result<Message> {
        self.request_json(ApiRequest::post(
            format!("/channels/{channel_id}/messages"),
            serde_json::to_value(message)?,
        ))
        .await
    }

    pub async fn edit_message(
        &self,
        channel_id: Snowflake,
        message_id: Snowflake,
        edit: &EditMessage,
    ) -> Result<Message> {
        self.request_json(ApiRequest::patch(
            format!("/channels/{channel_id}/messages/{message_id}"),
            serde_json::to_value(edit)?,
        ))
        .await
    }

    pub async fn delete_message(
        &self,
        channel_id: Snowflake,
        message_id: Snowflake,
    ) -> Result<()> {
        self.execute(ApiRequest::delete(format!(
            "/channels/{channel_id}/messages/{message_id}"
        )))
        .await?;
        Ok(())
    }

    /// Send a message to anything sendable: a channel, or the channel a
    /// message lives in.
    pub async fn send_to(
        &self,
        target: &impl Sendable,
        message: &CreateMessage,
    ) -> Result<Message> {
        self.create_message(target.target_channel(), message).await
    }

    /// Delete anything deletable, with an optional audit-log reason.
    pub async fn delete_target(
        &self,
        target: &impl Deletable,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut request = ApiRequest::delete(target.delete_path());
        if let Some(reason) = reason {
            request = request.audit_log_reason(reason);
        }
        self.execute(request).await?;
        Ok(())
    }

    /// Add the bot's own reaction to something reactable.
    pub async fn create_reaction(&self, target: &impl Reactable, emoji: &str) -> Result<()> {
        self.execute(ApiRequest::put(target.reaction_path(emoji)))
            .await?;
        Ok(())
    }

    pub async fn trigger_typing(&self, channel_id: Snowflake) -> Result<()> {
        self.execute(ApiRequest::post(
            format!("/channels/{channel_id}/typing"),
            serde_json::json!({}),
        ))
        .await?;
        Ok(())
    }

    pub async fn get_gateway_bot(&self) -> Result<GatewayBot> {
        self.request_json(ApiRequest::get("/gateway/bot")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_normalization() {
        assert_eq!(normalize_auth("abc"), "Bot abc");
        assert_eq!(normalize_auth("Bot abc"), "Bot abc");
        assert_eq!(normalize_auth("Bearer xyz"), "Bearer xyz");
    }

    #[test]
    fn api_error_body_parsing() {
        let (code, message) = parse_api_error(br#"{"code": 50013, "message": "Missing Permissions"}"#);
        assert_eq!(code, 50013);
        assert_eq!(message, "Missing Permissions");

        let (code, message) = parse_api_error(b"not json at all");
        assert_eq!(code, 0);
        assert_eq!(message, "not json at all");
    }

    #[test]
    fn engine_rejects_oversized_audit_reason() {
        let config = ClientConfig::new("t");
        let engine = RestEngine::new(&config).unwrap();
        let req = ApiRequest::delete("/channels/1").audit_log_reason("x".repeat(513));
        let err = futures_util::FutureExt::now_or_never(engine.execute(req))
            .expect("validation fails before any suspension")
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn middleware_runs_in_priority_order() {
        struct Tagger {
            priority: i32,
            name: &'static str,
        }
        impl Middleware for Tagger {
            fn priority(&self) -> i32 {
                self.priority
            }
            fn on_request(&self, request: &mut ApiRequest) {
                let order = request
                    .tags
                    .entry("order".into())
                    .or_default();
                order.push_str(self.name);
            }
        }

        // Sorting happens inside execute(); replicate the chain logic here.
        let mut chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Tagger { priority: 10, name: "b" }),
            Arc::new(Tagger { priority: -5, name: "a" }),
            Arc::new(Tagger { priority: 99, name: "c" }),
        ];
        chain.sort_by_key(|mw| mw.priority());
        let mut req = ApiRequest::get("/users/@me");
        for mw in &chain {
            mw.on_request(&mut req);
        }
        assert_eq!(req.tags.get("order").unwrap(), "abc");
    }
}
