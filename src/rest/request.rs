//! Request and response shapes for the REST engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::config::{RetryConfig, TimeoutConfig};
use crate::error::{Error, Result};

/// Dispatch priority. Lower value wins; HIGH and CRITICAL may consume the
/// bucket's burst reserve and emergency pool slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    pub const COUNT: usize = 5;

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// HIGH and above may dip into emergency reserves.
    #[must_use]
    pub const fn is_urgent(self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }

    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Critical,
            1 => Self::High,
            2 => Self::Normal,
            3 => Self::Low,
            _ => Self::Background,
        }
    }
}

/// Retry policy for one request. The decider, when present, gets the final
/// say on whether a retryable failure is actually re-attempted.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub decider: Option<Arc<dyn Fn(&Error, u32) -> bool + Send + Sync>>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .field("decider", &self.decider.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
            decider: None,
        }
    }
}

impl RetryPolicy {
    /// Whether `error` on attempt `attempt` may be retried.
    #[must_use]
    pub fn allows(&self, error: &Error, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match &self.decider {
            Some(decider) => decider(error, attempt),
            None => error.is_retryable(),
        }
    }
}

/// GET response caching directive.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub key: String,
    pub ttl: Duration,
}

/// Hook applied to every outgoing request, ascending by `priority()`.
pub trait Middleware: Send + Sync {
    /// Ordering among middleware; lowest runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn on_request(&self, request: &mut ApiRequest);
}

/// Cooperative cancellation flag, checked at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// One REST call, before it is executed.
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub audit_log_reason: Option<String>,
    pub priority: Priority,
    pub timeouts: Option<TimeoutConfig>,
    pub retry: Option<RetryPolicy>,
    pub cache: Option<CachePolicy>,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub tags: HashMap<String, String>,
    pub request_id: Uuid,
    pub cancel: CancelToken,
}

impl fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("priority", &self.priority)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            audit_log_reason: None,
            priority: Priority::default(),
            timeouts: None,
            retry: None,
            cache: None,
            follow_redirects: false,
            max_redirects: 3,
            middleware: Vec::new(),
            tags: HashMap::new(),
            request_id: Uuid::new_v4(),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        let mut req = Self::new(Method::POST, path);
        req.body = Some(body);
        req
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn patch(path: impl Into<String>, body: serde_json::Value) -> Self {
        let mut req = Self::new(Method::PATCH, path);
        req.body = Some(body);
        req
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Reason recorded in the guild audit log. Validated (≤ 512 chars) and
    /// percent-encoded at send time.
    #[must_use]
    pub fn audit_log_reason(mut self, reason: impl Into<String>) -> Self {
        self.audit_log_reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    #[must_use]
    pub fn cached(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.cache = Some(CachePolicy {
            key: key.into(),
            ttl,
        });
        self
    }

    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.middleware.push(mw);
        self
    }

    /// Handle for cancelling this request from another task.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// GET/PUT/DELETE/HEAD may be retried after a transport fault that may
    /// have sent bytes; POST/PATCH may not.
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::PUT | Method::DELETE | Method::HEAD
        )
    }
}

/// Wall-clock phases of a completed request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timing {
    /// Time spent queued on the bucket and pool.
    pub queued: Duration,
    /// First byte out to response in.
    pub transfer: Duration,
    /// End to end, including retries.
    pub total: Duration,
    /// Attempts actually sent (1 for a clean first try).
    pub attempts: u32,
}

/// A parsed cookie from `Set-Cookie`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// A completed REST call.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: bytes::Bytes,
    pub timing: Timing,
    pub from_cache: bool,
}

impl ApiResponse {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Deserialize the body.
    ///
    /// # Errors
    ///
    /// `Error::Parse` when the body is not the expected JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(Error::Parse)
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Cookies from every `Set-Cookie` header, parsed on demand.
    #[must_use]
    pub fn cookies(&self) -> Vec<Cookie> {
        self.headers
            .get_all("set-cookie")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|raw| {
                let first = raw.split(';').next()?;
                let (name, value) = first.split_once('=')?;
                Some(Cookie {
                    name: name.trim().to_owned(),
                    value: value.trim().to_owned(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_and_urgency() {
        assert!(Priority::Critical < Priority::Background);
        assert!(Priority::High.is_urgent());
        assert!(!Priority::Normal.is_urgent());
        for i in 0..Priority::COUNT {
            assert_eq!(Priority::from_index(i).index(), i);
        }
    }

    #[test]
    fn idempotency_split() {
        assert!(ApiRequest::get("/users/@me").is_idempotent());
        assert!(ApiRequest::delete("/channels/1").is_idempotent());
        assert!(!ApiRequest::post("/channels/1/messages", serde_json::json!({})).is_idempotent());
        assert!(!ApiRequest::patch("/channels/1", serde_json::json!({})).is_idempotent());
    }

    #[test]
    fn retry_policy_respects_budget_and_decider() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            jitter: false,
            decider: None,
        };
        let err = Error::Api {
            status: 503,
            code: 0,
            message: "unavailable".into(),
            route: "GET:/x".into(),
            attempt: 0,
        };
        assert!(policy.allows(&err, 0));
        assert!(policy.allows(&err, 1));
        assert!(!policy.allows(&err, 2));

        let veto = RetryPolicy {
            decider: Some(Arc::new(|_, _| false)),
            ..policy
        };
        assert!(!veto.allows(&err, 0));
    }

    #[test]
    fn cancel_token_propagates() {
        let req = ApiRequest::get("/users/@me");
        let token = req.cancel_token();
        assert!(!req.cancel.is_cancelled());
        token.cancel();
        assert!(req.cancel.is_cancelled());
    }

    #[test]
    fn cookies_parse_name_value() {
        let mut headers = HeaderMap::new();
        headers.append(
            "set-cookie",
            "__cf=abc123; Path=/; HttpOnly".parse().unwrap(),
        );
        headers.append("set-cookie", "sid=xyz".parse().unwrap());
        let resp = ApiResponse {
            status: StatusCode::OK,
            headers,
            body: bytes::Bytes::new(),
            timing: Timing::default(),
            from_cache: false,
        };
        let cookies = resp.cookies();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "__cf");
        assert_eq!(cookies[1].value, "xyz");
    }
}
