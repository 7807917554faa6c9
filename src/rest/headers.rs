//! `X-RateLimit-*` header parsing.

use reqwest::header::HeaderMap;

/// Who a 429 applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitScope {
    /// This token on this bucket.
    #[default]
    User,
    /// The whole application, every bucket.
    Global,
    /// The resource itself; not our fault and not a circuit failure.
    Shared,
}

/// Parsed rate-limit state from a response.
#[derive(Debug, Clone, Default)]
pub struct RateLimitHeaders {
    /// Window capacity.
    pub limit: Option<u32>,

    /// Tokens left in the window.
    pub remaining: Option<u32>,

    /// Window end as unix seconds (float).
    pub reset: Option<f64>,

    /// Seconds until the window ends (float). Preferred over `reset`: no
    /// clock-skew term.
    pub reset_after: Option<f64>,

    /// Server-assigned bucket hash grouping routes that share a limiter.
    pub bucket: Option<String>,

    /// `X-RateLimit-Global` was present and truthy.
    pub global: bool,

    /// Scope of a 429.
    pub scope: Option<RateLimitScope>,

    /// `Retry-After` in seconds.
    pub retry_after: Option<f64>,
}

impl RateLimitHeaders {
    /// Parse from a response header map. Header lookup is case-insensitive
    /// by construction of [`HeaderMap`].
    #[must_use]
    pub fn parse(headers: &HeaderMap) -> Self {
        Self {
            limit: get_parsed(headers, "x-ratelimit-limit"),
            remaining: get_parsed(headers, "x-ratelimit-remaining"),
            reset: get_parsed(headers, "x-ratelimit-reset"),
            reset_after: get_parsed(headers, "x-ratelimit-reset-after"),
            bucket: get_str(headers, "x-ratelimit-bucket").map(str::to_owned),
            global: get_str(headers, "x-ratelimit-global")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            scope: get_str(headers, "x-ratelimit-scope").map(|v| match v {
                "global" => RateLimitScope::Global,
                "shared" => RateLimitScope::Shared,
                _ => RateLimitScope::User,
            }),
            retry_after: get_parsed(headers, "retry-after"),
        }
    }

    /// Seconds the bucket should wait, preferring `Retry-After`.
    #[must_use]
    pub fn suggested_wait(&self) -> Option<f64> {
        self.retry_after.or(self.reset_after)
    }

    /// Effective scope, folding the legacy global flag in.
    #[must_use]
    pub fn effective_scope(&self) -> RateLimitScope {
        if self.global {
            RateLimitScope::Global
        } else {
            self.scope.unwrap_or_default()
        }
    }
}

fn get_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn get_parsed<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    get_str(headers, name).and_then(|v| v.parse().ok())
}
