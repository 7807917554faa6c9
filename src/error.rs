//! Crate-wide error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::rest::headers::RateLimitScope;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in the REST and gateway engines.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure: DNS, connect, reset, broken pipe.
    #[error("network error on {route}: {message}")]
    Network {
        route: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// A connect/read/total deadline elapsed.
    #[error("timed out ({phase}) on {route}")]
    Timeout { route: String, phase: TimeoutPhase },

    /// 429 from the API, surfaced after local recovery gave up.
    #[error("rate limited on {route}, retry after {retry_after}s ({scope:?} scope)")]
    RateLimited {
        route: String,
        retry_after: f64,
        scope: RateLimitScope,
    },

    /// 401: the token is wrong. Never retried.
    #[error("authentication failed: {message}")]
    Auth { status: u16, message: String },

    /// A request was rejected before it ever left the process.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Response body (or gateway frame) was not the JSON we expected.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The caller dropped the request at a suspension point.
    #[error("request cancelled")]
    Cancelled,

    /// 3xx that we were not allowed to (or could not) follow.
    #[error("redirect ({status}) to {location:?} not followed")]
    Redirect {
        status: u16,
        location: Option<String>,
    },

    /// Body arrived with a Content-Encoding nothing here can inflate.
    #[error("unsupported content encoding: {encoding}")]
    Compression { encoding: String },

    /// TLS handshake or certificate failure.
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// The per-host circuit breaker is open; the request never went out.
    #[error("circuit open for {host}, retry in {retry_in:?}")]
    CircuitOpen { host: String, retry_in: Duration },

    /// No connection slot available and the request was not allowed an
    /// emergency slot.
    #[error("connection pool exhausted for {host}")]
    PoolExhausted { host: String },

    /// Non-retryable (or retry-exhausted) API error with a parsed body.
    #[error("API error {status} (code {code}) on {route}: {message}")]
    Api {
        status: u16,
        code: i64,
        message: String,
        route: String,
        attempt: u32,
    },

    /// Gateway closed with a code that must not be reconnected.
    #[error("gateway fatal close {code}: {reason}")]
    GatewayFatal { code: u16, reason: String },

    /// Gateway fault the engine recovers from by reconnecting. Only visible
    /// through the `reconnect` event, never returned to user code.
    #[error("gateway reconnecting: {message}")]
    GatewayReconnect { message: String },

    /// Raw WebSocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Read,
    Total,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::Read => f.write_str("read"),
            Self::Total => f.write_str("total"),
        }
    }
}

/// Coarse classification mirroring the variants, for matching without
/// destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimit,
    Auth,
    Validation,
    Parse,
    Cancelled,
    Redirect,
    Compression,
    Tls,
    CircuitOpen,
    PoolExhausted,
    Api,
    GatewayFatal,
    GatewayReconnect,
    WebSocket,
}

impl Error {
    /// Classify a `reqwest` failure into the taxonomy.
    pub(crate) fn from_reqwest(e: reqwest::Error, route: &str) -> Self {
        if e.is_timeout() {
            Self::Timeout {
                route: route.to_owned(),
                phase: TimeoutPhase::Total,
            }
        } else if e.is_connect() {
            let message = e.to_string();
            if message.contains("certificate") || message.contains("tls") {
                Self::Tls { message }
            } else {
                Self::Network {
                    route: route.to_owned(),
                    message,
                    source: Some(e),
                }
            }
        } else {
            Self::Network {
                route: route.to_owned(),
                message: e.to_string(),
                source: Some(e),
            }
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Redirect { .. } => ErrorKind::Redirect,
            Self::Compression { .. } => ErrorKind::Compression,
            Self::Tls { .. } => ErrorKind::Tls,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::Api { .. } => ErrorKind::Api,
            Self::GatewayFatal { .. } => ErrorKind::GatewayFatal,
            Self::GatewayReconnect { .. } => ErrorKind::GatewayReconnect,
            Self::WebSocket(_) => ErrorKind::WebSocket,
        }
    }

    /// Whether the REST engine may transparently re-attempt this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::GatewayReconnect { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// HTTP status, where one exists.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. }
            | Self::Redirect { status, .. }
            | Self::Api { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Server-suggested wait before the next attempt.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => {
                Some(Duration::from_secs_f64(retry_after.clamp(0.0, 3600.0)))
            }
            Self::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    /// Whether this failure should trip the host circuit breaker.
    ///
    /// Well-formed 4xx answers count as the server working; shared-scope 429s
    /// are someone else's traffic.
    #[must_use]
    pub fn counts_as_circuit_failure(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Tls { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::RateLimited { scope, .. } => !matches!(scope, RateLimitScope::Shared),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = Error::Api {
            status: 502,
            code: 0,
            message: "bad gateway".into(),
            route: "GET:/users/@me".into(),
            attempt: 1,
        };
        assert!(err.is_retryable());
        assert_eq!(err.status(), Some(502));
    }

    #[test]
    fn auth_is_terminal() {
        let err = Error::Auth {
            status: 401,
            message: "401: Unauthorized".into(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn rate_limit_carries_wait() {
        let err = Error::RateLimited {
            route: "POST:/channels/{id}/messages".into(),
            retry_after: 1.5,
            scope: RateLimitScope::User,
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs_f64(1.5)));
        assert!(err.is_retryable());
    }

    #[test]
    fn shared_scope_does_not_trip_breaker() {
        let err = Error::RateLimited {
            route: "GET:/guilds/{id}".into(),
            retry_after: 2.0,
            scope: RateLimitScope::Shared,
        };
        assert!(!err.counts_as_circuit_failure());
    }
}
