//! Lanyard — the protocol core of a Discord bot client.
//!
//! Two coupled engines:
//!
//! - [`GatewayEngine`]: a resumable WebSocket session speaking Discord's
//!   opcode protocol — HELLO/IDENTIFY/RESUME, heartbeat liveness, sequence
//!   tracking, a reconnect ladder, and typed event dispatch.
//! - [`RestEngine`]: an HTTP client enforcing Discord's per-route rate-limit
//!   buckets with priority-fair queueing, a per-host circuit breaker, and a
//!   leased connection pool.
//!
//! Domain object shaping (embed builders, command builders, CDN helpers) is
//! deliberately thin here; the crate ships only the wire records the engines
//! themselves produce and consume.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod cache;
mod client;
mod config;
mod error;
mod events;
pub mod gateway;
pub mod model;
pub mod rest;

pub use cache::{CacheStore, Caches};
pub use client::Client;
pub use config::{
    CircuitConfig, ClientConfig, GatewayConfig, PoolConfig, RateLimitOptions, RetryConfig,
    ShardConfig, TimeoutConfig,
};
pub use error::{Error, ErrorKind, Result, TimeoutPhase};
pub use events::{Event, EventBus, EventKind, ListenerId};
pub use gateway::{ConnectionStatus, GatewayEngine, GatewayHandle};
pub use rest::{ApiRequest, ApiResponse, Priority, RestEngine};
