//! Connection pool.
//!
//! `reqwest` owns the sockets; this pool owns the *leases* above them:
//! per-endpoint slot accounting with a hard cap, emergency slots for urgent
//! requests, idle eviction and failure-driven health. A lease is checked out
//! for the life of one request attempt and returned on drop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::rest::request::Priority;

/// How an idle slot is picked when several qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
}

#[derive(Debug)]
struct Slot {
    id: u64,
    in_use: bool,
    emergency: bool,
    healthy: bool,
    last_used: Instant,
    requests_handled: u64,
}

#[derive(Debug, Default)]
struct Endpoint {
    slots: Vec<Slot>,
    rr_cursor: usize,
}

#[derive(Debug)]
struct PoolInner {
    endpoints: HashMap<String, Endpoint>,
    next_id: u64,
    last_sweep: Instant,
}

/// Counts for one endpoint, for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub emergency: usize,
}

/// Endpoint-keyed slot pool.
#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner {
                endpoints: HashMap::new(),
                next_id: 0,
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Check out a slot for `host:port`.
    ///
    /// Reuses an idle healthy slot when one exists, creates below the cap,
    /// grants an emergency slot to urgent requests above it.
    ///
    /// # Errors
    ///
    /// `Error::PoolExhausted` when the cap is hit and the request does not
    /// rate an emergency slot.
    pub fn acquire(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        priority: Priority,
    ) -> Result<ConnectionLease> {
        let key = format!("{host}:{port}");
        let mut inner = self.inner.lock();

        // Opportunistic sweep; cheap enough to run inline.
        if inner.last_sweep.elapsed() >= self.config.health_check_interval {
            Self::sweep_locked(&mut inner, &self.config);
        }

        let id = inner.next_id;
        let endpoint = inner.endpoints.entry(key.clone()).or_default();

        if let Some(slot_id) = Self::pick_idle(endpoint, self.config.strategy) {
            if let Some(slot) = endpoint.slots.iter_mut().find(|s| s.id == slot_id) {
                slot.in_use = true;
                trace!(endpoint = %key, slot = slot.id, "reusing pooled connection");
                return Ok(ConnectionLease {
                    pool: Arc::clone(self),
                    endpoint: key,
                    slot_id,
                    healthy: true,
                });
            }
        }

        let active = endpoint.slots.iter().filter(|s| !s.emergency).count();
        let emergency = active >= self.config.max_connections;
        if emergency && !priority.is_urgent() {
            debug!(endpoint = %key, cap = self.config.max_connections, "pool exhausted");
            return Err(Error::PoolExhausted {
                host: host.to_owned(),
            });
        }

        endpoint.slots.push(Slot {
            id,
            in_use: true,
            emergency,
            healthy: true,
            last_used: Instant::now(),
            requests_handled: 0,
        });
        inner.next_id = id + 1;
        if emergency {
            debug!(endpoint = %key, slot = id, "created emergency connection");
        }

        Ok(ConnectionLease {
            pool: Arc::clone(self),
            endpoint: key,
            slot_id: id,
            healthy: true,
        })
    }

    fn pick_idle(endpoint: &mut Endpoint, strategy: LoadBalanceStrategy) -> Option<u64> {
        let idle: Vec<(usize, u64, u64, Instant)> = endpoint
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.in_use && s.healthy && !s.emergency)
            .map(|(i, s)| (i, s.id, s.requests_handled, s.last_used))
            .collect();
        if idle.is_empty() {
            return None;
        }

        let choice = match strategy {
            LoadBalanceStrategy::RoundRobin => {
                let picked = endpoint.rr_cursor % idle.len();
                endpoint.rr_cursor = endpoint.rr_cursor.wrapping_add(1);
                idle[picked].1
            }
            LoadBalanceStrategy::LeastConnections => {
                idle.iter().min_by_key(|(_, _, handled, _)| *handled)?.1
            }
            LoadBalanceStrategy::Random => {
                idle[rand::thread_rng().gen_range(0..idle.len())].1
            }
        };
        Some(choice)
    }

    fn release(&self, endpoint: &str, slot_id: u64, healthy: bool) {
        let mut inner = self.inner.lock();
        let Some(ep) = inner.endpoints.get_mut(endpoint) else {
            return;
        };
        if let Some(pos) = ep.slots.iter().position(|s| s.id == slot_id) {
            // Emergency slots never rejoin the pool; unhealthy ones are
            // evicted on the spot.
            if ep.slots[pos].emergency || !healthy {
                ep.slots.remove(pos);
                return;
            }
            let slot = &mut ep.slots[pos];
            slot.in_use = false;
            slot.last_used = Instant::now();
            slot.requests_handled += 1;
        }
    }

    /// Evict idle slots past their idle or keepalive budget.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        Self::sweep_locked(&mut inner, &self.config);
    }

    fn sweep_locked(inner: &mut PoolInner, config: &PoolConfig) {
        let max_idle = config.max_idle_time.min(config.keepalive_timeout);
        for endpoint in inner.endpoints.values_mut() {
            endpoint
                .slots
                .retain(|s| s.in_use || (s.healthy && s.last_used.elapsed() <= max_idle));
        }
        inner.endpoints.retain(|_, ep| !ep.slots.is_empty());
        inner.last_sweep = Instant::now();
    }

    #[must_use]
    pub fn stats(&self, host: &str, port: u16) -> PoolStats {
        let key = format!("{host}:{port}");
        let inner = self.inner.lock();
        inner
            .endpoints
            .get(&key)
            .map(|ep| PoolStats {
                total: ep.slots.len(),
                in_use: ep.slots.iter().filter(|s| s.in_use).count(),
                emergency: ep.slots.iter().filter(|s| s.emergency).count(),
            })
            .unwrap_or_default()
    }
}

/// A checked-out slot. Returned to the pool on drop; call
/// [`Self::mark_unhealthy`] first if the transport failed.
#[derive(Debug)]
pub struct ConnectionLease {
    pool: Arc<ConnectionPool>,
    endpoint: String,
    slot_id: u64,
    healthy: bool,
}

impl ConnectionLease {
    /// Flag the underlying connection as dead so release evicts it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.pool.release(&self.endpoint, self.slot_id, self.healthy);
    }
}
