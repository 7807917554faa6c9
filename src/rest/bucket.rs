//! Rate-limit buckets.
//!
//! One bucket per server-assigned bucket hash (or per synthetic route key
//! until the hash is learned). A bucket serializes its requests: one permit
//! in flight, waiters parked in five priority FIFOs, a small burst reserve
//! that urgent requests may consume when the window is dry. Window state is
//! authoritative from response headers, applied before the next waiter is
//! released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::config::RateLimitOptions;
use crate::error::{Error, Result};
use crate::rest::headers::{RateLimitHeaders, RateLimitScope};
use crate::rest::request::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Queued,
    Granted,
    Evicted,
    Finished,
}

/// A parked acquirer. State transitions happen under the owning bucket's
/// lock; `owner` is rewritten when waiters migrate on a rebind.
struct WaiterCell {
    id: u64,
    priority: usize,
    notify: Notify,
    state: Mutex<WaitState>,
    owner: Mutex<Weak<RateLimitBucket>>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    limit: u32,
    remaining: u32,
    reset_at: Instant,
    reset_after: Duration,
    burst_used: u32,
    paused_until: Option<Instant>,
}

struct Inner {
    window: Window,
    busy: bool,
    queues: [VecDeque<Arc<WaiterCell>>; Priority::COUNT],
    queued: usize,
    next_waiter: u64,
}

/// Counters, mostly for tests and debug logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct BucketStats {
    pub granted: u64,
    pub burst_granted: u64,
    pub enqueued: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub pauses: u64,
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_in: Duration,
    pub burst_used: u32,
    pub queued: usize,
    pub busy: bool,
}

/// Which reserve a granted token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Window,
    Burst,
}

pub struct RateLimitBucket {
    name: String,
    synthetic: bool,
    opts: RateLimitOptions,
    inner: Mutex<Inner>,
    stats: Mutex<BucketStats>,
}

impl std::fmt::Debug for RateLimitBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitBucket")
            .field("name", &self.name)
            .field("synthetic", &self.synthetic)
            .finish_non_exhaustive()
    }
}

impl RateLimitBucket {
    #[must_use]
    pub fn new(name: impl Into<String>, synthetic: bool, opts: RateLimitOptions) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            synthetic,
            opts,
            inner: Mutex::new(Inner {
                // Until the first response teaches us the real window the
                // bucket only serializes; a zero-length window always grants.
                window: Window {
                    limit: 1,
                    remaining: 1,
                    reset_at: now,
                    reset_after: Duration::ZERO,
                    burst_used: 0,
                    paused_until: None,
                },
                busy: false,
                queues: Default::default(),
                queued: 0,
                next_waiter: 0,
            }),
            stats: Mutex::new(BucketStats::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    #[must_use]
    pub fn stats(&self) -> BucketStats {
        *self.stats.lock()
    }

    #[must_use]
    pub fn snapshot(&self) -> BucketSnapshot {
        let inner = self.inner.lock();
        BucketSnapshot {
            limit: inner.window.limit,
            remaining: inner.window.remaining,
            reset_in: inner.window.reset_at.saturating_duration_since(Instant::now()),
            burst_used: inner.window.burst_used,
            queued: inner.queued,
            busy: inner.busy,
        }
    }

    /// Acquire the bucket: wait for the single-flight slot in
    /// priority-then-FIFO order, then for a window (or burst) token.
    ///
    /// Dropping the returned future at any await point releases whatever was
    /// held; a waiter that never got a token leaves the window untouched.
    ///
    /// # Errors
    ///
    /// `Error::RateLimited` when the queue is full and this request was
    /// dropped or evicted.
    pub async fn acquire(self: &Arc<Self>, priority: Priority) -> Result<BucketPermit> {
        if let Some(cell) = self.enter_or_enqueue(priority)? {
            self.wait_for_grant(&cell).await?;
        }

        // Slot is ours; the guard returns it if we bail or get dropped
        // before a token is granted.
        let mut slot = SlotGuard {
            bucket: Arc::clone(self),
            armed: true,
        };

        loop {
            let decision = self.try_take_token(priority);
            match decision {
                Ok(kind) => {
                    slot.armed = false;
                    return Ok(BucketPermit {
                        bucket: Arc::clone(self),
                        token: kind,
                        done: false,
                    });
                }
                Err(wait) => {
                    trace!(bucket = %self.name, ?wait, "window dry, sleeping");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Fast path: claim the slot, or enqueue and return the cell to wait on.
    fn enter_or_enqueue(self: &Arc<Self>, priority: Priority) -> Result<Option<Arc<WaiterCell>>> {
        let mut inner = self.inner.lock();
        if !inner.busy {
            inner.busy = true;
            return Ok(None);
        }

        if inner.queued >= self.opts.max_queue_size {
            if self.opts.drop_on_limit || !self.evict_lower_locked(&mut inner, priority) {
                self.stats.lock().rejected += 1;
                let wait = inner
                    .window
                    .reset_at
                    .saturating_duration_since(Instant::now());
                return Err(Error::RateLimited {
                    route: self.name.clone(),
                    retry_after: wait.as_secs_f64(),
                    scope: RateLimitScope::User,
                });
            }
        }

        let id = inner.next_waiter;
        inner.next_waiter += 1;
        let cell = Arc::new(WaiterCell {
            id,
            priority: priority.index(),
            notify: Notify::new(),
            state: Mutex::new(WaitState::Queued),
            owner: Mutex::new(Arc::downgrade(self)),
        });
        inner.queues[priority.index()].push_back(Arc::clone(&cell));
        inner.queued += 1;
        self.stats.lock().enqueued += 1;
        Ok(Some(cell))
    }

    /// Drop the tail of the lowest-priority queue strictly below `incoming`.
    /// Returns false when nothing lower exists.
    fn evict_lower_locked(&self, inner: &mut Inner, incoming: Priority) -> bool {
        for idx in ((incoming.index() + 1)..Priority::COUNT).rev() {
            if let Some(victim) = inner.queues[idx].pop_back() {
                inner.queued -= 1;
                *victim.state.lock() = WaitState::Evicted;
                victim.notify.notify_one();
                self.stats.lock().evicted += 1;
                warn!(bucket = %self.name, "queue full, evicted lowest-priority waiter");
                return true;
            }
        }
        false
    }

    async fn wait_for_grant(self: &Arc<Self>, cell: &Arc<WaiterCell>) -> Result<()> {
        let mut guard = WaitGuard {
            cell: Arc::clone(cell),
            armed: true,
        };
        loop {
            cell.notify.notified().await;
            let outcome = {
                let mut state = cell.state.lock();
                match *state {
                    WaitState::Granted => {
                        *state = WaitState::Finished;
                        Some(true)
                    }
                    WaitState::Evicted => {
                        *state = WaitState::Finished;
                        Some(false)
                    }
                    WaitState::Queued | WaitState::Finished => None,
                }
            };
            match outcome {
                Some(true) => {
                    guard.armed = false;
                    return Ok(());
                }
                Some(false) => {
                    guard.armed = false;
                    let wait = self
                        .inner
                        .lock()
                        .window
                        .reset_at
                        .saturating_duration_since(Instant::now());
                    return Err(Error::RateLimited {
                        route: self.name.clone(),
                        retry_after: wait.as_secs_f64(),
                        scope: RateLimitScope::User,
                    });
                }
                None => {}
            }
        }
    }

    /// Take a token from the window, the burst reserve, or report how long
    /// to sleep.
    fn try_take_token(&self, priority: Priority) -> std::result::Result<TokenKind, Duration> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if let Some(until) = inner.window.paused_until {
            if now < until {
                return Err(until - now);
            }
            inner.window.paused_until = None;
        }

        if now >= inner.window.reset_at {
            inner.window.remaining = inner.window.limit;
            inner.window.burst_used = 0;
            inner.window.reset_at = now + inner.window.reset_after;
        }

        if inner.window.remaining > 0 {
            inner.window.remaining -= 1;
            self.stats.lock().granted += 1;
            return Ok(TokenKind::Window);
        }

        if priority.is_urgent() && inner.window.burst_used < self.opts.burst_capacity {
            inner.window.burst_used += 1;
            let mut stats = self.stats.lock();
            stats.granted += 1;
            stats.burst_granted += 1;
            return Ok(TokenKind::Burst);
        }

        let base = inner.window.reset_at.saturating_duration_since(now);
        drop(inner);
        Err(jittered_wait(base, self.opts.jitter_factor))
    }

    /// Hand the single-flight slot to the best waiter, or mark idle.
    fn pass_slot(&self) {
        let mut inner = self.inner.lock();
        self.pass_slot_locked(&mut inner);
    }

    fn pass_slot_locked(&self, inner: &mut Inner) {
        loop {
            let Some(cell) = next_waiter(inner) else {
                inner.busy = false;
                return;
            };
            let mut state = cell.state.lock();
            if *state == WaitState::Queued {
                *state = WaitState::Granted;
                cell.notify.notify_one();
                return;
            }
            // Cancelled while queued; skip it.
        }
    }

    /// Ensure an idle bucket with waiters hands the slot out.
    fn kick(&self) {
        let mut inner = self.inner.lock();
        if !inner.busy && inner.queued > 0 {
            inner.busy = true;
            self.pass_slot_locked(&mut inner);
        }
    }

    fn remove_waiter_locked(inner: &mut Inner, id: u64, priority: usize) {
        let queue = &mut inner.queues[priority];
        if let Some(pos) = queue.iter().position(|c| c.id == id) {
            queue.remove(pos);
            inner.queued -= 1;
        }
    }

    /// Fold response headers into the window. Server values are
    /// authoritative.
    pub fn apply_headers(&self, headers: &RateLimitHeaders) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if let Some(limit) = headers.limit {
            inner.window.limit = limit;
        }
        if let Some(remaining) = headers.remaining {
            inner.window.remaining = remaining;
        }
        if let Some(reset_after) = headers.reset_after {
            let after = Duration::from_secs_f64(reset_after.max(0.0));
            inner.window.reset_after = after;
            inner.window.reset_at = now + after;
        } else if let Some(reset) = headers.reset {
            let unix_now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs_f64();
            let after = Duration::from_secs_f64((reset - unix_now).max(0.0));
            inner.window.reset_after = after;
            inner.window.reset_at = now + after;
        }
    }

    /// 429 with user or shared scope: hold this bucket for `retry_after`.
    pub fn pause(&self, retry_after: Duration) {
        let mut inner = self.inner.lock();
        let until = Instant::now() + retry_after;
        inner.window.remaining = 0;
        inner.window.paused_until = Some(match inner.window.paused_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        self.stats.lock().pauses += 1;
        debug!(bucket = %self.name, ?retry_after, "bucket paused");
    }

    /// Take every queued waiter, in priority-then-FIFO order. Used when a
    /// synthetic bucket is rebound to a hashed one.
    fn drain_waiters(&self) -> Vec<Arc<WaiterCell>> {
        let mut inner = self.inner.lock();
        let mut cells = Vec::with_capacity(inner.queued);
        for queue in &mut inner.queues {
            cells.extend(queue.drain(..));
        }
        inner.queued = 0;
        cells
    }

    fn absorb(self: &Arc<Self>, cells: Vec<Arc<WaiterCell>>) {
        if cells.is_empty() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            for cell in cells {
                if *cell.state.lock() == WaitState::Queued {
                    inner.queues[cell.priority].push_back(cell);
                    inner.queued += 1;
                }
            }
        }
        self.kick();
    }
}

fn next_waiter(inner: &mut Inner) -> Option<Arc<WaiterCell>> {
    for queue in &mut inner.queues {
        if let Some(cell) = queue.pop_front() {
            inner.queued -= 1;
            return Some(cell);
        }
    }
    None
}

fn jittered_wait(base: Duration, factor: f64) -> Duration {
    if base.is_zero() || factor <= 0.0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(-1.0..1.0) * factor * base.as_secs_f64();
    Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.0))
}

/// Returns the slot if the acquiring future is dropped between slot grant
/// and token grant.
struct SlotGuard {
    bucket: Arc<RateLimitBucket>,
    armed: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.bucket.pass_slot();
        }
    }
}

/// Cleans up a parked waiter whose future was dropped.
struct WaitGuard {
    cell: Arc<WaiterCell>,
    armed: bool,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let owner = self.cell.owner.lock().upgrade();
        if let Some(bucket) = owner {
            let mut inner = bucket.inner.lock();
            let mut state = self.cell.state.lock();
            match *state {
                WaitState::Queued => {
                    *state = WaitState::Finished;
                    drop(state);
                    RateLimitBucket::remove_waiter_locked(
                        &mut inner,
                        self.cell.id,
                        self.cell.priority,
                    );
                }
                WaitState::Granted => {
                    // Granted but never picked up; pass it on.
                    *state = WaitState::Finished;
                    drop(state);
                    bucket.pass_slot_locked(&mut inner);
                }
                WaitState::Evicted | WaitState::Finished => {}
            }
        } else {
            *self.cell.state.lock() = WaitState::Finished;
        }
    }
}

/// A granted request: the single-flight slot plus one token.
#[must_use = "dropping a permit without release() skips the header refresh"]
pub struct BucketPermit {
    bucket: Arc<RateLimitBucket>,
    token: TokenKind,
    done: bool,
}

impl BucketPermit {
    /// Fold the response's rate-limit headers in, then free the slot.
    /// Call before classifying the response so concurrent callers see the
    /// updated window.
    pub fn release(mut self, headers: &RateLimitHeaders) {
        self.done = true;
        self.bucket.apply_headers(headers);
        self.bucket.pass_slot();
    }

    /// The request never reached the wire: give the token back untouched.
    pub fn refund(mut self) {
        self.done = true;
        {
            let mut inner = self.bucket.inner.lock();
            match self.token {
                TokenKind::Window => {
                    inner.window.remaining = (inner.window.remaining + 1).min(inner.window.limit);
                }
                TokenKind::Burst => {
                    inner.window.burst_used = inner.window.burst_used.saturating_sub(1);
                }
            }
        }
        self.bucket.pass_slot();
    }
}

impl Drop for BucketPermit {
    fn drop(&mut self) {
        if !self.done {
            // Sent but no headers came back (transport fault): the token
            // stays consumed, the slot moves on.
            self.bucket.pass_slot();
        }
    }
}

/// All buckets, keyed by hash once learned, by route key until then.
pub struct BucketRegistry {
    opts: RateLimitOptions,
    inner: Mutex<RegistryInner>,
    global_pause: Mutex<Option<Instant>>,
}

struct RegistryInner {
    by_hash: HashMap<String, Arc<RateLimitBucket>>,
    by_route: HashMap<String, Arc<RateLimitBucket>>,
    route_hash: HashMap<String, String>,
}

impl BucketRegistry {
    #[must_use]
    pub fn new(opts: RateLimitOptions) -> Self {
        Self {
            opts,
            inner: Mutex::new(RegistryInner {
                by_hash: HashMap::new(),
                by_route: HashMap::new(),
                route_hash: HashMap::new(),
            }),
            global_pause: Mutex::new(None),
        }
    }

    /// Bucket to acquire for `route`: the bound hashed bucket, or a
    /// synthetic per-route one until a hash is learned.
    #[must_use]
    pub fn bucket_for(&self, route: &str) -> Arc<RateLimitBucket> {
        let mut inner = self.inner.lock();
        if let Some(bucket) = inner.by_route.get(route) {
            return Arc::clone(bucket);
        }
        let bucket = Arc::new(RateLimitBucket::new(route, true, self.opts.clone()));
        inner.by_route.insert(route.to_owned(), Arc::clone(&bucket));
        bucket
    }

    /// Learn from a response: bind (or rebind) the route to the server's
    /// bucket hash and migrate waiters off the synthetic bucket.
    pub fn observe(&self, route: &str, headers: &RateLimitHeaders) {
        let Some(hash) = headers.bucket.as_deref() else {
            return;
        };

        let (new, old) = {
            let mut inner = self.inner.lock();
            if inner.route_hash.get(route).map(String::as_str) == Some(hash) {
                return;
            }
            let new = Arc::clone(inner.by_hash.entry(hash.to_owned()).or_insert_with(|| {
                Arc::new(RateLimitBucket::new(hash, false, self.opts.clone()))
            }));
            let old = inner.by_route.insert(route.to_owned(), Arc::clone(&new));
            inner.route_hash.insert(route.to_owned(), hash.to_owned());
            (new, old)
        };

        new.apply_headers(headers);

        if let Some(old) = old {
            if old.is_synthetic() && !Arc::ptr_eq(&old, &new) {
                debug!(route, hash, "route rebound to server bucket");
                let cells = old.drain_waiters();
                for cell in &cells {
                    *cell.owner.lock() = Arc::downgrade(&new);
                }
                new.absorb(cells);
            }
        }
    }

    /// 429 with global scope: freeze every bucket.
    pub fn pause_all(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut pause = self.global_pause.lock();
        if pause.map_or(true, |existing| existing < until) {
            *pause = Some(until);
        }
        warn!(?retry_after, "global rate limit, all buckets paused");
    }

    /// Remaining global pause, if any.
    #[must_use]
    pub fn global_delay(&self) -> Option<Duration> {
        let mut pause = self.global_pause.lock();
        match *pause {
            Some(until) => {
                let now = Instant::now();
                if now >= until {
                    *pause = None;
                    None
                } else {
                    Some(until - now)
                }
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn opts() -> RateLimitOptions {
        RateLimitOptions {
            burst_capacity: 1,
            max_queue_size: 4,
            drop_on_limit: false,
            jitter_factor: 0.0,
        }
    }

    fn headers(limit: u32, remaining: u32, reset_after: f64) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: Some(limit),
            remaining: Some(remaining),
            reset_after: Some(reset_after),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_bucket_serializes_but_always_grants() {
        let bucket = Arc::new(RateLimitBucket::new("r", true, opts()));
        let permit = bucket.acquire(Priority::Normal).await.unwrap();
        permit.release(&RateLimitHeaders::default());
        let permit = bucket.acquire(Priority::Normal).await.unwrap();
        permit.release(&RateLimitHeaders::default());
        assert_eq!(bucket.stats().granted, 2);
    }

    #[tokio::test]
    async fn dry_window_blocks_until_reset() {
        let bucket = Arc::new(RateLimitBucket::new("r", true, opts()));
        let permit = bucket.acquire(Priority::Normal).await.unwrap();
        // Server says: window of 2, nothing left, resets in 60ms.
        permit.release(&headers(2, 0, 0.06));

        let start = Instant::now();
        let permit = bucket.acquire(Priority::Normal).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(55));
        permit.release(&headers(2, 1, 1.0));
    }

    #[tokio::test]
    async fn burst_reserve_is_for_urgent_only() {
        let bucket = Arc::new(RateLimitBucket::new("r", true, opts()));
        let permit = bucket.acquire(Priority::Normal).await.unwrap();
        permit.release(&headers(5, 0, 5.0));

        // Normal priority has to wait out the window...
        let normal = tokio::time::timeout(
            Duration::from_millis(30),
            bucket.acquire(Priority::Normal),
        )
        .await;
        assert!(normal.is_err(), "normal priority should not get burst");

        // ...but HIGH takes the burst token immediately.
        let urgent = tokio::time::timeout(
            Duration::from_millis(30),
            bucket.acquire(Priority::High),
        )
        .await
        .expect("urgent acquires burst")
        .unwrap();
        assert_eq!(bucket.stats().burst_granted, 1);
        urgent.release(&headers(5, 0, 5.0));
    }

    #[tokio::test]
    async fn waiters_wake_in_priority_order() {
        let bucket = Arc::new(RateLimitBucket::new("r", true, opts()));
        let held = bucket.acquire(Priority::Normal).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));

        let b1 = {
            let bucket = Arc::clone(&bucket);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let p = bucket.acquire(Priority::Background).await.unwrap();
                order.lock().push("background");
                p.release(&RateLimitHeaders::default());
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b2 = {
            let bucket = Arc::clone(&bucket);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let p = bucket.acquire(Priority::Critical).await.unwrap();
                order.lock().push("critical");
                p.release(&RateLimitHeaders::default());
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Both queued; critical entered last but runs first.
        held.release(&RateLimitHeaders::default());
        b2.await.unwrap();
        b1.await.unwrap();
        assert_eq!(*order.lock(), vec!["critical", "background"]);
    }

    #[tokio::test]
    async fn full_queue_drops_when_configured() {
        let strict = RateLimitOptions {
            max_queue_size: 1,
            drop_on_limit: true,
            ..opts()
        };
        let bucket = Arc::new(RateLimitBucket::new("r", true, strict));
        let _held = bucket.acquire(Priority::Normal).await.unwrap();

        let bucket2 = Arc::clone(&bucket);
        let _parked = tokio::spawn(async move {
            let _ = bucket2.acquire(Priority::Normal).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let overflow = bucket.acquire(Priority::Critical).await;
        assert!(matches!(overflow, Err(Error::RateLimited { .. })));
        assert_eq!(bucket.stats().rejected, 1);
    }

    #[tokio::test]
    async fn full_queue_evicts_lowest_priority_tail() {
        let strict = RateLimitOptions {
            max_queue_size: 1,
            drop_on_limit: false,
            ..opts()
        };
        let bucket = Arc::new(RateLimitBucket::new("r", true, strict));
        let held = bucket.acquire(Priority::Normal).await.unwrap();

        let bucket2 = Arc::clone(&bucket);
        let victim = tokio::spawn(async move {
            bucket2.acquire(Priority::Background).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Queue full; a critical arrival evicts the background waiter.
        let bucket3 = Arc::clone(&bucket);
        let winner = tokio::spawn(async move {
            bucket3.acquire(Priority::Critical).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let evicted = victim.await.unwrap();
        assert!(matches!(evicted, Err(Error::RateLimited { .. })));

        held.release(&RateLimitHeaders::default());
        let permit = winner.await.unwrap().unwrap();
        permit.release(&RateLimitHeaders::default());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_wedge_the_slot() {
        let bucket = Arc::new(RateLimitBucket::new("r", true, opts()));
        let held = bucket.acquire(Priority::Normal).await.unwrap();

        let bucket2 = Arc::clone(&bucket);
        let parked = tokio::spawn(async move {
            let _ = bucket2.acquire(Priority::Normal).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        parked.abort();
        let _ = parked.await;

        held.release(&RateLimitHeaders::default());

        // Slot must be free for the next acquirer.
        let permit = tokio::time::timeout(
            Duration::from_millis(100),
            bucket.acquire(Priority::Normal),
        )
        .await
        .expect("slot released despite cancelled waiter")
        .unwrap();
        permit.release(&RateLimitHeaders::default());
    }

    #[tokio::test]
    async fn refund_restores_the_token() {
        let bucket = Arc::new(RateLimitBucket::new("r", true, opts()));
        let permit = bucket.acquire(Priority::Normal).await.unwrap();
        permit.release(&headers(3, 2, 5.0));

        let permit = bucket.acquire(Priority::Normal).await.unwrap();
        assert_eq!(bucket.snapshot().remaining, 1);
        permit.refund();
        assert_eq!(bucket.snapshot().remaining, 2);
    }

    #[tokio::test]
    async fn pause_holds_acquires_for_retry_after() {
        let bucket = Arc::new(RateLimitBucket::new("r", true, opts()));
        bucket.pause(Duration::from_millis(60));
        let start = Instant::now();
        let permit = bucket.acquire(Priority::Normal).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(55));
        permit.release(&RateLimitHeaders::default());
    }

    #[tokio::test]
    async fn registry_binds_routes_to_hashes() {
        let registry = BucketRegistry::new(opts());
        let route = "GET:/channels/1/messages/{id}";
        let synthetic = registry.bucket_for(route);
        assert!(synthetic.is_synthetic());

        let mut h = headers(5, 4, 2.0);
        h.bucket = Some("abcd".into());
        registry.observe(route, &h);

        let bound = registry.bucket_for(route);
        assert!(!bound.is_synthetic());
        assert_eq!(bound.name(), "abcd");
        assert_eq!(bound.snapshot().limit, 5);

        // Another route reporting the same hash shares the bucket.
        registry.observe("DELETE:/channels/1/messages/{id}", &h);
        let sibling = registry.bucket_for("DELETE:/channels/1/messages/{id}");
        assert!(Arc::ptr_eq(&bound, &sibling));
    }

    #[tokio::test]
    async fn rebinding_migrates_queued_waiters() {
        let registry = Arc::new(BucketRegistry::new(opts()));
        let route = "POST:/channels/1/messages";
        let synthetic = registry.bucket_for(route);

        let held = synthetic.acquire(Priority::Normal).await.unwrap();
        let parked = {
            let synthetic = Arc::clone(&synthetic);
            tokio::spawn(async move {
                let p = synthetic.acquire(Priority::Normal).await.unwrap();
                p.release(&RateLimitHeaders::default());
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut h = headers(5, 5, 2.0);
        h.bucket = Some("hash9".into());
        registry.observe(route, &h);

        // The waiter now lives on (and is granted by) the hashed bucket.
        tokio::time::timeout(Duration::from_millis(200), parked)
            .await
            .expect("migrated waiter granted")
            .unwrap();
        held.release(&RateLimitHeaders::default());
    }

    #[tokio::test]
    async fn global_pause_expires() {
        let registry = BucketRegistry::new(opts());
        assert!(registry.global_delay().is_none());
        registry.pause_all(Duration::from_millis(40));
        assert!(registry.global_delay().is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.global_delay().is_none());
    }
}
