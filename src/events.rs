//! In-process event dispatch.
//!
//! Listeners run synchronously, in insertion order, against a snapshot of
//! the listener list taken at emit time — mutating the bus from inside a
//! listener never affects the dispatch in progress. A panicking listener is
//! isolated; an `error` event with nobody listening is fatal to the emitting
//! task.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::model::{Channel, Guild, Message, Ready, Snowflake, UnavailableGuild};

/// A typed event, either a gateway lifecycle change or a dispatch frame.
#[derive(Debug, Clone)]
pub enum Event {
    /// Socket opened, HELLO not yet seen.
    Open,
    /// READY received; the session is live.
    Ready(Box<Ready>),
    /// RESUMED received; replay is complete.
    Resumed,
    /// The engine is about to reconnect.
    Reconnect { code: Option<u16> },
    /// The socket closed.
    Close { code: Option<u16> },
    /// A fault worth surfacing to listeners.
    Error { message: String },

    MessageCreate(Box<Message>),
    MessageUpdate(Box<Message>),
    MessageDelete {
        id: Snowflake,
        channel_id: Snowflake,
        guild_id: Option<Snowflake>,
    },
    GuildCreate(Box<Guild>),
    GuildUpdate(Box<Guild>),
    GuildDelete(UnavailableGuild),
    ChannelCreate(Box<Channel>),
    ChannelUpdate(Box<Channel>),
    ChannelDelete(Box<Channel>),
    TypingStart(serde_json::Value),

    /// Listener-count watermark crossed for `kind`.
    MaxListenersExceeded { kind: EventKind },

    /// A dispatch this library has no typed shape for.
    Unknown {
        name: String,
        data: serde_json::Value,
    },
}

/// Listener registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Ready,
    Resumed,
    Reconnect,
    Close,
    Error,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    TypingStart,
    MaxListenersExceeded,
    Unknown,
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Ready(_) => EventKind::Ready,
            Self::Resumed => EventKind::Resumed,
            Self::Reconnect { .. } => EventKind::Reconnect,
            Self::Close { .. } => EventKind::Close,
            Self::Error { .. } => EventKind::Error,
            Self::MessageCreate(_) => EventKind::MessageCreate,
            Self::MessageUpdate(_) => EventKind::MessageUpdate,
            Self::MessageDelete { .. } => EventKind::MessageDelete,
            Self::GuildCreate(_) => EventKind::GuildCreate,
            Self::GuildUpdate(_) => EventKind::GuildUpdate,
            Self::GuildDelete(_) => EventKind::GuildDelete,
            Self::ChannelCreate(_) => EventKind::ChannelCreate,
            Self::ChannelUpdate(_) => EventKind::ChannelUpdate,
            Self::ChannelDelete(_) => EventKind::ChannelDelete,
            Self::TypingStart(_) => EventKind::TypingStart,
            Self::MaxListenersExceeded { .. } => EventKind::MaxListenersExceeded,
            Self::Unknown { .. } => EventKind::Unknown,
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Entry {
    id: u64,
    once: bool,
    f: Listener,
}

struct Inner {
    listeners: HashMap<EventKind, Vec<Entry>>,
    next_id: u64,
    warned: HashSet<EventKind>,
}

/// Multi-listener dispatcher.
pub struct EventBus {
    inner: Mutex<Inner>,
    max_listeners: usize,
    capture_panics: bool,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("max_listeners", &self.max_listeners)
            .field("capture_panics", &self.capture_panics)
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                listeners: HashMap::new(),
                next_id: 0,
                warned: HashSet::new(),
            }),
            max_listeners: 10,
            capture_panics: false,
        }
    }

    /// Route listener panics to the `error` event instead of only logging.
    #[must_use]
    pub const fn with_capture_panics(mut self, capture: bool) -> Self {
        self.capture_panics = capture;
        self
    }

    #[must_use]
    pub const fn with_max_listeners(mut self, max: usize) -> Self {
        self.max_listeners = max;
        self
    }

    /// Register a listener. Listeners for a kind run in registration order.
    pub fn on<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(f), false)
    }

    /// Register a listener that auto-removes after its first invocation.
    pub fn once<F>(&self, kind: EventKind, f: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(f), true)
    }

    fn register(&self, kind: EventKind, f: Listener, once: bool) -> ListenerId {
        let (id, over_limit) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let id = inner.next_id;
            inner.next_id += 1;
            let entries = inner.listeners.entry(kind).or_default();
            entries.push(Entry { id, once, f });
            let over = entries.len() > self.max_listeners && !inner.warned.contains(&kind);
            if over {
                inner.warned.insert(kind);
            }
            (id, over)
        };

        if over_limit {
            warn!(?kind, max = self.max_listeners, "listener count exceeds max_listeners");
            self.emit(&Event::MaxListenersExceeded { kind });
        }
        ListenerId(id)
    }

    /// Remove a listener. Returns whether it was found.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.listeners.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.id != id.0);
        before != entries.len()
    }

    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .listeners
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Dispatch to every listener registered at the moment of the call.
    /// Returns how many listeners ran.
    ///
    /// # Panics
    ///
    /// Emitting [`EventKind::Error`] with no listeners panics, by contract:
    /// an unobserved error must not pass silently.
    pub fn emit(&self, event: &Event) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Entry> = {
            let mut inner = self.inner.lock();
            match inner.listeners.get_mut(&kind) {
                Some(entries) => {
                    let snapshot = entries.clone();
                    entries.retain(|e| !e.once);
                    snapshot
                }
                None => Vec::new(),
            }
        };

        if kind == EventKind::Error && snapshot.is_empty() {
            error!(?event, "error event with no listeners");
            panic!("unhandled error event: {event:?}");
        }

        for entry in &snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| (entry.f)(event)));
            if let Err(payload) = result {
                let message = panic_message(&payload);
                if self.capture_panics && kind != EventKind::Error {
                    self.emit(&Event::Error {
                        message: format!("listener panicked: {message}"),
                    });
                } else {
                    error!(?kind, %message, "listener panicked");
                }
            }
        }
        snapshot.len()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    eprintln!("DEBUG is_str={} is_string={} type_id={:?} strid={:?}", payload.is::<&str>(), payload.is::<String>(), payload.type_id(), std::any::TypeId::of::<&str>());
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".into())
}
