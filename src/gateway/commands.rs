//! Outbound gateway commands and their rate limit.
//!
//! The server allows 120 commands per 60 seconds per connection, heartbeats
//! included. Heartbeats are always recorded (they must go out); other
//! commands are admitted only when the window has room, and presence
//! updates are the first thing dropped under pressure.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::payload::Opcode;

/// What kind of command this is, for drop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Presence updates are cosmetic and droppable.
    PresenceUpdate,
    VoiceStateUpdate,
    RequestGuildMembers,
    Other,
}

impl CommandKind {
    #[must_use]
    pub const fn droppable(self) -> bool {
        matches!(self, Self::PresenceUpdate)
    }
}

/// A user-initiated gateway frame.
#[derive(Debug, Clone)]
pub struct GatewayCommand {
    pub op: Opcode,
    pub data: Value,
    pub kind: CommandKind,
}

impl GatewayCommand {
    #[must_use]
    pub fn presence(data: Value) -> Self {
        Self {
            op: Opcode::PresenceUpdate,
            data,
            kind: CommandKind::PresenceUpdate,
        }
    }

    #[must_use]
    pub fn voice_state(data: Value) -> Self {
        Self {
            op: Opcode::VoiceStateUpdate,
            data,
            kind: CommandKind::VoiceStateUpdate,
        }
    }

    #[must_use]
    pub fn request_guild_members(data: Value) -> Self {
        Self {
            op: Opcode::RequestGuildMembers,
            data,
            kind: CommandKind::RequestGuildMembers,
        }
    }
}

/// Sliding-window counter over sent commands.
#[derive(Debug)]
pub struct CommandLimiter {
    max: usize,
    window: Duration,
    sent: VecDeque<Instant>,
}

impl CommandLimiter {
    #[must_use]
    pub const fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            sent: VecDeque::new(),
        }
    }

    /// The server limit: 120 commands per 60 seconds.
    #[must_use]
    pub const fn discord_default() -> Self {
        Self::new(120, Duration::from_secs(60))
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.sent.front() {
            if now.duration_since(*front) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Admit one command if the window has room.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.sent.len() < self.max {
            self.sent.push_back(now);
            true
        } else {
            false
        }
    }

    /// Record a send unconditionally (heartbeats).
    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.sent.push_back(now);
    }

    /// How long until the window has room again.
    #[must_use]
    pub fn retry_in(&self, now: Instant) -> Duration {
        if self.sent.len() < self.max {
            return Duration::ZERO;
        }
        self.sent
            .front()
            .map_or(Duration::ZERO, |front| {
                self.window.saturating_sub(now.duration_since(*front))
            })
    }

    #[must_use]
    pub fn in_window(&self) -> usize {
        self.sent.len()
    }
}
