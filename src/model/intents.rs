//! Gateway intent bitmask.

use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Which dispatch categories the gateway should stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Intents(u64);

impl Intents {
    pub const GUILDS: Self = Self(1 << 0);
    pub const GUILD_MEMBERS: Self = Self(1 << 1);
    pub const GUILD_MODERATION: Self = Self(1 << 2);
    pub const GUILD_EMOJIS_AND_STICKERS: Self = Self(1 << 3);
    pub const GUILD_INTEGRATIONS: Self = Self(1 << 4);
    pub const GUILD_WEBHOOKS: Self = Self(1 << 5);
    pub const GUILD_INVITES: Self = Self(1 << 6);
    pub const GUILD_VOICE_STATES: Self = Self(1 << 7);
    pub const GUILD_PRESENCES: Self = Self(1 << 8);
    pub const GUILD_MESSAGES: Self = Self(1 << 9);
    pub const GUILD_MESSAGE_REACTIONS: Self = Self(1 << 10);
    pub const GUILD_MESSAGE_TYPING: Self = Self(1 << 11);
    pub const DIRECT_MESSAGES: Self = Self(1 << 12);
    pub const DIRECT_MESSAGE_REACTIONS: Self = Self(1 << 13);
    pub const DIRECT_MESSAGE_TYPING: Self = Self(1 << 14);
    pub const MESSAGE_CONTENT: Self = Self(1 << 15);
    pub const GUILD_SCHEDULED_EVENTS: Self = Self(1 << 16);
    pub const AUTO_MODERATION_CONFIGURATION: Self = Self(1 << 20);
    pub const AUTO_MODERATION_EXECUTION: Self = Self(1 << 21);

    const KNOWN: [Self; 19] = [
        Self::GUILDS,
        Self::GUILD_MEMBERS,
        Self::GUILD_MODERATION,
        Self::GUILD_EMOJIS_AND_STICKERS,
        Self::GUILD_INTEGRATIONS,
        Self::GUILD_WEBHOOKS,
        Self::GUILD_INVITES,
        Self::GUILD_VOICE_STATES,
        Self::GUILD_PRESENCES,
        Self::GUILD_MESSAGES,
        Self::GUILD_MESSAGE_REACTIONS,
        Self::GUILD_MESSAGE_TYPING,
        Self::DIRECT_MESSAGES,
        Self::DIRECT_MESSAGE_REACTIONS,
        Self::DIRECT_MESSAGE_TYPING,
        Self::MESSAGE_CONTENT,
        Self::GUILD_SCHEDULED_EVENTS,
        Self::AUTO_MODERATION_CONFIGURATION,
        Self::AUTO_MODERATION_EXECUTION,
    ];

    /// Every known intent bit.
    pub const ALL: Self = {
        let mut bits = 0;
        let mut i = 0;
        while i < Self::KNOWN.len() {
            bits |= Self::KNOWN[i].0;
            i += 1;
        }
        Self(bits)
    };

    /// Everything except the privileged intents.
    pub const DEFAULT: Self = Self(
        Self::ALL.0 & !Self::GUILD_MEMBERS.0 & !Self::GUILD_PRESENCES.0 & !Self::MESSAGE_CONTENT.0,
    );

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Intents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Intents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Intents {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}
