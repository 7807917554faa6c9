//! Plain wire records.
//!
//! Records carry IDs, not back-pointers; anything computed (tag, display
//! name, creation time) is a pure function of the record. Cache mutation
//! happens through explicit `apply_update` methods, field by field — unknown
//! fields from the server are dropped at deserialization.

use serde::{Deserialize, Serialize};

use super::{Embed, Snowflake};

/// A Discord user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,

    pub username: String,

    /// Legacy discriminator; `"0"` under the new username system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,

    #[serde(default)]
    pub bot: bool,
}

impl User {
    /// `name#1234` for legacy users, bare username otherwise.
    #[must_use]
    pub fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some(d) if d != "0" => format!("{}#{d}", self.username),
            _ => self.username.clone(),
        }
    }

    /// Global display name, falling back to the username.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }

    /// Unix milliseconds this account was created, from the snowflake.
    #[must_use]
    pub const fn created_at_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }

    pub(crate) fn apply_update(&mut self, update: &Self) {
        self.username.clone_from(&update.username);
        self.discriminator.clone_from(&update.discriminator);
        self.global_name.clone_from(&update.global_name);
        self.avatar.clone_from(&update.avatar);
        self.bot = update.bot;
    }
}

/// Index of the default (CDN) avatar for a user without a custom one.
///
/// Legacy accounts (non-`"0"` discriminator) hash on the discriminator;
/// migrated accounts hash on the snowflake timestamp bits.
#[must_use]
pub fn default_avatar_index(user: &User) -> u8 {
    match user.discriminator.as_deref() {
        Some(d) if d != "0" => {
            let disc: u64 = d.parse().unwrap_or(0);
            (disc % 5) as u8
        }
        _ => ((user.id.get() >> 22) % 6) as u8,
    }
}

/// A guild, as much of it as the core tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    pub id: Snowflake,

    #[serde(default)]
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<Snowflake>,

    #[serde(default)]
    pub unavailable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<u64>,
}

impl Guild {
    pub(crate) fn apply_update(&mut self, update: &Self) {
        self.name.clone_from(&update.name);
        self.icon.clone_from(&update.icon);
        if update.owner_id.is_some() {
            self.owner_id = update.owner_id;
        }
        if update.member_count.is_some() {
            self.member_count = update.member_count;
        }
        self.unavailable = update.unavailable;
    }
}

/// The stub GUILD_DELETE / READY carry for guilds the bot cannot see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableGuild {
    pub id: Snowflake,

    #[serde(default)]
    pub unavailable: bool,
}

/// Channel kind, exhaustive over the documented wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    GuildText,
    Dm,
    GuildVoice,
    GroupDm,
    GuildCategory,
    GuildAnnouncement,
    AnnouncementThread,
    PublicThread,
    PrivateThread,
    GuildStageVoice,
    GuildDirectory,
    GuildForum,
    GuildMedia,
    /// A value this library does not know yet.
    Unknown(u8),
}

impl From<u8> for ChannelType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::GuildText,
            1 => Self::Dm,
            2 => Self::GuildVoice,
            3 => Self::GroupDm,
            4 => Self::GuildCategory,
            5 => Self::GuildAnnouncement,
            10 => Self::AnnouncementThread,
            11 => Self::PublicThread,
            12 => Self::PrivateThread,
            13 => Self::GuildStageVoice,
            14 => Self::GuildDirectory,
            15 => Self::GuildForum,
            16 => Self::GuildMedia,
            other => Self::Unknown(other),
        }
    }
}

impl From<ChannelType> for u8 {
    fn from(value: ChannelType) -> Self {
        match value {
            ChannelType::GuildText => 0,
            ChannelType::Dm => 1,
            ChannelType::GuildVoice => 2,
            ChannelType::GroupDm => 3,
            ChannelType::GuildCategory => 4,
            ChannelType::GuildAnnouncement => 5,
            ChannelType::AnnouncementThread => 10,
            ChannelType::PublicThread => 11,
            ChannelType::PrivateThread => 12,
            ChannelType::GuildStageVoice => 13,
            ChannelType::GuildDirectory => 14,
            ChannelType::GuildForum => 15,
            ChannelType::GuildMedia => 16,
            ChannelType::Unknown(other) => other,
        }
    }
}

impl Serialize for ChannelType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8((*self).into())
    }
}

impl<'de> Deserialize<'de> for ChannelType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from)
    }
}

/// A channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Snowflake,

    #[serde(rename = "type")]
    pub kind: ChannelType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<Snowflake>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Snowflake>,
}

impl Channel {
    pub(crate) fn apply_update(&mut self, update: &Self) {
        self.kind = update.kind;
        self.name.clone_from(&update.name);
        self.topic.clone_from(&update.topic);
        if update.parent_id.is_some() {
            self.parent_id = update.parent_id;
        }
    }
}

/// A message, as received from the gateway or REST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Snowflake,

    pub channel_id: Snowflake,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<Snowflake>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<User>,

    #[serde(default)]
    pub content: String,

    /// ISO8601, passed through untouched.
    #[serde(default)]
    pub timestamp: String,

    #[serde(default)]
    pub tts: bool,

    #[serde(default)]
    pub mention_everyone: bool,

    #[serde(default)]
    pub attachments: Vec<Attachment>,

    #[serde(default)]
    pub embeds: Vec<Embed>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_reference: Option<MessageReference>,
}

/// A file attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Snowflake,
    pub filename: String,
    pub size: u64,
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Reply linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReference {
    pub message_id: Snowflake,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<Snowflake>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<Snowflake>,
}

/// HELLO payload data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Heartbeat cadence in milliseconds.
    pub heartbeat_interval: u64,
}

/// READY dispatch data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    pub v: i32,
    pub user: User,
    pub session_id: String,
    pub resume_gateway_url: String,

    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

/// Something messages can be sent into.
pub trait Sendable {
    /// The channel messages land in.
    fn target_channel(&self) -> Snowflake;
}

impl Sendable for Channel {
    fn target_channel(&self) -> Snowflake {
        self.id
    }
}

impl Sendable for Message {
    fn target_channel(&self) -> Snowflake {
        self.channel_id
    }
}

/// Something with a DELETE endpoint.
pub trait Deletable {
    /// API path that deletes this object.
    fn delete_path(&self) -> String;
}

impl Deletable for Message {
    fn delete_path(&self) -> String {
        format!("/channels/{}/messages/{}", self.channel_id, self.id)
    }
}

impl Deletable for Channel {
    fn delete_path(&self) -> String {
        format!("/channels/{}", self.id)
    }
}

/// Something reactions can be added to.
pub trait Reactable {
    /// API path that adds `emoji` as the bot's own reaction.
    fn reaction_path(&self, emoji: &str) -> String;
}

impl Reactable for Message {
    fn reaction_path(&self, emoji: &str) -> String {
        let encoded = percent_encoding::utf8_percent_encode(
            emoji,
            percent_encoding::NON_ALPHANUMERIC,
        );
        format!(
            "/channels/{}/messages/{}/reactions/{encoded}/@me",
            self.channel_id, self.id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(discriminator: Option<&str>) -> User {
        User {
            id: Snowflake(175_928_847_299_117_063),
            username: "wumpus".into(),
            discriminator: discriminator.map(Into::into),
            global_name: Some("Wumpus".into()),
            avatar: None,
            bot: false,
        }
    }

    #[test]
    fn tag_branches_on_discriminator() {
        assert_eq!(user(Some("1337")).tag(), "wumpus#1337");
        assert_eq!(user(Some("0")).tag(), "wumpus");
        assert_eq!(user(None).tag(), "wumpus");
    }

    #[test]
    fn default_avatar_covers_both_schemes() {
        assert_eq!(default_avatar_index(&user(Some("1337"))), (1337 % 5) as u8);
        let expected = ((175_928_847_299_117_063_u64 >> 22) % 6) as u8;
        assert_eq!(default_avatar_index(&user(Some("0"))), expected);
        assert_eq!(default_avatar_index(&user(None)), expected);
    }

    #[test]
    fn channel_type_wire_round_trip() {
        for raw in [0_u8, 1, 5, 13, 16, 99] {
            let kind = ChannelType::from(raw);
            assert_eq!(u8::from(kind), raw);
        }
        let json = serde_json::to_string(&ChannelType::GuildText).unwrap();
        assert_eq!(json, "0");
    }

    #[test]
    fn reaction_path_percent_encodes() {
        let msg = Message {
            id: Snowflake(2),
            channel_id: Snowflake(1),
            guild_id: None,
            author: None,
            content: String::new(),
            timestamp: String::new(),
            tts: false,
            mention_everyone: false,
            attachments: vec![],
            embeds: vec![],
            message_reference: None,
        };
        let path = msg.reaction_path("🔥");
        assert!(path.starts_with("/channels/1/messages/2/reactions/%F0%9F%94%A5"));
        assert!(path.ends_with("/@me"));
    }

    #[test]
    fn guild_update_is_field_by_field() {
        let mut guild = Guild {
            id: Snowflake(1),
            name: "old".into(),
            icon: Some("hash".into()),
            owner_id: Some(Snowflake(9)),
            unavailable: false,
            member_count: Some(10),
        };
        let patch = Guild {
            id: Snowflake(1),
            name: "new".into(),
            icon: None,
            owner_id: None,
            unavailable: false,
            member_count: None,
        };
        guild.apply_update(&patch);
        assert_eq!(guild.name, "new");
        assert_eq!(guild.icon, None);
        // Absent-in-patch scalars keep their cached value.
        assert_eq!(guild.owner_id, Some(Snowflake(9)));
        assert_eq!(guild.member_count, Some(10));
    }
}
