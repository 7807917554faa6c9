//! In-memory caches fed by gateway dispatches.
//!
//! Read-mostly: many readers, one writer (the gateway task). User code gets
//! clones, never references into the store, and nothing here expires — only
//! explicit DELETE dispatches remove entries.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::model::{Channel, Guild, Ready, Snowflake, UnavailableGuild, User};

/// A keyed store of one record type.
#[derive(Debug)]
pub struct CacheStore<T> {
    inner: RwLock<HashMap<Snowflake, T>>,
}

impl<T> Default for CacheStore<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> CacheStore<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn get(&self, id: Snowflake) -> Option<T> {
        self.inner.read().get(&id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: Snowflake) -> bool {
        self.inner.read().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<Snowflake> {
        self.inner.read().keys().copied().collect()
    }

    pub(crate) fn insert(&self, id: Snowflake, value: T) {
        self.inner.write().insert(id, value);
    }

    pub(crate) fn remove(&self, id: Snowflake) -> Option<T> {
        self.inner.write().remove(&id)
    }

    pub(crate) fn update<F>(&self, id: Snowflake, f: F) -> bool
    where
        F: FnOnce(&mut T),
    {
        let mut inner = self.inner.write();
        match inner.get_mut(&id) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        }
    }
}

/// Every store the client owns, written only from the gateway task.
#[derive(Debug, Default)]
pub struct Caches {
    pub guilds: CacheStore<Guild>,
    pub channels: CacheStore<Channel>,
    pub users: CacheStore<User>,
    current_user: RwLock<Option<User>>,
}

impl Caches {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The bot's own user, from READY.
    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        self.current_user.read().clone()
    }

    pub(crate) fn apply_ready(&self, ready: &Ready) {
        *self.current_user.write() = Some(ready.user.clone());
        self.users.insert(ready.user.id, ready.user.clone());
        for stub in &ready.guilds {
            self.guilds.insert(
                stub.id,
                Guild {
                    id: stub.id,
                    name: String::new(),
                    icon: None,
                    owner_id: None,
                    unavailable: stub.unavailable,
                    member_count: None,
                },
            );
        }
    }

    pub(crate) fn guild_create(&self, guild: &Guild) {
        self.guilds.insert(guild.id, guild.clone());
    }

    pub(crate) fn guild_update(&self, patch: &Guild) {
        if !self.guilds.update(patch.id, |g| g.apply_update(patch)) {
            self.guilds.insert(patch.id, patch.clone());
        }
    }

    /// Removal means the bot left; an `unavailable` stub means an outage and
    /// the guild stays, flagged.
    pub(crate) fn guild_delete(&self, stub: &UnavailableGuild) {
        if stub.unavailable {
            self.guilds.update(stub.id, |g| g.unavailable = true);
        } else {
            self.guilds.remove(stub.id);
        }
    }

    pub(crate) fn channel_create(&self, channel: &Channel) {
        self.channels.insert(channel.id, channel.clone());
    }

    pub(crate) fn channel_update(&self, patch: &Channel) {
        if !self.channels.update(patch.id, |c| c.apply_update(patch)) {
            self.channels.insert(patch.id, patch.clone());
        }
    }

    pub(crate) fn channel_delete(&self, channel_id: Snowflake) {
        self.channels.remove(channel_id);
    }

    /// Any dispatch that carries a full user object refreshes the user cache.
    pub(crate) fn see_user(&self, user: &User) {
        if !self.users.update(user.id, |u| u.apply_update(user)) {
            self.users.insert(user.id, user.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelType;

    fn guild(id: u64, name: &str) -> Guild {
        Guild {
            id: Snowflake(id),
            name: name.into(),
            icon: None,
            owner_id: None,
            unavailable: false,
            member_count: None,
        }
    }

    #[test]
    fn ready_seeds_current_user_and_guild_stubs() {
        let caches = Caches::new();
        let ready = Ready {
            v: 10,
            user: User {
                id: Snowflake(7),
                username: "bot".into(),
                discriminator: Some("0".into()),
                global_name: None,
                avatar: None,
                bot: true,
            },
            session_id: "abc".into(),
            resume_gateway_url: "wss://gw".into(),
            guilds: vec![UnavailableGuild {
                id: Snowflake(100),
                unavailable: true,
            }],
        };
        caches.apply_ready(&ready);
        assert_eq!(caches.current_user().unwrap().id, Snowflake(7));
        assert!(caches.guilds.get(Snowflake(100)).unwrap().unavailable);
    }

    #[test]
    fn guild_lifecycle() {
        let caches = Caches::new();
        caches.guild_create(&guild(1, "alpha"));
        caches.guild_update(&guild(1, "beta"));
        assert_eq!(caches.guilds.get(Snowflake(1)).unwrap().name, "beta");

        // Outage keeps the entry, flagged.
        caches.guild_delete(&UnavailableGuild {
            id: Snowflake(1),
            unavailable: true,
        });
        assert!(caches.guilds.get(Snowflake(1)).unwrap().unavailable);

        // Actual removal drops it.
        caches.guild_delete(&UnavailableGuild {
            id: Snowflake(1),
            unavailable: false,
        });
        assert!(caches.guilds.get(Snowflake(1)).is_none());
    }

    #[test]
    fn channel_delete_removes() {
        let caches = Caches::new();
        let channel = Channel {
            id: Snowflake(5),
            kind: ChannelType::GuildText,
            guild_id: Some(Snowflake(1)),
            name: Some("general".into()),
            topic: None,
            parent_id: None,
        };
        caches.channel_create(&channel);
        assert!(caches.channels.contains(Snowflake(5)));
        caches.channel_delete(Snowflake(5));
        assert!(!caches.channels.contains(Snowflake(5)));
    }

    #[test]
    fn seeing_a_user_twice_patches_in_place() {
        let caches = Caches::new();
        let mut user = User {
            id: Snowflake(9),
            username: "old".into(),
            discriminator: None,
            global_name: None,
            avatar: None,
            bot: false,
        };
        caches.see_user(&user);
        user.username = "new".into();
        caches.see_user(&user);
        assert_eq!(caches.users.len(), 1);
        assert_eq!(caches.users.get(Snowflake(9)).unwrap().username, "new");
    }
}
