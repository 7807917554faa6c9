//! Wire-level data records shared by both engines.

mod embed;
mod intents;
mod permissions;
mod snowflake;
mod types;

pub use embed::{
    Embed, EmbedAuthor, EmbedBuilder, EmbedField, EmbedFooter, EmbedImage, EmbedThumbnail,
};
pub use intents::Intents;
pub use permissions::Permissions;
pub use snowflake::Snowflake;
pub use types::{
    default_avatar_index, Attachment, Channel, ChannelType, Deletable, Guild, Hello, Message,
    MessageReference, Reactable, Ready, Sendable, UnavailableGuild, User,
};
