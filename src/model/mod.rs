//! Entities of the account's visible world.
//!
//! - `id`: snowflake identifiers and the local account label.
//! - `entities`: guilds, channels, members, roles, messages, reactions, bans.
//! - `permissions`: permission bitmask and member permission resolution.

/// Guild, channel, member, role, and message types.
pub mod entities;
/// Identifier newtypes.
pub mod id;
/// Permission bitmask and resolution.
pub mod permissions;

pub use entities::{
    Ban, Channel, ChannelKind, Emoji, Guild, GuildMember, Message, MessageKind, Reaction, Role,
    User,
};
pub use id::{AccountId, ChannelId, GuildId, MessageId, RoleId, Snowflake, UserId};
pub use permissions::{OverwriteKind, PermissionOverwrite, Permissions};
