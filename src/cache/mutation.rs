//! Decoded domain frames: the only input the cache accepts.
//!
//! Create payloads carry whole objects. Update payloads are partial: every
//! field other than the ids is optional and absent fields leave the cached
//! value untouched. Fields that may be explicitly nulled use a nested
//! `Option` (`Some(None)` clears).

use serde::Deserialize;

use crate::model::entities::double_option;
use crate::model::{
    Ban, Channel, ChannelId, ChannelKind, Emoji, GuildId, MessageId, PermissionOverwrite,
    Permissions, Role, RoleId, User, UserId,
};

#[derive(Debug, Clone)]
pub enum Mutation {
    Ready(Box<ReadySnapshot>),
    GuildCreate(Box<GuildPayload>),
    GuildUpdate(GuildPatch),
    GuildDelete(GuildRemoval),
    ChannelCreate(Channel),
    ChannelUpdate(ChannelPatch),
    ChannelDelete(ChannelRemoval),
    MessageCreate(Box<MessagePayload>),
    MessageUpdate(MessagePatch),
    MessageDelete(MessageRemoval),
    ReactionAdd(ReactionPayload),
    ReactionRemove(ReactionPayload),
    MemberAdd(MemberPayload),
    MemberUpdate(MemberPatch),
    MemberRemove(MemberRemoval),
    MembersChunk(MembersChunk),
    RoleCreate(RoleEnvelope),
    RoleUpdate(RolePatchEnvelope),
    RoleDelete(RoleRemoval),
    BanAdd(Ban),
    BanRemove(Ban),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadySnapshot {
    pub user: User,
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub guilds: Vec<GuildPayload>,
    #[serde(default)]
    pub private_channels: Vec<Channel>,
    #[serde(default)]
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildPayload {
    pub id: GuildId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub member_count: Option<u64>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub members: Vec<MemberPayload>,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildPatch {
    pub id: GuildId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub member_count: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildRemoval {
    pub id: GuildId,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelPatch {
    pub id: ChannelId,
    #[serde(default, rename = "type")]
    pub kind: Option<ChannelKind>,
    #[serde(default, deserialize_with = "double_option")]
    pub name: Option<Option<String>>,
    #[serde(default)]
    pub position: Option<i32>,
    #[serde(default, deserialize_with = "double_option")]
    pub parent_id: Option<Option<ChannelId>>,
    #[serde(default, rename = "permission_overwrites")]
    pub overwrites: Option<Vec<PermissionOverwrite>>,
    #[serde(default, deserialize_with = "double_option")]
    pub last_message_id: Option<Option<MessageId>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRemoval {
    pub id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionCount {
    #[serde(default)]
    pub count: u32,
    pub emoji: Emoji,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub author: User,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub reactions: Vec<ReactionCount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePatch {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub edited_timestamp: Option<Option<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageRemoval {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionPayload {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub emoji: Emoji,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberPayload {
    pub user: User,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub joined_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberPatch {
    pub guild_id: GuildId,
    pub user: User,
    #[serde(default)]
    pub roles: Option<Vec<RoleId>>,
    #[serde(default, deserialize_with = "double_option")]
    pub nick: Option<Option<String>>,
    #[serde(default)]
    pub joined_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberRemoval {
    pub guild_id: GuildId,
    pub user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembersChunk {
    pub guild_id: GuildId,
    #[serde(default)]
    pub members: Vec<MemberPayload>,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default = "single_chunk")]
    pub chunk_count: u32,
}

fn single_chunk() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleEnvelope {
    pub guild_id: GuildId,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RolePatch {
    pub id: RoleId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    #[serde(default)]
    pub color: Option<u32>,
    #[serde(default)]
    pub position: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RolePatchEnvelope {
    pub guild_id: GuildId,
    pub role: RolePatch,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleRemoval {
    pub guild_id: GuildId,
    pub role_id: RoleId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_and_null_fields_are_distinct() {
        let absent: MemberPatch = serde_json::from_str(
            r#"{"guild_id":"1","user":{"id":"2","username":"u"}}"#,
        )
        .expect("decode absent");
        assert!(absent.nick.is_none());
        assert!(absent.roles.is_none());

        let cleared: MemberPatch = serde_json::from_str(
            r#"{"guild_id":"1","user":{"id":"2","username":"u"},"nick":null}"#,
        )
        .expect("decode null");
        assert_eq!(cleared.nick, Some(None));
    }

    #[test]
    fn chunk_defaults_to_single_chunk() {
        let chunk: MembersChunk =
            serde_json::from_str(r#"{"guild_id":"1"}"#).expect("decode chunk");
        assert_eq!(chunk.chunk_count, 1);
        assert!(chunk.members.is_empty());
    }
}
