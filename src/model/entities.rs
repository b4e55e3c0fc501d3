use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

use crate::model::id::{ChannelId, GuildId, MessageId, RoleId, Snowflake, UserId};
use crate::model::permissions::{PermissionOverwrite, Permissions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

/// Cached guild.
///
/// Channels, roles and members live in their own tables; the guild only keeps
/// their ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guild {
    pub id: GuildId,
    pub name: String,
    pub owner_id: Option<UserId>,
    /// Channel ids ordered by channel position, then id.
    pub channel_ids: Vec<ChannelId>,
    pub role_ids: BTreeSet<RoleId>,
    pub member_count: Option<u64>,
    /// `true` once the full member list has been loaded.
    pub chunked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum ChannelKind {
    Text,
    Direct,
    Voice,
    GroupDirect,
    Category,
    Announcement,
    Thread,
    Forum,
    Unknown(u8),
}

impl ChannelKind {
    pub fn is_private(self) -> bool {
        matches!(self, Self::Direct | Self::GroupDirect)
    }
}

impl From<u8> for ChannelKind {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Text,
            1 => Self::Direct,
            2 => Self::Voice,
            3 => Self::GroupDirect,
            4 => Self::Category,
            5 => Self::Announcement,
            11 | 12 => Self::Thread,
            15 => Self::Forum,
            other => Self::Unknown(other),
        }
    }
}

impl From<ChannelKind> for u8 {
    fn from(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Text => 0,
            ChannelKind::Direct => 1,
            ChannelKind::Voice => 2,
            ChannelKind::GroupDirect => 3,
            ChannelKind::Category => 4,
            ChannelKind::Announcement => 5,
            ChannelKind::Thread => 11,
            ChannelKind::Forum => 15,
            ChannelKind::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub parent_id: Option<ChannelId>,
    #[serde(default, rename = "permission_overwrites")]
    pub overwrites: Vec<PermissionOverwrite>,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildMember {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub roles: BTreeSet<RoleId>,
    pub nick: Option<String>,
    pub joined_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    /// Not part of the role payload; filled in from the enclosing frame.
    #[serde(default)]
    pub guild_id: GuildId,
    pub name: String,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Emoji {
    #[serde(default)]
    pub id: Option<Snowflake>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub emoji: Emoji,
    pub count: u32,
    /// Reactors observed through gateway events. May be fewer than `count`
    /// when the reaction predates the session.
    pub users: BTreeSet<UserId>,
}

/// Where a message was posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Guild { guild_id: GuildId },
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: User,
    pub content: String,
    pub timestamp: Option<String>,
    pub edited_timestamp: Option<String>,
    pub reactions: Vec<Reaction>,
    pub kind: MessageKind,
}

impl Message {
    pub fn guild_id(&self) -> Option<GuildId> {
        match self.kind {
            MessageKind::Guild { guild_id } => Some(guild_id),
            MessageKind::Private => None,
        }
    }

    pub fn reaction(&self, emoji: &Emoji) -> Option<&Reaction> {
        self.reactions.iter().find(|reaction| &reaction.emoji == emoji)
    }

    /// Records `user_id` reacting with `emoji`. Returns `false` when the
    /// reaction was already known.
    pub(crate) fn add_reaction(&mut self, emoji: &Emoji, user_id: UserId) -> bool {
        match self.reactions.iter_mut().find(|r| &r.emoji == emoji) {
            Some(reaction) => {
                let inserted = reaction.users.insert(user_id);
                if inserted {
                    reaction.count = reaction.count.saturating_add(1);
                }
                inserted
            }
            None => {
                self.reactions.push(Reaction {
                    emoji: emoji.clone(),
                    count: 1,
                    users: BTreeSet::from([user_id]),
                });
                true
            }
        }
    }

    /// Removes `user_id`'s reaction. Returns `false` if nothing changed.
    pub(crate) fn remove_reaction(&mut self, emoji: &Emoji, user_id: UserId) -> bool {
        let Some(index) = self.reactions.iter().position(|r| &r.emoji == emoji) else {
            return false;
        };
        let reaction = &mut self.reactions[index];
        let known = reaction.users.remove(&user_id);
        let untracked = reaction.count as usize > reaction.users.len() + usize::from(known);
        if !known && !untracked {
            return false;
        }
        reaction.count = reaction.count.saturating_sub(1);
        if reaction.count == 0 {
            self.reactions.remove(index);
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    pub guild_id: GuildId,
    pub user: User,
}

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`) in partial update payloads.
pub(crate) fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            id: Snowflake::new(1),
            channel_id: Snowflake::new(2),
            author: User {
                id: Snowflake::new(3),
                username: "author".to_string(),
                global_name: None,
                bot: false,
            },
            content: "hi".to_string(),
            timestamp: None,
            edited_timestamp: None,
            reactions: Vec::new(),
            kind: MessageKind::Private,
        }
    }

    fn thumbs() -> Emoji {
        Emoji {
            id: None,
            name: Some("👍".to_string()),
        }
    }

    #[test]
    fn duplicate_reaction_adds_are_idempotent() {
        let mut msg = message();
        assert!(msg.add_reaction(&thumbs(), Snowflake::new(9)));
        assert!(!msg.add_reaction(&thumbs(), Snowflake::new(9)));
        assert_eq!(msg.reaction(&thumbs()).map(|r| r.count), Some(1));
    }

    #[test]
    fn removing_last_reaction_drops_entry() {
        let mut msg = message();
        msg.add_reaction(&thumbs(), Snowflake::new(9));
        assert!(msg.remove_reaction(&thumbs(), Snowflake::new(9)));
        assert!(msg.reactions.is_empty());
        assert!(!msg.remove_reaction(&thumbs(), Snowflake::new(9)));
    }

    #[test]
    fn untracked_reactors_can_be_removed() {
        let mut msg = message();
        msg.reactions.push(Reaction {
            emoji: thumbs(),
            count: 2,
            users: BTreeSet::new(),
        });
        assert!(msg.remove_reaction(&thumbs(), Snowflake::new(4)));
        assert_eq!(msg.reaction(&thumbs()).map(|r| r.count), Some(1));
    }

    #[test]
    fn channel_kind_round_trips_unknown_codes() {
        let channel: Channel =
            serde_json::from_str(r#"{"id":"5","type":99}"#).expect("decode channel");
        assert_eq!(channel.kind, ChannelKind::Unknown(99));
        assert_eq!(u8::from(channel.kind), 99);
        assert!(channel.overwrites.is_empty());
    }
}
