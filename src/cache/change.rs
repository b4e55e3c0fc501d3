use crate::model::{
    Ban, Channel, Emoji, Guild, GuildId, GuildMember, Message, Role, User, UserId,
};

/// What one applied [`Mutation`](super::Mutation) changed.
///
/// Updates carry the entity as it was before the frame and as it is after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Ready {
        user: User,
        guilds: usize,
        private_channels: usize,
    },
    GuildCreated(Guild),
    GuildUpdated {
        old: Guild,
        new: Guild,
    },
    GuildDeleted(RemovedGuild),
    ChannelCreated(Channel),
    ChannelUpdated {
        old: Channel,
        new: Channel,
    },
    ChannelDeleted(Channel),
    MessageCreated(Message),
    MessageUpdated {
        old: Message,
        new: Message,
    },
    MessageDeleted(Message),
    ReactionAdded(ReactionChange),
    ReactionRemoved(ReactionChange),
    MemberAdded(GuildMember),
    MemberUpdated {
        old: GuildMember,
        new: GuildMember,
    },
    MemberRemoved(GuildMember),
    MembersChunked {
        guild_id: GuildId,
        count: usize,
        /// `true` when this chunk completed the guild's member list.
        complete: bool,
    },
    RoleCreated(Role),
    RoleUpdated(RoleUpdate),
    RoleDeleted {
        role: Role,
        /// Members whose role set still named the deleted role.
        pruned_members: Vec<UserId>,
    },
    BanAdded(Ban),
    BanRemoved(Ban),
}

/// A guild removed together with everything it owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedGuild {
    pub guild: Guild,
    pub channels: Vec<Channel>,
    pub roles: Vec<Role>,
    pub members: Vec<GuildMember>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionChange {
    /// The message after the reaction was applied.
    pub message: Message,
    pub user_id: UserId,
    pub emoji: Emoji,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleUpdate {
    pub old: Role,
    pub new: Role,
}

impl RoleUpdate {
    /// The role moved relative to its siblings.
    pub fn reordered(&self) -> bool {
        self.old.position != self.new.position
    }

    pub fn permissions_changed(&self) -> bool {
        self.old.permissions != self.new.permissions
    }

    /// Whether permission resolution for holders of this role may differ.
    ///
    /// A pure reorder counts: precedence decides which overwrite is applied
    /// last even when no bitmask changed.
    pub fn affects_resolution(&self) -> bool {
        self.reordered() || self.permissions_changed()
    }
}

impl Change {
    /// Guild the change belongs to, if any.
    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            Self::Ready { .. } => None,
            Self::GuildCreated(guild) => Some(guild.id),
            Self::GuildUpdated { new, .. } => Some(new.id),
            Self::GuildDeleted(removed) => Some(removed.guild.id),
            Self::ChannelCreated(channel) | Self::ChannelDeleted(channel) => channel.guild_id,
            Self::ChannelUpdated { new, .. } => new.guild_id,
            Self::MessageCreated(message) | Self::MessageDeleted(message) => message.guild_id(),
            Self::MessageUpdated { new, .. } => new.guild_id(),
            Self::ReactionAdded(change) | Self::ReactionRemoved(change) => {
                change.message.guild_id()
            }
            Self::MemberAdded(member) | Self::MemberRemoved(member) => Some(member.guild_id),
            Self::MemberUpdated { new, .. } => Some(new.guild_id),
            Self::MembersChunked { guild_id, .. } => Some(*guild_id),
            Self::RoleCreated(role) => Some(role.guild_id),
            Self::RoleUpdated(update) => Some(update.new.guild_id),
            Self::RoleDeleted { role, .. } => Some(role.guild_id),
            Self::BanAdded(ban) | Self::BanRemoved(ban) => Some(ban.guild_id),
        }
    }
}
