//! In-memory entity cache with change diffing.
//!
//! [`EntityCache`] owns the single canonical copy of every entity one account
//! can see. The session's decode path feeds it [`Mutation`]s; each mutation is
//! applied under one write lock and returns the [`Change`] it produced, so
//! readers on other tasks never observe a half-applied frame.
//!
//! Mutation rules:
//! - a create for an id that is already cached replaces it and reports an update;
//! - updates and deletes for uncached ids are dropped without a change;
//! - deleting a guild removes its channels, roles, members and message history;
//! - deleting a role removes it from every cached member's role set at once.

/// Diff values returned by [`EntityCache::apply`].
pub mod change;
/// Decoded frame payloads accepted by the cache.
pub mod mutation;
/// Bounded per-channel message history.
pub mod ring;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use change::{Change, ReactionChange, RemovedGuild, RoleUpdate};
pub use mutation::{
    ChannelPatch, ChannelRemoval, GuildPatch, GuildPayload, GuildRemoval, MemberPatch,
    MemberPayload, MemberRemoval, MembersChunk, MessagePatch, MessagePayload, MessageRemoval,
    Mutation, ReactionCount, ReactionPayload, ReadySnapshot, RoleEnvelope, RolePatch,
    RolePatchEnvelope, RoleRemoval,
};
pub use ring::MessageRing;

use crate::model::permissions::{compute_permissions, highest_role, PermissionContext};
use crate::model::{
    Ban, Channel, ChannelId, ChannelKind, Guild, GuildId, GuildMember, Message, MessageId,
    MessageKind, Permissions, Reaction, Role, RoleId, User, UserId,
};

/// Default number of messages retained per channel.
pub const DEFAULT_MESSAGE_CAPACITY: usize = 100;

/// Thread-safe entity cache for one account.
#[derive(Debug)]
pub struct EntityCache {
    state: RwLock<CacheState>,
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE_CAPACITY)
    }
}

impl EntityCache {
    /// Creates an empty cache retaining `message_capacity` messages per channel.
    pub fn new(message_capacity: usize) -> Self {
        Self {
            state: RwLock::new(CacheState::new(message_capacity)),
        }
    }

    /// Applies one mutation atomically and returns what changed.
    pub fn apply(&self, mutation: Mutation) -> Option<Change> {
        self.write_guard().apply(mutation)
    }

    /// Drops every cached entity.
    pub fn clear(&self) {
        self.write_guard().clear();
    }

    /// Runs `f` against a consistent view of the cache.
    ///
    /// The read lock is held for the duration of `f`; keep it short.
    pub fn read<R>(&self, f: impl FnOnce(&CacheState) -> R) -> R {
        f(&self.read_guard())
    }

    /// Returns an owned copy of the whole cache.
    pub fn snapshot(&self) -> CacheState {
        self.read_guard().clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.read(|state| state.current_user().cloned())
    }

    pub fn user(&self, id: UserId) -> Option<User> {
        self.read(|state| state.user(id).cloned())
    }

    pub fn guild(&self, id: GuildId) -> Option<Guild> {
        self.read(|state| state.guild(id).cloned())
    }

    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.read(|state| state.channel(id).cloned())
    }

    pub fn role(&self, id: RoleId) -> Option<Role> {
        self.read(|state| state.role(id).cloned())
    }

    pub fn member(&self, guild_id: GuildId, user_id: UserId) -> Option<GuildMember> {
        self.read(|state| state.member(guild_id, user_id).cloned())
    }

    /// Channels of a guild in display order.
    pub fn guild_channels(&self, guild_id: GuildId) -> Vec<Channel> {
        self.read(|state| state.guild_channels(guild_id).into_iter().cloned().collect())
    }

    /// Roles of a guild, highest precedence first.
    pub fn guild_roles(&self, guild_id: GuildId) -> Vec<Role> {
        self.read(|state| state.guild_roles(guild_id).into_iter().cloned().collect())
    }

    /// Retained messages of a channel, oldest first.
    pub fn messages(&self, channel_id: ChannelId) -> Vec<Message> {
        self.read(|state| {
            state
                .messages(channel_id)
                .map(|ring| ring.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn message(&self, channel_id: ChannelId, message_id: MessageId) -> Option<Message> {
        self.read(|state| state.message(channel_id, message_id).cloned())
    }

    /// Effective permissions of a member, optionally inside a channel.
    pub fn permissions_for(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: Option<ChannelId>,
    ) -> Option<Permissions> {
        self.read(|state| state.permissions_for(guild_id, user_id, channel_id))
    }

    pub fn highest_role(&self, guild_id: GuildId, user_id: UserId) -> Option<Role> {
        self.read(|state| state.highest_role(guild_id, user_id).cloned())
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cache tables. Obtained through [`EntityCache::read`] or
/// [`EntityCache::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheState {
    message_capacity: usize,
    current_user: Option<User>,
    users: HashMap<UserId, User>,
    guilds: HashMap<GuildId, Guild>,
    channels: HashMap<ChannelId, Channel>,
    roles: HashMap<RoleId, Role>,
    members: HashMap<(GuildId, UserId), GuildMember>,
    messages: HashMap<ChannelId, MessageRing>,
}

impl CacheState {
    fn new(message_capacity: usize) -> Self {
        Self {
            message_capacity: message_capacity.max(1),
            current_user: None,
            users: HashMap::new(),
            guilds: HashMap::new(),
            channels: HashMap::new(),
            roles: HashMap::new(),
            members: HashMap::new(),
            messages: HashMap::new(),
        }
    }

    pub fn current_user(&self) -> Option<&User> {
        self.current_user.as_ref()
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn guild(&self, id: GuildId) -> Option<&Guild> {
        self.guilds.get(&id)
    }

    pub fn guilds(&self) -> impl Iterator<Item = &Guild> {
        self.guilds.values()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Direct and group message channels.
    pub fn private_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values().filter(|channel| channel.guild_id.is_none())
    }

    pub fn role(&self, id: RoleId) -> Option<&Role> {
        self.roles.get(&id)
    }

    pub fn member(&self, guild_id: GuildId, user_id: UserId) -> Option<&GuildMember> {
        self.members.get(&(guild_id, user_id))
    }

    pub fn guild_members(&self, guild_id: GuildId) -> impl Iterator<Item = &GuildMember> {
        self.members
            .values()
            .filter(move |member| member.guild_id == guild_id)
    }

    pub fn guild_channels(&self, guild_id: GuildId) -> Vec<&Channel> {
        self.guilds
            .get(&guild_id)
            .map(|guild| {
                guild
                    .channel_ids
                    .iter()
                    .filter_map(|id| self.channels.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn guild_roles(&self, guild_id: GuildId) -> Vec<&Role> {
        let mut roles: Vec<&Role> = self
            .guilds
            .get(&guild_id)
            .map(|guild| {
                guild
                    .role_ids
                    .iter()
                    .filter_map(|id| self.roles.get(id))
                    .collect()
            })
            .unwrap_or_default();
        roles.sort_by(|a, b| (b.position, b.id).cmp(&(a.position, a.id)));
        roles
    }

    pub fn messages(&self, channel_id: ChannelId) -> Option<&MessageRing> {
        self.messages.get(&channel_id)
    }

    pub fn message(&self, channel_id: ChannelId, message_id: MessageId) -> Option<&Message> {
        self.messages.get(&channel_id)?.get(message_id)
    }

    /// Resolves a member's permissions from the current role positions and,
    /// when `channel_id` is given, that channel's overwrites.
    ///
    /// Returns `None` when the guild or member is not cached, or the channel
    /// does not belong to the guild.
    pub fn permissions_for(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        channel_id: Option<ChannelId>,
    ) -> Option<Permissions> {
        let guild = self.guilds.get(&guild_id)?;
        let member = self.members.get(&(guild_id, user_id))?;
        let overwrites = match channel_id {
            Some(id) => {
                let channel = self.channels.get(&id)?;
                if channel.guild_id != Some(guild_id) {
                    return None;
                }
                channel.overwrites.as_slice()
            }
            None => &[],
        };
        let member_roles = self.member_roles(member);
        Some(compute_permissions(PermissionContext {
            guild_id,
            owner_id: guild.owner_id,
            user_id,
            everyone: self.roles.get(&guild_id),
            member_roles: &member_roles,
            overwrites,
        }))
    }

    pub fn highest_role(&self, guild_id: GuildId, user_id: UserId) -> Option<&Role> {
        let member = self.members.get(&(guild_id, user_id))?;
        highest_role(self.member_roles(member))
    }

    fn member_roles(&self, member: &GuildMember) -> Vec<&Role> {
        member
            .roles
            .iter()
            .filter_map(|id| self.roles.get(id))
            .filter(|role| role.guild_id == member.guild_id)
            .collect()
    }

    fn clear(&mut self) {
        *self = Self::new(self.message_capacity);
    }

    fn apply(&mut self, mutation: Mutation) -> Option<Change> {
        match mutation {
            Mutation::Ready(snapshot) => Some(self.load_snapshot(*snapshot)),
            Mutation::GuildCreate(payload) => self.create_guild(*payload),
            Mutation::GuildUpdate(patch) => self.update_guild(patch),
            Mutation::GuildDelete(removal) => self.delete_guild(removal),
            Mutation::ChannelCreate(channel) => self.create_channel(channel),
            Mutation::ChannelUpdate(patch) => self.update_channel(patch),
            Mutation::ChannelDelete(removal) => self.delete_channel(removal),
            Mutation::MessageCreate(payload) => Some(self.create_message(*payload)),
            Mutation::MessageUpdate(patch) => self.update_message(patch),
            Mutation::MessageDelete(removal) => self.delete_message(removal),
            Mutation::ReactionAdd(payload) => self.react(payload, true),
            Mutation::ReactionRemove(payload) => self.react(payload, false),
            Mutation::MemberAdd(payload) => self.add_member(payload),
            Mutation::MemberUpdate(patch) => self.update_member(patch),
            Mutation::MemberRemove(removal) => self.remove_member(removal),
            Mutation::MembersChunk(chunk) => self.apply_chunk(chunk),
            Mutation::RoleCreate(envelope) => self.create_role(envelope),
            Mutation::RoleUpdate(envelope) => self.update_role(envelope),
            Mutation::RoleDelete(removal) => self.delete_role(removal),
            Mutation::BanAdd(ban) => Some(self.add_ban(ban)),
            Mutation::BanRemove(ban) => Some(Change::BanRemoved(ban)),
        }
    }

    fn load_snapshot(&mut self, snapshot: ReadySnapshot) -> Change {
        self.clear();
        let ReadySnapshot {
            user,
            guilds,
            private_channels,
            users,
            ..
        } = snapshot;

        for known in users {
            self.users.insert(known.id, known);
        }
        self.users.insert(user.id, user.clone());
        self.current_user = Some(user.clone());

        let mut guild_count = 0;
        for payload in guilds {
            if payload.unavailable {
                continue;
            }
            self.insert_guild(payload);
            guild_count += 1;
        }
        let private_count = private_channels.len();
        for mut channel in private_channels {
            channel.guild_id = None;
            self.channels.insert(channel.id, channel);
        }

        Change::Ready {
            user,
            guilds: guild_count,
            private_channels: private_count,
        }
    }

    fn insert_guild(&mut self, payload: GuildPayload) -> Guild {
        let GuildPayload {
            id,
            name,
            owner_id,
            member_count,
            channels,
            roles,
            members,
            ..
        } = payload;

        let mut role_ids = BTreeSet::new();
        for mut role in roles {
            role.guild_id = id;
            role_ids.insert(role.id);
            self.roles.insert(role.id, role);
        }
        let mut channel_ids = Vec::with_capacity(channels.len());
        for mut channel in channels {
            channel.guild_id = Some(id);
            channel_ids.push(channel.id);
            self.channels.insert(channel.id, channel);
        }
        order_channels(&mut channel_ids, &self.channels);

        let loaded = members.len() as u64;
        for member in members {
            self.upsert_member(id, member);
        }

        let guild = Guild {
            id,
            name,
            owner_id,
            channel_ids,
            role_ids,
            member_count,
            chunked: member_count.is_some_and(|count| loaded >= count),
        };
        self.guilds.insert(id, guild.clone());
        guild
    }

    fn create_guild(&mut self, payload: GuildPayload) -> Option<Change> {
        if payload.unavailable {
            tracing::debug!(event = "cache_guild_unavailable", guild_id = %payload.id);
            return None;
        }
        let Some(old) = self.guilds.get(&payload.id).cloned() else {
            return Some(Change::GuildCreated(self.insert_guild(payload)));
        };

        // A repeated create is a full snapshot: channels and roles it no
        // longer lists are gone, members are merged.
        let listed_channels: HashSet<ChannelId> =
            payload.channels.iter().map(|channel| channel.id).collect();
        for channel_id in old.channel_ids.iter().filter(|id| !listed_channels.contains(*id)) {
            self.channels.remove(channel_id);
            self.messages.remove(channel_id);
        }
        let listed_roles: HashSet<RoleId> = payload.roles.iter().map(|role| role.id).collect();
        for role_id in old.role_ids.iter().filter(|id| !listed_roles.contains(*id)) {
            self.roles.remove(role_id);
            self.prune_role(old.id, *role_id);
        }

        let mut new = self.insert_guild(payload);
        if old.chunked && !new.chunked {
            new.chunked = true;
            if let Some(guild) = self.guilds.get_mut(&new.id) {
                guild.chunked = true;
            }
        }
        Some(Change::GuildUpdated { old, new })
    }

    fn update_guild(&mut self, patch: GuildPatch) -> Option<Change> {
        let guild = self.guilds.get_mut(&patch.id)?;
        let old = guild.clone();
        if let Some(name) = patch.name {
            guild.name = name;
        }
        if let Some(owner_id) = patch.owner_id {
            guild.owner_id = Some(owner_id);
        }
        if let Some(member_count) = patch.member_count {
            guild.member_count = Some(member_count);
        }
        Some(Change::GuildUpdated {
            old,
            new: guild.clone(),
        })
    }

    fn delete_guild(&mut self, removal: GuildRemoval) -> Option<Change> {
        let guild = self.guilds.remove(&removal.id)?;
        let guild_id = guild.id;

        let channel_ids: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|channel| channel.guild_id == Some(guild_id))
            .map(|channel| channel.id)
            .collect();
        let mut channels: Vec<Channel> = channel_ids
            .iter()
            .filter_map(|id| {
                self.messages.remove(id);
                self.channels.remove(id)
            })
            .collect();
        channels.sort_by_key(|channel| (channel.position, channel.id));

        let role_ids: Vec<RoleId> = self
            .roles
            .values()
            .filter(|role| role.guild_id == guild_id)
            .map(|role| role.id)
            .collect();
        let mut roles: Vec<Role> = role_ids
            .iter()
            .filter_map(|id| self.roles.remove(id))
            .collect();
        roles.sort_by_key(|role| role.id);

        let member_keys: Vec<(GuildId, UserId)> = self
            .members
            .keys()
            .filter(|(member_guild, _)| *member_guild == guild_id)
            .copied()
            .collect();
        let mut members: Vec<GuildMember> = member_keys
            .iter()
            .filter_map(|key| self.members.remove(key))
            .collect();
        members.sort_by_key(|member| member.user_id);

        tracing::debug!(
            event = "cache_guild_removed",
            guild_id = %guild_id,
            unavailable = removal.unavailable,
            channels = channels.len(),
            roles = roles.len(),
            members = members.len()
        );
        Some(Change::GuildDeleted(RemovedGuild {
            guild,
            channels,
            roles,
            members,
        }))
    }

    fn create_channel(&mut self, mut channel: Channel) -> Option<Change> {
        if let Some(guild_id) = channel.guild_id {
            if !self.guilds.contains_key(&guild_id) {
                tracing::debug!(
                    event = "cache_channel_dropped",
                    channel_id = %channel.id,
                    guild_id = %guild_id
                );
                return None;
            }
        } else if !channel.kind.is_private() {
            channel.kind = ChannelKind::Direct;
        }

        let previous = self.channels.insert(channel.id, channel.clone());
        if let Some(guild_id) = channel.guild_id {
            if let Some(guild) = self.guilds.get_mut(&guild_id) {
                if !guild.channel_ids.contains(&channel.id) {
                    guild.channel_ids.push(channel.id);
                }
                order_channels(&mut guild.channel_ids, &self.channels);
            }
        }
        Some(match previous {
            Some(old) => Change::ChannelUpdated { old, new: channel },
            None => Change::ChannelCreated(channel),
        })
    }

    fn update_channel(&mut self, patch: ChannelPatch) -> Option<Change> {
        let channel = self.channels.get_mut(&patch.id)?;
        let old = channel.clone();
        if let Some(kind) = patch.kind {
            channel.kind = kind;
        }
        if let Some(name) = patch.name {
            channel.name = name;
        }
        if let Some(position) = patch.position {
            channel.position = position;
        }
        if let Some(parent_id) = patch.parent_id {
            channel.parent_id = parent_id;
        }
        if let Some(overwrites) = patch.overwrites {
            channel.overwrites = overwrites;
        }
        if let Some(last_message_id) = patch.last_message_id {
            channel.last_message_id = last_message_id;
        }
        let new = channel.clone();

        if old.position != new.position {
            if let Some(guild) = new.guild_id.and_then(|id| self.guilds.get_mut(&id)) {
                order_channels(&mut guild.channel_ids, &self.channels);
            }
        }
        Some(Change::ChannelUpdated { old, new })
    }

    fn delete_channel(&mut self, removal: ChannelRemoval) -> Option<Change> {
        let channel = self.channels.remove(&removal.id)?;
        self.messages.remove(&channel.id);
        if let Some(guild) = channel.guild_id.and_then(|id| self.guilds.get_mut(&id)) {
            guild.channel_ids.retain(|id| *id != channel.id);
        }
        Some(Change::ChannelDeleted(channel))
    }

    fn create_message(&mut self, payload: MessagePayload) -> Change {
        let MessagePayload {
            id,
            channel_id,
            guild_id,
            author,
            content,
            timestamp,
            edited_timestamp,
            reactions,
        } = payload;

        let guild_id =
            guild_id.or_else(|| self.channels.get(&channel_id).and_then(|c| c.guild_id));
        let kind = match guild_id {
            Some(guild_id) => MessageKind::Guild { guild_id },
            None => MessageKind::Private,
        };
        let message = Message {
            id,
            channel_id,
            author: author.clone(),
            content,
            timestamp,
            edited_timestamp,
            reactions: reactions
                .into_iter()
                .map(|reaction| Reaction {
                    emoji: reaction.emoji,
                    count: reaction.count,
                    users: BTreeSet::new(),
                })
                .collect(),
            kind,
        };
        self.users.insert(author.id, author);

        match self.channels.get_mut(&channel_id) {
            Some(channel) => {
                if channel.last_message_id.map_or(true, |last| last < id) {
                    channel.last_message_id = Some(id);
                }
            }
            None if kind == MessageKind::Private => {
                self.channels.insert(
                    channel_id,
                    Channel {
                        id: channel_id,
                        kind: ChannelKind::Direct,
                        guild_id: None,
                        name: None,
                        position: 0,
                        parent_id: None,
                        overwrites: Vec::new(),
                        last_message_id: Some(id),
                    },
                );
            }
            None => {
                tracing::debug!(
                    event = "cache_message_not_retained",
                    channel_id = %channel_id,
                    message_id = %id
                );
                return Change::MessageCreated(message);
            }
        }

        let capacity = self.message_capacity;
        let ring = self
            .messages
            .entry(channel_id)
            .or_insert_with(|| MessageRing::new(capacity));
        if let Some(existing) = ring.get_mut(id) {
            let old = std::mem::replace(existing, message.clone());
            return Change::MessageUpdated { old, new: message };
        }
        if let Some(evicted) = ring.push(message.clone()) {
            tracing::trace!(
                event = "cache_message_evicted",
                channel_id = %channel_id,
                message_id = %evicted.id
            );
        }
        Change::MessageCreated(message)
    }

    fn update_message(&mut self, patch: MessagePatch) -> Option<Change> {
        let message = self.messages.get_mut(&patch.channel_id)?.get_mut(patch.id)?;
        let old = message.clone();
        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(edited_timestamp) = patch.edited_timestamp {
            message.edited_timestamp = edited_timestamp;
        }
        Some(Change::MessageUpdated {
            old,
            new: message.clone(),
        })
    }

    fn delete_message(&mut self, removal: MessageRemoval) -> Option<Change> {
        let message = self
            .messages
            .get_mut(&removal.channel_id)?
            .remove(removal.id)?;
        Some(Change::MessageDeleted(message))
    }

    fn react(&mut self, payload: ReactionPayload, add: bool) -> Option<Change> {
        let message = self
            .messages
            .get_mut(&payload.channel_id)?
            .get_mut(payload.message_id)?;
        let changed = if add {
            message.add_reaction(&payload.emoji, payload.user_id)
        } else {
            message.remove_reaction(&payload.emoji, payload.user_id)
        };
        if !changed {
            return None;
        }
        let change = ReactionChange {
            message: message.clone(),
            user_id: payload.user_id,
            emoji: payload.emoji,
        };
        Some(if add {
            Change::ReactionAdded(change)
        } else {
            Change::ReactionRemoved(change)
        })
    }

    fn upsert_member(
        &mut self,
        guild_id: GuildId,
        payload: MemberPayload,
    ) -> (Option<GuildMember>, GuildMember) {
        let MemberPayload {
            user,
            roles,
            nick,
            joined_at,
            ..
        } = payload;
        let member = GuildMember {
            guild_id,
            user_id: user.id,
            roles: roles.into_iter().collect(),
            nick,
            joined_at,
        };
        self.users.insert(user.id, user);
        let old = self
            .members
            .insert((guild_id, member.user_id), member.clone());
        (old, member)
    }

    fn add_member(&mut self, payload: MemberPayload) -> Option<Change> {
        let guild_id = payload.guild_id?;
        if !self.guilds.contains_key(&guild_id) {
            return None;
        }
        let (old, new) = self.upsert_member(guild_id, payload);
        Some(match old {
            Some(old) => Change::MemberUpdated { old, new },
            None => {
                self.adjust_member_count(guild_id, true);
                Change::MemberAdded(new)
            }
        })
    }

    fn update_member(&mut self, patch: MemberPatch) -> Option<Change> {
        let member = self.members.get_mut(&(patch.guild_id, patch.user.id))?;
        let old = member.clone();
        if let Some(roles) = patch.roles {
            member.roles = roles.into_iter().collect();
        }
        if let Some(nick) = patch.nick {
            member.nick = nick;
        }
        if let Some(joined_at) = patch.joined_at {
            member.joined_at = Some(joined_at);
        }
        let new = member.clone();
        self.users.insert(patch.user.id, patch.user);
        Some(Change::MemberUpdated { old, new })
    }

    fn remove_member(&mut self, removal: MemberRemoval) -> Option<Change> {
        let member = self
            .members
            .remove(&(removal.guild_id, removal.user.id))?;
        self.adjust_member_count(removal.guild_id, false);
        Some(Change::MemberRemoved(member))
    }

    fn apply_chunk(&mut self, chunk: MembersChunk) -> Option<Change> {
        let guild_id = chunk.guild_id;
        if !self.guilds.contains_key(&guild_id) {
            return None;
        }
        let count = chunk.members.len();
        for member in chunk.members {
            self.upsert_member(guild_id, member);
        }
        let complete = chunk.chunk_index.saturating_add(1) >= chunk.chunk_count;
        if complete {
            if let Some(guild) = self.guilds.get_mut(&guild_id) {
                guild.chunked = true;
            }
        }
        Some(Change::MembersChunked {
            guild_id,
            count,
            complete,
        })
    }

    fn adjust_member_count(&mut self, guild_id: GuildId, joined: bool) {
        if let Some(count) = self
            .guilds
            .get_mut(&guild_id)
            .and_then(|guild| guild.member_count.as_mut())
        {
            *count = if joined {
                count.saturating_add(1)
            } else {
                count.saturating_sub(1)
            };
        }
    }

    fn create_role(&mut self, envelope: RoleEnvelope) -> Option<Change> {
        let guild = self.guilds.get_mut(&envelope.guild_id)?;
        let mut role = envelope.role;
        role.guild_id = envelope.guild_id;
        guild.role_ids.insert(role.id);
        Some(match self.roles.insert(role.id, role.clone()) {
            Some(old) => Change::RoleUpdated(RoleUpdate { old, new: role }),
            None => Change::RoleCreated(role),
        })
    }

    fn update_role(&mut self, envelope: RolePatchEnvelope) -> Option<Change> {
        let RolePatchEnvelope { guild_id, role: patch } = envelope;
        let role = self
            .roles
            .get_mut(&patch.id)
            .filter(|role| role.guild_id == guild_id)?;
        let old = role.clone();
        if let Some(name) = patch.name {
            role.name = name;
        }
        if let Some(permissions) = patch.permissions {
            role.permissions = permissions;
        }
        if let Some(color) = patch.color {
            role.color = color;
        }
        if let Some(position) = patch.position {
            role.position = position;
        }
        Some(Change::RoleUpdated(RoleUpdate {
            old,
            new: role.clone(),
        }))
    }

    fn delete_role(&mut self, removal: RoleRemoval) -> Option<Change> {
        if self.roles.get(&removal.role_id)?.guild_id != removal.guild_id {
            return None;
        }
        let role = self.roles.remove(&removal.role_id)?;
        if let Some(guild) = self.guilds.get_mut(&removal.guild_id) {
            guild.role_ids.remove(&role.id);
        }
        let pruned_members = self.prune_role(removal.guild_id, role.id);
        Some(Change::RoleDeleted {
            role,
            pruned_members,
        })
    }

    /// Removes `role_id` from every member of `guild_id`, returning the
    /// affected users in id order.
    fn prune_role(&mut self, guild_id: GuildId, role_id: RoleId) -> Vec<UserId> {
        let mut pruned: Vec<UserId> = self
            .members
            .values_mut()
            .filter(|member| member.guild_id == guild_id)
            .filter_map(|member| member.roles.remove(&role_id).then_some(member.user_id))
            .collect();
        pruned.sort();
        pruned
    }

    fn add_ban(&mut self, ban: Ban) -> Change {
        if self.members.remove(&(ban.guild_id, ban.user.id)).is_some() {
            self.adjust_member_count(ban.guild_id, false);
        }
        self.users.insert(ban.user.id, ban.user.clone());
        Change::BanAdded(ban)
    }
}

/// Orders channel ids by channel position, then id.
fn order_channels(ids: &mut [ChannelId], channels: &HashMap<ChannelId, Channel>) {
    ids.sort_by_key(|id| (channels.get(id).map_or(i32::MAX, |c| c.position), *id));
}
