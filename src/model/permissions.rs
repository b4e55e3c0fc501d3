//! Permission bitmask and member permission resolution.
//!
//! Resolution order for a member in a channel:
//! 1. guild owner gets everything;
//! 2. the `@everyone` role (id equal to the guild id) and every member role are
//!    OR-ed into the base set, `ADMINISTRATOR` short-circuits to everything;
//! 3. channel overwrites are applied last: `@everyone` first, then the member's
//!    role overwrites in ascending role precedence so the highest role settles
//!    any conflict, then the member-specific overwrite.
//!
//! The base set is the union of every held role, not the permissions of the
//! highest role alone: a grant on a lower role still applies. Role position
//! decides two things only, which role [`highest_role`] reports for hierarchy
//! checks and the order in which role overwrites are applied.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::entities::Role;
use crate::model::id::{GuildId, RoleId, Snowflake, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Permissions(u64);

impl Permissions {
    pub const CREATE_INSTANT_INVITE: Self = Self(1 << 0);
    pub const KICK_MEMBERS: Self = Self(1 << 1);
    pub const BAN_MEMBERS: Self = Self(1 << 2);
    pub const ADMINISTRATOR: Self = Self(1 << 3);
    pub const MANAGE_CHANNELS: Self = Self(1 << 4);
    pub const MANAGE_GUILD: Self = Self(1 << 5);
    pub const ADD_REACTIONS: Self = Self(1 << 6);
    pub const VIEW_AUDIT_LOG: Self = Self(1 << 7);
    pub const PRIORITY_SPEAKER: Self = Self(1 << 8);
    pub const STREAM: Self = Self(1 << 9);
    pub const VIEW_CHANNEL: Self = Self(1 << 10);
    pub const SEND_MESSAGES: Self = Self(1 << 11);
    pub const SEND_TTS_MESSAGES: Self = Self(1 << 12);
    pub const MANAGE_MESSAGES: Self = Self(1 << 13);
    pub const EMBED_LINKS: Self = Self(1 << 14);
    pub const ATTACH_FILES: Self = Self(1 << 15);
    pub const READ_MESSAGE_HISTORY: Self = Self(1 << 16);
    pub const MENTION_EVERYONE: Self = Self(1 << 17);
    pub const USE_EXTERNAL_EMOJIS: Self = Self(1 << 18);
    pub const VIEW_GUILD_INSIGHTS: Self = Self(1 << 19);
    pub const CONNECT: Self = Self(1 << 20);
    pub const SPEAK: Self = Self(1 << 21);
    pub const MUTE_MEMBERS: Self = Self(1 << 22);
    pub const DEAFEN_MEMBERS: Self = Self(1 << 23);
    pub const MOVE_MEMBERS: Self = Self(1 << 24);
    pub const CHANGE_NICKNAME: Self = Self(1 << 26);
    pub const MANAGE_NICKNAMES: Self = Self(1 << 27);
    pub const MANAGE_ROLES: Self = Self(1 << 28);
    pub const MANAGE_WEBHOOKS: Self = Self(1 << 29);
    pub const MANAGE_THREADS: Self = Self(1 << 34);
    pub const CREATE_PUBLIC_THREADS: Self = Self(1 << 35);
    pub const CREATE_PRIVATE_THREADS: Self = Self(1 << 36);
    pub const MODERATE_MEMBERS: Self = Self(1 << 40);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn all() -> Self {
        Self(u64::MAX)
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

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    #[must_use]
    fn overwritten(self, overwrite: &PermissionOverwrite) -> Self {
        Self((self.0 & !overwrite.deny.0) | overwrite.allow.0)
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permissions {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for Permissions {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BitsVisitor;

        impl Visitor<'_> for BitsVisitor {
            type Value = Permissions;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a permission bitmask as a decimal string or integer")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Permissions(value))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map(Permissions).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(BitsVisitor)
    }
}

/// Target of a channel permission overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OverwriteKind {
    Role,
    Member,
}

impl TryFrom<u8> for OverwriteKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Role),
            1 => Ok(Self::Member),
            other => Err(format!("unknown overwrite type {other}")),
        }
    }
}

impl From<OverwriteKind> for u8 {
    fn from(kind: OverwriteKind) -> Self {
        match kind {
            OverwriteKind::Role => 0,
            OverwriteKind::Member => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOverwrite {
    pub id: Snowflake,
    #[serde(rename = "type")]
    pub kind: OverwriteKind,
    #[serde(default)]
    pub allow: Permissions,
    #[serde(default)]
    pub deny: Permissions,
}

/// Total precedence order of roles inside one guild.
///
/// Higher position wins; equal positions fall back to the id so that two roles
/// never compare equal.
pub fn role_precedence(role: &Role) -> (i32, RoleId) {
    (role.position, role.id)
}

/// Highest-precedence role among `roles`.
pub fn highest_role<'a, I>(roles: I) -> Option<&'a Role>
where
    I: IntoIterator<Item = &'a Role>,
{
    roles.into_iter().max_by_key(|role| role_precedence(role))
}

/// Inputs for a permission computation, borrowed from the cache.
#[derive(Debug, Clone, Copy)]
pub struct PermissionContext<'a> {
    pub guild_id: GuildId,
    pub owner_id: Option<UserId>,
    pub user_id: UserId,
    /// The `@everyone` role, if cached.
    pub everyone: Option<&'a Role>,
    /// Roles the member holds, in any order.
    pub member_roles: &'a [&'a Role],
    /// Overwrites of the channel being checked; empty for guild-level checks.
    pub overwrites: &'a [PermissionOverwrite],
}

pub fn compute_permissions(ctx: PermissionContext<'_>) -> Permissions {
    if ctx.owner_id == Some(ctx.user_id) {
        return Permissions::all();
    }

    let mut base = ctx
        .everyone
        .map(|role| role.permissions)
        .unwrap_or_default();
    for role in ctx.member_roles {
        base |= role.permissions;
    }
    if base.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }

    if let Some(everyone) = ctx
        .overwrites
        .iter()
        .find(|over| over.kind == OverwriteKind::Role && over.id == ctx.guild_id)
    {
        base = base.overwritten(everyone);
    }

    let mut ordered: Vec<&Role> = ctx.member_roles.to_vec();
    ordered.sort_by_key(|role| role_precedence(role));
    for role in ordered {
        if let Some(over) = ctx
            .overwrites
            .iter()
            .find(|over| over.kind == OverwriteKind::Role && over.id == role.id)
        {
            base = base.overwritten(over);
        }
    }

    if let Some(member) = ctx
        .overwrites
        .iter()
        .find(|over| over.kind == OverwriteKind::Member && over.id == ctx.user_id)
    {
        base = base.overwritten(member);
    }

    base
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUILD: u64 = 1;
    const USER: u64 = 50;

    fn role(id: u64, position: i32, permissions: Permissions) -> Role {
        Role {
            id: Snowflake::new(id),
            guild_id: Snowflake::new(GUILD),
            name: format!("role-{id}"),
            permissions,
            color: 0,
            position,
        }
    }

    fn role_overwrite(id: u64, allow: Permissions, deny: Permissions) -> PermissionOverwrite {
        PermissionOverwrite {
            id: Snowflake::new(id),
            kind: OverwriteKind::Role,
            allow,
            deny,
        }
    }

    fn ctx<'a>(
        everyone: Option<&'a Role>,
        member_roles: &'a [&'a Role],
        overwrites: &'a [PermissionOverwrite],
    ) -> PermissionContext<'a> {
        PermissionContext {
            guild_id: Snowflake::new(GUILD),
            owner_id: Some(Snowflake::new(999)),
            user_id: Snowflake::new(USER),
            everyone,
            member_roles,
            overwrites,
        }
    }

    #[test]
    fn owner_has_everything() {
        let mut context = ctx(None, &[], &[]);
        context.owner_id = Some(Snowflake::new(USER));
        assert_eq!(compute_permissions(context), Permissions::all());
    }

    #[test]
    fn administrator_bypasses_overwrites() {
        let admin = role(10, 3, Permissions::ADMINISTRATOR);
        let overwrites = [role_overwrite(GUILD, Permissions::empty(), Permissions::all())];
        let roles = [&admin];
        assert_eq!(
            compute_permissions(ctx(None, &roles, &overwrites)),
            Permissions::all()
        );
    }

    #[test]
    fn everyone_overwrite_can_hide_channel() {
        let everyone = role(GUILD, 0, Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES);
        let overwrites = [role_overwrite(
            GUILD,
            Permissions::empty(),
            Permissions::VIEW_CHANNEL,
        )];
        let perms = compute_permissions(ctx(Some(&everyone), &[], &overwrites));
        assert!(!perms.contains(Permissions::VIEW_CHANNEL));
        assert!(perms.contains(Permissions::SEND_MESSAGES));
    }

    #[test]
    fn highest_role_overwrite_wins_conflicts() {
        let low = role(10, 1, Permissions::empty());
        let high = role(11, 5, Permissions::empty());
        let overwrites = [
            role_overwrite(10, Permissions::empty(), Permissions::SEND_MESSAGES),
            role_overwrite(11, Permissions::SEND_MESSAGES, Permissions::empty()),
        ];
        let roles = [&low, &high];
        assert!(compute_permissions(ctx(None, &roles, &overwrites))
            .contains(Permissions::SEND_MESSAGES));

        // swapping positions flips the outcome
        let low = role(10, 5, Permissions::empty());
        let high = role(11, 1, Permissions::empty());
        let roles = [&low, &high];
        assert!(!compute_permissions(ctx(None, &roles, &overwrites))
            .contains(Permissions::SEND_MESSAGES));
    }

    #[test]
    fn resolution_ignores_assignment_order() {
        let a = role(10, 2, Permissions::ATTACH_FILES);
        let b = role(11, 4, Permissions::EMBED_LINKS);
        let overwrites = [
            role_overwrite(10, Permissions::ADD_REACTIONS, Permissions::EMBED_LINKS),
            role_overwrite(11, Permissions::EMBED_LINKS, Permissions::ADD_REACTIONS),
        ];
        let forward = [&a, &b];
        let backward = [&b, &a];
        assert_eq!(
            compute_permissions(ctx(None, &forward, &overwrites)),
            compute_permissions(ctx(None, &backward, &overwrites))
        );
    }

    #[test]
    fn member_overwrite_applies_last() {
        let everyone = role(GUILD, 0, Permissions::SEND_MESSAGES);
        let overwrites = [
            role_overwrite(GUILD, Permissions::SEND_MESSAGES, Permissions::empty()),
            PermissionOverwrite {
                id: Snowflake::new(USER),
                kind: OverwriteKind::Member,
                allow: Permissions::empty(),
                deny: Permissions::SEND_MESSAGES,
            },
        ];
        let perms = compute_permissions(ctx(Some(&everyone), &[], &overwrites));
        assert!(!perms.contains(Permissions::SEND_MESSAGES));
    }

    #[test]
    fn lower_role_grants_still_count() {
        let low = role(10, 1, Permissions::ATTACH_FILES);
        let high = role(11, 6, Permissions::SEND_MESSAGES);
        let roles = [&high, &low];
        let perms = compute_permissions(ctx(None, &roles, &[]));
        assert!(perms.contains(Permissions::ATTACH_FILES | Permissions::SEND_MESSAGES));
        assert_eq!(highest_role(roles).map(|r| r.id), Some(Snowflake::new(11)));
    }

    #[test]
    fn equal_positions_are_ordered_by_id() {
        let a = role(20, 3, Permissions::empty());
        let b = role(21, 3, Permissions::empty());
        assert_eq!(highest_role([&a, &b]).map(|r| r.id), Some(Snowflake::new(21)));
    }

    #[test]
    fn overwrite_wire_format() {
        let over: PermissionOverwrite =
            serde_json::from_str(r#"{"id":"7","type":1,"allow":"2048","deny":"0"}"#)
                .expect("decode overwrite");
        assert_eq!(over.kind, OverwriteKind::Member);
        assert!(over.allow.contains(Permissions::SEND_MESSAGES));
    }
}
