//! Gateway wire frames.
//!
//! Every frame is a JSON object `{"op", "d", "s", "t"}`. Only dispatch frames
//! (op 0) carry a sequence number and an event name; their payloads are
//! decoded into cache [`Mutation`]s by [`decode_dispatch`].

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Mutation;
use crate::config::AccountConfig;
use crate::model::GuildId;

/// Gateway opcodes.
pub mod op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Dispatch event names with special meaning to the session.
pub const READY: &str = "READY";
pub const RESUMED: &str = "RESUMED";

/// Inbound frame envelope.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_dispatch(&self) -> bool {
        self.op == op::DISPATCH
    }
}

/// Payload of the hello frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Hello {
    /// Milliseconds between heartbeats.
    pub heartbeat_interval: u64,
}

#[derive(Serialize)]
struct Outbound<'a, T: Serialize> {
    op: u8,
    d: &'a T,
}

fn encode<T: Serialize>(op: u8, d: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Outbound { op, d })
}

#[derive(Serialize)]
struct ClientProperties {
    os: &'static str,
    browser: &'static str,
    device: &'static str,
}

const CLIENT_PROPERTIES: ClientProperties = ClientProperties {
    os: "Windows Desktop",
    browser: "Chrome",
    device: "Windows",
};

#[derive(Serialize)]
struct Identify<'a> {
    token: &'a str,
    capabilities: u64,
    properties: &'a ClientProperties,
    compress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    intents: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shard: Option<[u32; 2]>,
}

#[derive(Serialize)]
struct Resume<'a> {
    token: &'a str,
    session_id: &'a str,
    seq: u64,
}

#[derive(Serialize)]
struct RequestGuildMembers {
    guild_id: GuildId,
    query: &'static str,
    limit: u32,
}

/// Encodes the identify frame for `account`.
pub fn identify(account: &AccountConfig) -> Result<String, serde_json::Error> {
    encode(
        op::IDENTIFY,
        &Identify {
            token: account.token.expose_secret(),
            capabilities: account.capabilities,
            properties: &CLIENT_PROPERTIES,
            compress: false,
            intents: account.intents,
            shard: account.shard.map(|(index, count)| [index, count]),
        },
    )
}

/// Encodes a resume frame for an existing session.
pub fn resume(token: &SecretString, session_id: &str, seq: u64) -> Result<String, serde_json::Error> {
    encode(
        op::RESUME,
        &Resume {
            token: token.expose_secret(),
            session_id,
            seq,
        },
    )
}

/// Encodes a heartbeat carrying the last seen sequence number.
pub fn heartbeat(last_sequence: Option<u64>) -> Result<String, serde_json::Error> {
    encode(op::HEARTBEAT, &last_sequence)
}

/// Encodes a request for the full member list of `guild_id`.
pub fn request_guild_members(guild_id: GuildId) -> Result<String, serde_json::Error> {
    encode(
        op::REQUEST_GUILD_MEMBERS,
        &RequestGuildMembers {
            guild_id,
            query: "",
            limit: 0,
        },
    )
}

/// Decodes a dispatch payload into a cache mutation.
///
/// Returns `Ok(None)` for event names the cache does not track, so new
/// server events never break the session.
pub fn decode_dispatch(name: &str, d: Value) -> Result<Option<Mutation>, serde_json::Error> {
    let mutation = match name {
        READY => Mutation::Ready(Box::new(serde_json::from_value(d)?)),
        "GUILD_CREATE" => Mutation::GuildCreate(Box::new(serde_json::from_value(d)?)),
        "GUILD_UPDATE" => Mutation::GuildUpdate(serde_json::from_value(d)?),
        "GUILD_DELETE" => Mutation::GuildDelete(serde_json::from_value(d)?),
        "CHANNEL_CREATE" => Mutation::ChannelCreate(serde_json::from_value(d)?),
        "CHANNEL_UPDATE" => Mutation::ChannelUpdate(serde_json::from_value(d)?),
        "CHANNEL_DELETE" => Mutation::ChannelDelete(serde_json::from_value(d)?),
        "MESSAGE_CREATE" => Mutation::MessageCreate(Box::new(serde_json::from_value(d)?)),
        "MESSAGE_UPDATE" => Mutation::MessageUpdate(serde_json::from_value(d)?),
        "MESSAGE_DELETE" => Mutation::MessageDelete(serde_json::from_value(d)?),
        "MESSAGE_REACTION_ADD" => Mutation::ReactionAdd(serde_json::from_value(d)?),
        "MESSAGE_REACTION_REMOVE" => Mutation::ReactionRemove(serde_json::from_value(d)?),
        "GUILD_MEMBER_ADD" => Mutation::MemberAdd(serde_json::from_value(d)?),
        "GUILD_MEMBER_UPDATE" => Mutation::MemberUpdate(serde_json::from_value(d)?),
        "GUILD_MEMBER_REMOVE" => Mutation::MemberRemove(serde_json::from_value(d)?),
        "GUILD_MEMBERS_CHUNK" => Mutation::MembersChunk(serde_json::from_value(d)?),
        "GUILD_ROLE_CREATE" => Mutation::RoleCreate(serde_json::from_value(d)?),
        "GUILD_ROLE_UPDATE" => Mutation::RoleUpdate(serde_json::from_value(d)?),
        "GUILD_ROLE_DELETE" => Mutation::RoleDelete(serde_json::from_value(d)?),
        "GUILD_BAN_ADD" => Mutation::BanAdd(serde_json::from_value(d)?),
        "GUILD_BAN_REMOVE" => Mutation::BanRemove(serde_json::from_value(d)?),
        _ => return Ok(None),
    };
    Ok(Some(mutation))
}
