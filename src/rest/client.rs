use std::fmt;
use std::sync::Arc;

use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::debug;

use crate::cache::{GuildPayload, MessagePayload};
use crate::config::gateway_endpoint;
use crate::model::{
    AccountId, Channel, ChannelId, ChannelKind, GuildId, MessageId, PermissionOverwrite,
    Permissions, Role, RoleId, User, UserId,
};
use crate::rest::ratelimit::RateLimiter;
use crate::rest::route::Route;
use crate::rest::transport::{HttpRequest, HttpResponse};
use crate::rest::{check_status, RestError};

/// Fields to change on a role. Absent fields are left as they are.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoleEdit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
}

/// Fields to set on a created or edited channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ChannelEdit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChannelKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ChannelId>,
    #[serde(
        rename = "permission_overwrites",
        skip_serializing_if = "Option::is_none"
    )]
    pub overwrites: Option<Vec<PermissionOverwrite>>,
}

/// Fields to change on a guild member.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemberEdit {
    /// `Some(None)` clears the nickname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nick: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<RoleId>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BanEntry {
    #[serde(default)]
    pub reason: Option<String>,
    pub user: User,
}

#[derive(Debug, Deserialize)]
struct GatewayInfo {
    url: String,
}

/// HTTP client bound to one account.
///
/// Cheap to clone; clones share the account's close signal. Every call goes
/// through the shared [`RateLimiter`].
#[derive(Clone)]
pub struct RestClient {
    account: AccountId,
    token: SecretString,
    base_url: String,
    limiter: Arc<RateLimiter>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("account", &self.account)
            .field("base_url", &self.base_url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RestClient {
    pub fn new(
        account: AccountId,
        token: SecretString,
        base_url: impl Into<String>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let (closed_tx, closed) = watch::channel(false);
        Self {
            account,
            token,
            base_url: base_url.into(),
            limiter,
            closed_tx: Arc::new(closed_tx),
            closed,
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fails every queued and future call with [`RestError::SessionClosed`].
    pub fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    /// Accepts calls again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.closed_tx.send_replace(false);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Sends `route` through the rate limiter and maps the status.
    pub async fn call(&self, route: Route, body: Option<Value>) -> Result<HttpResponse, RestError> {
        let key = route.key();
        let request = HttpRequest {
            method: route.method().clone(),
            url: route.url(&self.base_url)?,
            authorization: Some(self.token.clone()),
            body,
        };
        let response = self
            .limiter
            .execute(&self.account, &key, request, &self.closed)
            .await?;
        debug!(
            event = "rest_call_completed",
            account = %self.account,
            route = %key,
            status = response.status.as_u16()
        );
        check_status(response)
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        route: Route,
        body: Option<Value>,
    ) -> Result<T, RestError> {
        let response = self.call(route, body).await?;
        serde_json::from_str(&response.body).map_err(|err| RestError::Parse(err.to_string()))
    }

    async fn request_empty(&self, route: Route, body: Option<Value>) -> Result<(), RestError> {
        self.call(route, body).await.map(|_| ())
    }

    /// Gateway URL with the protocol query appended.
    pub async fn gateway_url(&self) -> Result<String, RestError> {
        let info: GatewayInfo = self.request(Route::get("/gateway"), None).await?;
        Ok(gateway_endpoint(&info.url))
    }

    /// The account's own user; doubles as a token check.
    pub async fn current_user(&self) -> Result<User, RestError> {
        self.request(Route::get("/users/@me"), None).await
    }

    pub async fn guild(&self, guild_id: GuildId) -> Result<GuildPayload, RestError> {
        self.request(Route::get("/guilds/{guild_id}").param(guild_id), None)
            .await
    }

    pub async fn channel(&self, channel_id: ChannelId) -> Result<Channel, RestError> {
        self.request(Route::get("/channels/{channel_id}").param(channel_id), None)
            .await
    }

    /// Most recent messages of a channel, newest first. `limit` is clamped
    /// to 1..=100.
    pub async fn messages(
        &self,
        channel_id: ChannelId,
        limit: u8,
    ) -> Result<Vec<MessagePayload>, RestError> {
        let route = Route::get("/channels/{channel_id}/messages")
            .param(channel_id)
            .query("limit", limit.clamp(1, 100));
        self.request(route, None).await
    }

    pub async fn send_message(
        &self,
        channel_id: ChannelId,
        content: &str,
    ) -> Result<MessagePayload, RestError> {
        let route = Route::post("/channels/{channel_id}/messages").param(channel_id);
        self.request(route, Some(json!({ "content": content, "tts": false })))
            .await
    }

    pub async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<MessagePayload, RestError> {
        let route = Route::patch("/channels/{channel_id}/messages/{message_id}")
            .param(channel_id)
            .param(message_id);
        self.request(route, Some(json!({ "content": content })))
            .await
    }

    pub async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<(), RestError> {
        let route = Route::delete("/channels/{channel_id}/messages/{message_id}")
            .param(channel_id)
            .param(message_id);
        self.request_empty(route, None).await
    }

    /// Reacts with a unicode emoji or `name:id` for custom emoji.
    pub async fn add_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), RestError> {
        let route =
            Route::put("/channels/{channel_id}/messages/{message_id}/reactions/{emoji}/@me")
                .param(channel_id)
                .param(message_id)
                .param(emoji);
        self.request_empty(route, None).await
    }

    pub async fn remove_reaction(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<(), RestError> {
        let route =
            Route::delete("/channels/{channel_id}/messages/{message_id}/reactions/{emoji}/@me")
                .param(channel_id)
                .param(message_id)
                .param(emoji);
        self.request_empty(route, None).await
    }

    pub async fn trigger_typing(&self, channel_id: ChannelId) -> Result<(), RestError> {
        let route = Route::post("/channels/{channel_id}/typing").param(channel_id);
        self.request_empty(route, None).await
    }

    pub async fn edit_member(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        edit: &MemberEdit,
    ) -> Result<(), RestError> {
        let route = Route::patch("/guilds/{guild_id}/members/{user_id}")
            .param(guild_id)
            .param(user_id);
        self.request_empty(route, Some(to_body(edit)?)).await
    }

    pub async fn create_role(&self, guild_id: GuildId, edit: &RoleEdit) -> Result<Role, RestError> {
        let route = Route::post("/guilds/{guild_id}/roles").param(guild_id);
        let mut role: Role = self.request(route, Some(to_body(edit)?)).await?;
        role.guild_id = guild_id;
        Ok(role)
    }

    pub async fn edit_role(
        &self,
        guild_id: GuildId,
        role_id: RoleId,
        edit: &RoleEdit,
    ) -> Result<Role, RestError> {
        let route = Route::patch("/guilds/{guild_id}/roles/{role_id}")
            .param(guild_id)
            .param(role_id);
        let mut role: Role = self.request(route, Some(to_body(edit)?)).await?;
        role.guild_id = guild_id;
        Ok(role)
    }

    pub async fn delete_role(&self, guild_id: GuildId, role_id: RoleId) -> Result<(), RestError> {
        let route = Route::delete("/guilds/{guild_id}/roles/{role_id}")
            .param(guild_id)
            .param(role_id);
        self.request_empty(route, None).await
    }

    pub async fn create_channel(
        &self,
        guild_id: GuildId,
        edit: &ChannelEdit,
    ) -> Result<Channel, RestError> {
        let route = Route::post("/guilds/{guild_id}/channels").param(guild_id);
        self.request(route, Some(to_body(edit)?)).await
    }

    pub async fn edit_channel(
        &self,
        channel_id: ChannelId,
        edit: &ChannelEdit,
    ) -> Result<Channel, RestError> {
        let route = Route::patch("/channels/{channel_id}").param(channel_id);
        self.request(route, Some(to_body(edit)?)).await
    }

    pub async fn delete_channel(&self, channel_id: ChannelId) -> Result<Channel, RestError> {
        let route = Route::delete("/channels/{channel_id}").param(channel_id);
        self.request(route, None).await
    }

    pub async fn bans(&self, guild_id: GuildId) -> Result<Vec<BanEntry>, RestError> {
        self.request(Route::get("/guilds/{guild_id}/bans").param(guild_id), None)
            .await
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, RestError> {
    serde_json::to_value(value).map_err(|err| RestError::Parse(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use futures_util::future::BoxFuture;
    use reqwest::StatusCode;
    use secrecy::{ExposeSecret, SecretString};
    use serde_json::json;

    use super::{MemberEdit, RestClient, RoleEdit};
    use crate::config::RestOptions;
    use crate::model::{AccountId, Permissions, Snowflake};
    use crate::rest::ratelimit::RateLimiter;
    use crate::rest::transport::{HttpRequest, HttpResponse, HttpTransport};
    use crate::rest::RestError;

    struct Recording {
        status: StatusCode,
        body: String,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Recording {
        fn new(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                status: StatusCode::from_u16(status).expect("status"),
                body: body.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl HttpTransport for Recording {
        fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RestError>> {
            self.seen.lock().expect("lock").push(request);
            let response = HttpResponse {
                status: self.status,
                headers: HashMap::new(),
                body: self.body.clone(),
            };
            Box::pin(async move { Ok(response) })
        }
    }

    fn client(transport: Arc<Recording>) -> RestClient {
        let limiter = RateLimiter::new(transport, &RestOptions::default());
        RestClient::new(
            AccountId::new("main"),
            SecretString::new("token-1".to_string()),
            "http://api.test/api/v10",
            Arc::new(limiter),
        )
    }

    #[tokio::test]
    async fn requests_carry_token_and_resolved_path() {
        let transport = Recording::new(200, r#"{"url":"wss://gateway.test"}"#);
        let client = client(Arc::clone(&transport));

        let url = client.gateway_url().await.expect("gateway url");
        assert_eq!(url, "wss://gateway.test/?v=10&encoding=json");

        let seen = transport.seen.lock().expect("lock");
        assert_eq!(seen[0].url.as_str(), "http://api.test/api/v10/gateway");
        let token = seen[0].authorization.as_ref().expect("token");
        assert_eq!(token.expose_secret(), "token-1");
    }

    #[tokio::test]
    async fn edit_bodies_skip_absent_fields() {
        let transport = Recording::new(
            200,
            r#"{"id":"9","name":"mods","permissions":"8","position":2}"#,
        );
        let client = client(Arc::clone(&transport));

        let role = client
            .create_role(
                Snowflake::new(1),
                &RoleEdit {
                    name: Some("mods".to_string()),
                    permissions: Some(Permissions::ADMINISTRATOR),
                    color: None,
                },
            )
            .await
            .expect("create role");
        assert_eq!(role.guild_id, Snowflake::new(1));

        client
            .edit_member(
                Snowflake::new(1),
                Snowflake::new(2),
                &MemberEdit {
                    nick: Some(None),
                    roles: None,
                },
            )
            .await
            .expect("edit member");

        let seen = transport.seen.lock().expect("lock");
        assert_eq!(
            seen[0].body,
            Some(json!({ "name": "mods", "permissions": "8" }))
        );
        assert_eq!(seen[1].body, Some(json!({ "nick": null })));
    }

    #[tokio::test]
    async fn captcha_is_surfaced_without_retry() {
        let transport = Recording::new(400, r#"{"captcha_key":["captcha-required"]}"#);
        let client = client(Arc::clone(&transport));

        let err = client
            .send_message(Snowflake::new(5), "hello")
            .await
            .expect_err("captcha");
        assert!(matches!(err, RestError::CaptchaRequired { .. }));
        assert_eq!(transport.seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn closed_client_rejects_calls_until_reopened() {
        let transport = Recording::new(204, "");
        let client = client(Arc::clone(&transport));

        client.close();
        let err = client
            .trigger_typing(Snowflake::new(5))
            .await
            .expect_err("closed");
        assert!(matches!(err, RestError::SessionClosed));

        client.reopen();
        client
            .trigger_typing(Snowflake::new(5))
            .await
            .expect("reopened");
        assert_eq!(transport.seen.lock().expect("lock").len(), 1);
    }
}
