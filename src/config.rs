//! Client configuration.
//!
//! Everything is built in code: `Default` impls carry the protocol defaults
//! and `with_*` setters override single values.

use std::fmt;
use std::time::Duration;

use secrecy::SecretString;

use crate::model::AccountId;
use crate::rest::ratelimit::BucketScope;
use crate::retry::RetryPolicy;

/// Base URL of the HTTP API.
pub const API_BASE_URL: &str = "https://discord.com/api/v10";
/// Query appended to every gateway URL.
pub const GATEWAY_QUERY: &str = "v=10&encoding=json";

/// Appends the protocol query to a gateway URL returned by the API.
pub fn gateway_endpoint(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.contains('?') {
        format!("{url}&{GATEWAY_QUERY}")
    } else {
        format!("{url}/?{GATEWAY_QUERY}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GatewayDefaults;

impl GatewayDefaults {
    pub const HELLO_TIMEOUT: Duration = Duration::from_secs(20);
    pub const READY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const RESUME_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_RECONNECT_ATTEMPTS: usize = 5;
    pub const MESSAGE_RING_CAPACITY: usize = 100;
    /// Capability flags sent by the official desktop client.
    pub const CAPABILITIES: u64 = 4093;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RestDefaults;

impl RestDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    /// Extra wait added on top of every server-provided retry delay.
    pub const RATELIMIT_PADDING: Duration = Duration::from_millis(500);
}

/// One account to connect.
#[derive(Clone)]
pub struct AccountConfig {
    pub id: AccountId,
    pub token: SecretString,
    /// Request the full member list of every guild after READY.
    pub chunk_members: bool,
    /// Surface every inbound text frame as [`Event::RawFrame`](crate::events::Event::RawFrame).
    pub raw_frames: bool,
    /// `(shard_index, shard_count)`.
    pub shard: Option<(u32, u32)>,
    pub capabilities: u64,
    pub intents: Option<u64>,
}

impl AccountConfig {
    pub fn new(id: impl Into<String>, token: SecretString) -> Self {
        Self {
            id: AccountId::new(id),
            token,
            chunk_members: false,
            raw_frames: false,
            shard: None,
            capabilities: GatewayDefaults::CAPABILITIES,
            intents: None,
        }
    }

    pub fn with_chunk_members(mut self, enabled: bool) -> Self {
        self.chunk_members = enabled;
        self
    }

    pub fn with_raw_frames(mut self, enabled: bool) -> Self {
        self.raw_frames = enabled;
        self
    }

    pub fn with_shard(mut self, index: u32, count: u32) -> Self {
        self.shard = Some((index, count));
        self
    }

    pub fn with_capabilities(mut self, capabilities: u64) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_intents(mut self, intents: u64) -> Self {
        self.intents = Some(intents);
        self
    }
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("token", &"[redacted]")
            .field("chunk_members", &self.chunk_members)
            .field("raw_frames", &self.raw_frames)
            .field("shard", &self.shard)
            .field("capabilities", &self.capabilities)
            .field("intents", &self.intents)
            .finish()
    }
}

/// Timing and retry knobs for gateway sessions.
#[derive(Clone, Debug)]
pub struct GatewayTunables {
    /// Wait for HELLO after the transport opens.
    pub hello_timeout: Duration,
    /// Wait for READY after IDENTIFY.
    pub ready_timeout: Duration,
    /// Wait for RESUMED after RESUME.
    pub resume_timeout: Duration,
    /// Consecutive failed connection attempts before the session gives up.
    pub max_reconnect_attempts: usize,
    pub backoff: RetryPolicy,
    pub message_ring_capacity: usize,
    /// Skips the `GET /gateway` lookup when set.
    pub endpoint_override: Option<String>,
}

impl Default for GatewayTunables {
    fn default() -> Self {
        Self {
            hello_timeout: GatewayDefaults::HELLO_TIMEOUT,
            ready_timeout: GatewayDefaults::READY_TIMEOUT,
            resume_timeout: GatewayDefaults::RESUME_TIMEOUT,
            max_reconnect_attempts: GatewayDefaults::MAX_RECONNECT_ATTEMPTS,
            backoff: RetryPolicy::reconnect(),
            message_ring_capacity: GatewayDefaults::MESSAGE_RING_CAPACITY,
            endpoint_override: None,
        }
    }
}

impl GatewayTunables {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: usize) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeouts(mut self, hello: Duration, ready: Duration, resume: Duration) -> Self {
        self.hello_timeout = hello;
        self.ready_timeout = ready;
        self.resume_timeout = resume;
        self
    }

    pub fn with_message_ring_capacity(mut self, capacity: usize) -> Self {
        self.message_ring_capacity = capacity;
        self
    }
}

/// HTTP client options.
#[derive(Clone, Debug)]
pub struct RestOptions {
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Scope assumed for a route until a response says otherwise.
    pub default_scope: BucketScope,
    pub ratelimit_padding: Duration,
    /// Retries for transport-level failures (not rate limits).
    pub retry_policy: RetryPolicy,
}

impl Default for RestOptions {
    fn default() -> Self {
        Self {
            base_url: API_BASE_URL.to_string(),
            connect_timeout: RestDefaults::CONNECT_TIMEOUT,
            request_timeout: RestDefaults::REQUEST_TIMEOUT,
            default_scope: BucketScope::PerAccount,
            ratelimit_padding: RestDefaults::RATELIMIT_PADDING,
            retry_policy: RetryPolicy::request(),
        }
    }
}

impl RestOptions {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_scope(mut self, scope: BucketScope) -> Self {
        self.default_scope = scope;
        self
    }

    pub fn with_ratelimit_padding(mut self, padding: Duration) -> Self {
        self.ratelimit_padding = padding;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Top-level configuration handed to the supervisor.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub accounts: Vec<AccountConfig>,
    pub gateway: GatewayTunables,
    pub rest: RestOptions,
    /// Restarts allowed per account after its session fails for good.
    pub restart_budget: usize,
    /// Capacity of each account's event queue.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            gateway: GatewayTunables::default(),
            rest: RestOptions::default(),
            restart_budget: 3,
            event_buffer: 1024,
        }
    }
}

impl ClientConfig {
    pub fn with_account(mut self, account: AccountConfig) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn with_gateway(mut self, gateway: GatewayTunables) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_rest(mut self, rest: RestOptions) -> Self {
        self.rest = rest;
        self
    }

    pub fn with_restart_budget(mut self, budget: usize) -> Self {
        self.restart_budget = budget;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_token() {
        let account = AccountConfig::new("main", SecretString::new("very-secret".to_string()));
        let rendered = format!("{account:?}");
        assert!(rendered.contains("[redacted]"));
        assert!(!rendered.contains("very-secret"));
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let options = RestOptions::default().with_base_url("http://127.0.0.1:9000/api/");
        assert_eq!(options.base_url, "http://127.0.0.1:9000/api");
    }

    #[test]
    fn gateway_endpoint_appends_query() {
        assert_eq!(
            gateway_endpoint("wss://gateway.discord.gg"),
            "wss://gateway.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_endpoint("ws://127.0.0.1:1/ws?x=1"),
            "ws://127.0.0.1:1/ws?x=1&v=10&encoding=json"
        );
    }

    #[test]
    fn defaults_match_protocol_values() {
        let gateway = GatewayTunables::default();
        assert_eq!(gateway.hello_timeout, Duration::from_secs(20));
        assert_eq!(gateway.max_reconnect_attempts, 5);
        assert_eq!(gateway.backoff.max_backoff, Duration::from_secs(60));
        let account = AccountConfig::new("a", SecretString::new("t".to_string()));
        assert_eq!(account.capabilities, 4093);
        assert!(!account.chunk_members);
    }
}
