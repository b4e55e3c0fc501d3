use std::sync::Arc;
use std::time::Duration;

use gatewire_sdk::cache::{Change, EntityCache};
use gatewire_sdk::config::{AccountConfig, GatewayTunables};
use gatewire_sdk::gateway::proto::op;
use gatewire_sdk::gateway::{
    ConnectionSession, MemoryConnector, MemoryPeer, SessionHandle, SessionSignal, SessionState,
};
use gatewire_sdk::model::Snowflake;
use gatewire_sdk::retry::RetryPolicy;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

const TOKEN: &str = "flow-token";

struct Flow {
    handle: SessionHandle,
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    signals: mpsc::Receiver<SessionSignal>,
    cache: Arc<EntityCache>,
}

impl Flow {
    fn start(account: AccountConfig) -> Self {
        let tunables = GatewayTunables::default()
            .with_endpoint("memory://gateway/?v=10&encoding=json")
            .with_backoff(RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(8),
                jitter: Duration::ZERO,
            });
        let (connector, peers) = MemoryConnector::new();
        let cache = Arc::new(EntityCache::default());
        let (signals_tx, signals) = mpsc::channel(256);
        let handle = ConnectionSession::new(account, tunables, Arc::new(connector), cache.clone())
            .spawn(signals_tx);
        Self {
            handle,
            peers,
            signals,
            cache,
        }
    }

    async fn next_peer(&mut self) -> MemoryPeer {
        self.peers.recv().await.expect("client should connect")
    }

    async fn next_change(&mut self) -> Change {
        loop {
            match self.signals.recv().await.expect("session signal") {
                SessionSignal::Change(change) => return change,
                _ => continue,
            }
        }
    }

    /// Shuts the session down and returns every signal it emitted afterwards.
    async fn finish(mut self) -> Vec<SessionSignal> {
        self.handle.shutdown();
        self.handle.join().await.expect("clean shutdown");
        let mut rest = Vec::new();
        while let Some(signal) = self.signals.recv().await {
            rest.push(signal);
        }
        rest
    }
}

fn account() -> AccountConfig {
    AccountConfig::new("flow", SecretString::new(TOKEN.to_string()))
}

fn hello(interval_ms: u64) -> Value {
    json!({"op": op::HELLO, "d": {"heartbeat_interval": interval_ms}})
}

fn dispatch(seq: u64, name: &str, d: Value) -> Value {
    json!({"op": op::DISPATCH, "s": seq, "t": name, "d": d})
}

fn ready(seq: u64) -> Value {
    dispatch(
        seq,
        "READY",
        json!({
            "user": {"id": "1", "username": "flow-user"},
            "session_id": "flow-session",
            "guilds": [{
                "id": "100",
                "name": "flow guild",
                "owner_id": "1",
                "channels": [
                    {"id": "200", "type": 0, "name": "general", "position": 0},
                    {"id": "201", "type": 0, "name": "random", "position": 1}
                ],
                "roles": [{"id": "100", "name": "@everyone", "permissions": "1024"}]
            }]
        }),
    )
}

fn message(seq: u64, id: u64, content: &str) -> Value {
    dispatch(
        seq,
        "MESSAGE_CREATE",
        json!({
            "id": id.to_string(),
            "channel_id": "200",
            "guild_id": "100",
            "author": {"id": "2", "username": "alice"},
            "content": content
        }),
    )
}

async fn identify_and_ready(flow: &mut Flow, peer: &mut MemoryPeer) {
    let identify = peer.recv_op(op::IDENTIFY).await.expect("identify");
    assert_eq!(identify["d"]["token"], TOKEN);
    peer.send_json(&ready(1));
    assert!(matches!(flow.next_change().await, Change::Ready { guilds: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn connects_heartbeats_and_caches_dispatches() {
    let mut flow = Flow::start(account());
    let mut peer = flow.next_peer().await;
    assert_eq!(peer.url, "memory://gateway/?v=10&encoding=json");

    let hello_at = Instant::now();
    peer.send_json(&hello(40_000));
    identify_and_ready(&mut flow, &mut peer).await;
    assert_eq!(flow.handle.state(), SessionState::Ready);
    assert_eq!(flow.cache.guild_channels(Snowflake::new(100)).len(), 2);

    let heartbeat = peer.recv_op(op::HEARTBEAT).await.expect("heartbeat");
    assert!(hello_at.elapsed() >= Duration::from_secs(40));
    assert_eq!(heartbeat["d"], 1);
    peer.send_json(&json!({"op": op::HEARTBEAT_ACK}));

    peer.send_json(&message(2, 900, "hi there"));
    match flow.next_change().await {
        Change::MessageCreated(created) => {
            assert_eq!(created.content, "hi there");
            assert_eq!(created.guild_id(), Some(Snowflake::new(100)));
        }
        other => panic!("expected a created message, got {other:?}"),
    }
    assert_eq!(flow.cache.messages(Snowflake::new(200)).len(), 1);
    assert!(flow.handle.latency().is_some());

    let trailing = flow.finish().await;
    assert!(trailing
        .iter()
        .all(|signal| !matches!(signal, SessionSignal::Change(Change::MessageCreated(_)))));
    assert!(trailing.iter().any(|signal| matches!(
        signal,
        SessionSignal::StateChanged {
            to: SessionState::Closed,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn dropped_link_resumes_without_a_new_snapshot() {
    let mut flow = Flow::start(account());
    let mut first = flow.next_peer().await;
    first.send_json(&hello(40_000));
    identify_and_ready(&mut flow, &mut first).await;
    first.send_json(&message(2, 900, "before the drop"));
    assert!(matches!(flow.next_change().await, Change::MessageCreated(_)));

    let dropped_at = Instant::now();
    first.close(Some(4000));

    let mut second = flow.next_peer().await;
    assert!(dropped_at.elapsed() >= Duration::from_secs(1));
    second.send_json(&hello(40_000));
    let resume = second.recv_op(op::RESUME).await.expect("resume");
    assert_eq!(resume["d"]["token"], TOKEN);
    assert_eq!(resume["d"]["session_id"], "flow-session");
    assert_eq!(resume["d"]["seq"], 2);

    second.send_json(&dispatch(3, "RESUMED", json!(null)));
    loop {
        match flow.signals.recv().await.expect("session signal") {
            SessionSignal::Resumed => break,
            SessionSignal::Change(change) => panic!("resume must not replay changes: {change:?}"),
            _ => {}
        }
    }
    assert!(flow.handle.wait_for_state(SessionState::Ready).await);
    assert!(flow
        .cache
        .message(Snowflake::new(200), Snowflake::new(900))
        .is_some());

    second.send_json(&message(4, 901, "after the resume"));
    assert!(matches!(
        flow.next_change().await,
        Change::MessageCreated(ref created) if created.content == "after the resume"
    ));
    assert_eq!(flow.cache.messages(Snowflake::new(200)).len(), 2);
    flow.finish().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_resume_falls_back_to_identify() {
    let mut flow = Flow::start(account());
    let mut first = flow.next_peer().await;
    first.send_json(&hello(40_000));
    identify_and_ready(&mut flow, &mut first).await;
    first.send_json(&message(2, 900, "stale soon"));
    assert!(matches!(flow.next_change().await, Change::MessageCreated(_)));

    first.send_json(&json!({"op": op::RECONNECT, "d": null}));
    let mut second = flow.next_peer().await;
    second.send_json(&hello(40_000));
    second.recv_op(op::RESUME).await.expect("resume");

    second.send_json(&json!({"op": op::INVALID_SESSION, "d": false}));
    let identify = second.recv_op(op::IDENTIFY).await.expect("fresh identify");
    assert_eq!(identify["d"]["token"], TOKEN);
    assert!(flow.cache.current_user().is_none());
    assert!(flow
        .cache
        .message(Snowflake::new(200), Snowflake::new(900))
        .is_none());

    second.send_json(&ready(1));
    assert!(matches!(flow.next_change().await, Change::Ready { .. }));
    assert_eq!(flow.handle.state(), SessionState::Ready);
    assert_eq!(
        flow.cache.current_user().map(|user| user.username),
        Some("flow-user".to_string())
    );
    flow.finish().await;
}

#[tokio::test(start_paused = true)]
async fn member_chunking_follows_ready_and_new_guilds() {
    let mut flow = Flow::start(account().with_chunk_members(true));
    let mut peer = flow.next_peer().await;
    peer.send_json(&hello(40_000));
    identify_and_ready(&mut flow, &mut peer).await;

    let request = peer
        .recv_op(op::REQUEST_GUILD_MEMBERS)
        .await
        .expect("member request");
    assert_eq!(request["d"]["guild_id"], "100");
    assert_eq!(request["d"]["query"], "");
    assert_eq!(request["d"]["limit"], 0);

    peer.send_json(&dispatch(
        2,
        "GUILD_MEMBERS_CHUNK",
        json!({
            "guild_id": "100",
            "chunk_index": 0,
            "chunk_count": 1,
            "members": [
                {"user": {"id": "1", "username": "flow-user"}, "roles": []},
                {"user": {"id": "2", "username": "alice"}, "roles": ["100"], "nick": "al"}
            ]
        }),
    ));
    assert_eq!(
        flow.next_change().await,
        Change::MembersChunked {
            guild_id: Snowflake::new(100),
            count: 2,
            complete: true,
        }
    );
    let member = flow
        .cache
        .member(Snowflake::new(100), Snowflake::new(2))
        .expect("chunked member");
    assert_eq!(member.nick.as_deref(), Some("al"));
    assert!(flow.cache.guild(Snowflake::new(100)).expect("guild").chunked);

    peer.send_json(&dispatch(
        3,
        "GUILD_CREATE",
        json!({"id": "101", "name": "joined later", "channels": [], "roles": []}),
    ));
    assert!(matches!(flow.next_change().await, Change::GuildCreated(_)));
    let request = peer
        .recv_op(op::REQUEST_GUILD_MEMBERS)
        .await
        .expect("member request for the new guild");
    assert_eq!(request["d"]["guild_id"], "101");
    flow.finish().await;
}
