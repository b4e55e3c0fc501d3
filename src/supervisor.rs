//! Multi-account session supervision.
//!
//! [`SessionSupervisor`] owns one supervising task per configured account.
//! Each task runs the account's [`ConnectionSession`], forwards its signals
//! as [`AccountEvent`]s, and starts a fresh session when the previous one
//! gave up, until the restart budget is spent. A failed account never
//! touches another account's task, cache or REST client.
//!
//! Every account delivers events into its own bounded queue. Delivery
//! applies back-pressure per account: a consumer that stops draining one
//! account's queue stalls that account's session only. Queues are handed out
//! one at a time with [`SessionSupervisor::take_account_events`] or merged
//! with [`SessionSupervisor::take_events`]. Rate-limit notices never wait on
//! a full queue; they are dropped instead.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::EntityCache;
use crate::config::{AccountConfig, ClientConfig, GatewayTunables};
use crate::events::{AccountEvent, Event, EventStream};
use crate::gateway::{
    ConnectionSession, Connector, GatewayError, SessionSignal, SessionState, WsConnector,
};
use crate::model::AccountId;
use crate::rest::{
    HttpTransport, RateLimitNotice, RateLimiter, ReqwestTransport, RestClient, RestError,
};
use crate::retry::RetryPolicy;

/// Signals buffered between one session and its supervising task.
const SESSION_SIGNAL_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("account {0} is already configured")]
    DuplicateAccount(AccountId),

    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("supervisor already started")]
    AlreadyStarted,

    #[error("failed to build http transport: {0}")]
    Transport(#[from] RestError),
}

/// Where an account stands from the supervisor's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountStatus {
    /// Configured, not started.
    Idle,
    /// A session is running and currently in `state`.
    Running {
        state: SessionState,
        restarts: usize,
    },
    /// Sessions kept failing; no further restarts.
    Failed { restarts: usize },
    /// Stopped on request.
    Stopped,
}

struct AccountSlot {
    config: AccountConfig,
    cache: Arc<EntityCache>,
    rest: RestClient,
    status: watch::Receiver<AccountStatus>,
    status_tx: Option<watch::Sender<AccountStatus>>,
    events: mpsc::Sender<AccountEvent>,
    events_rx: Option<mpsc::Receiver<AccountEvent>>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

type NoticeRoutes = Arc<Mutex<HashMap<AccountId, mpsc::Sender<AccountEvent>>>>;

/// Owns every account's session.
pub struct SessionSupervisor {
    gateway: GatewayTunables,
    base_url: String,
    restart_budget: usize,
    connector: Arc<dyn Connector>,
    limiter: Arc<RateLimiter>,
    accounts: BTreeMap<AccountId, AccountSlot>,
    event_buffer: usize,
    merged: Option<mpsc::UnboundedSender<mpsc::Receiver<AccountEvent>>>,
    notice_routes: NoticeRoutes,
    notices_rx: Option<mpsc::UnboundedReceiver<RateLimitNotice>>,
    notice_task: Option<JoinHandle<()>>,
    started: bool,
}

impl SessionSupervisor {
    /// Builds a supervisor using the websocket connector and reqwest.
    pub fn new(config: ClientConfig) -> Result<Self, SupervisorError> {
        let http = ReqwestTransport::new(config.rest.connect_timeout)?;
        Self::with_transports(config, Arc::new(WsConnector), Arc::new(http))
    }

    /// Builds a supervisor over caller-provided transports.
    pub fn with_transports(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        http: Arc<dyn HttpTransport>,
    ) -> Result<Self, SupervisorError> {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let limiter = Arc::new(RateLimiter::new(http, &config.rest).with_notices(notices_tx));

        let mut supervisor = Self {
            gateway: config.gateway,
            base_url: config.rest.base_url,
            restart_budget: config.restart_budget,
            connector,
            limiter,
            accounts: BTreeMap::new(),
            event_buffer: config.event_buffer.max(1),
            merged: None,
            notice_routes: NoticeRoutes::default(),
            notices_rx: Some(notices_rx),
            notice_task: None,
            started: false,
        };
        for account in config.accounts {
            supervisor.add_account(account)?;
        }
        Ok(supervisor)
    }

    /// Adds an account. After [`start`](Self::start) its session starts
    /// immediately.
    pub fn add_account(&mut self, account: AccountConfig) -> Result<(), SupervisorError> {
        if self.accounts.contains_key(&account.id) {
            return Err(SupervisorError::DuplicateAccount(account.id));
        }

        let id = account.id.clone();
        let rest = RestClient::new(
            id.clone(),
            account.token.clone(),
            self.base_url.clone(),
            self.limiter.clone(),
        );
        let (status_tx, status) = watch::channel(AccountStatus::Idle);
        let (stop, _) = watch::channel(false);
        let (events, events_rx) = mpsc::channel(self.event_buffer);
        let events_rx = match &self.merged {
            Some(merged) => {
                let _ = merged.send(events_rx);
                None
            }
            None => Some(events_rx),
        };
        lock_routes(&self.notice_routes).insert(id.clone(), events.clone());
        self.accounts.insert(
            id.clone(),
            AccountSlot {
                cache: Arc::new(EntityCache::new(self.gateway.message_ring_capacity)),
                config: account,
                rest,
                status,
                status_tx: Some(status_tx),
                events,
                events_rx,
                stop,
                task: None,
            },
        );

        if self.started {
            self.spawn_account(&id)?;
        }
        Ok(())
    }

    /// Configured accounts, in id order.
    pub fn accounts(&self) -> Vec<AccountId> {
        self.accounts.keys().cloned().collect()
    }

    pub fn cache(&self, account: &AccountId) -> Option<Arc<EntityCache>> {
        self.accounts.get(account).map(|slot| slot.cache.clone())
    }

    pub fn rest(&self, account: &AccountId) -> Option<RestClient> {
        self.accounts.get(account).map(|slot| slot.rest.clone())
    }

    pub fn status(&self, account: &AccountId) -> Option<AccountStatus> {
        self.accounts.get(account).map(|slot| *slot.status.borrow())
    }

    /// Waits until `account` reports a status matching `predicate`.
    pub async fn wait_for_status(
        &self,
        account: &AccountId,
        predicate: impl Fn(&AccountStatus) -> bool,
    ) -> Result<AccountStatus, SupervisorError> {
        let mut status = self
            .accounts
            .get(account)
            .map(|slot| slot.status.clone())
            .ok_or_else(|| SupervisorError::UnknownAccount(account.clone()))?;
        let reached = status.wait_for(predicate).await.map(|value| *value);
        Ok(reached.unwrap_or_else(|_| *status.borrow()))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Merges every account queue not already taken into one stream.
    /// Accounts added afterwards join it. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<EventStream> {
        if self.merged.is_some() {
            return None;
        }
        let (merged, joining) = mpsc::unbounded_channel();
        for slot in self.accounts.values_mut() {
            if let Some(queue) = slot.events_rx.take() {
                let _ = merged.send(queue);
            }
        }
        self.merged = Some(merged);
        Some(EventStream::new(joining))
    }

    /// Hands out one account's own event queue, unless it was already taken
    /// or merged by [`take_events`](Self::take_events).
    pub fn take_account_events(
        &mut self,
        account: &AccountId,
    ) -> Option<mpsc::Receiver<AccountEvent>> {
        self.accounts.get_mut(account)?.events_rx.take()
    }

    /// Starts every configured account plus the rate-limit notice forwarder.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.started {
            return Err(SupervisorError::AlreadyStarted);
        }
        self.started = true;

        if let Some(mut notices) = self.notices_rx.take() {
            let routes = self.notice_routes.clone();
            self.notice_task = Some(tokio::spawn(async move {
                while let Some(notice) = notices.recv().await {
                    let account = notice.account.clone();
                    let Some(queue) = lock_routes(&routes).get(&account).cloned() else {
                        continue;
                    };
                    let event = AccountEvent::new(account.clone(), Event::RateLimited(notice));
                    match queue.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            debug!(event = "supervisor_notice_dropped", account = %account);
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!(event = "supervisor_event_unobserved", account = %account);
                        }
                    }
                }
            }));
        }

        let ids: Vec<_> = self.accounts.keys().cloned().collect();
        for id in ids {
            self.spawn_account(&id)?;
        }
        info!(event = "supervisor_started", accounts = self.accounts.len());
        Ok(())
    }

    /// Stops one account's session and fails its pending REST calls.
    pub async fn stop_account(&mut self, account: &AccountId) -> Result<(), SupervisorError> {
        let slot = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| SupervisorError::UnknownAccount(account.clone()))?;
        slot.stop.send_replace(true);
        if let Some(task) = slot.task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    /// Stops every account and waits for their tasks to finish.
    pub async fn shutdown(&mut self) {
        for slot in self.accounts.values() {
            slot.stop.send_replace(true);
        }
        for slot in self.accounts.values_mut() {
            if let Some(task) = slot.task.take() {
                let _ = task.await;
            }
        }
        if let Some(task) = self.notice_task.take() {
            task.abort();
        }
        info!(event = "supervisor_stopped", accounts = self.accounts.len());
    }

    fn spawn_account(&mut self, id: &AccountId) -> Result<(), SupervisorError> {
        let slot = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownAccount(id.clone()))?;
        let Some(status_tx) = slot.status_tx.take() else {
            return Ok(());
        };

        let runner = AccountRunner {
            account: slot.config.clone(),
            tunables: self.gateway.clone(),
            connector: self.connector.clone(),
            cache: slot.cache.clone(),
            rest: slot.rest.clone(),
            events: slot.events.clone(),
            restart_budget: self.restart_budget,
            restart_backoff: self.gateway.backoff.clone(),
            status: status_tx,
            stop: slot.stop.subscribe(),
        };
        slot.task = Some(tokio::spawn(runner.run()));
        Ok(())
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        for slot in self.accounts.values() {
            slot.stop.send_replace(true);
        }
        if let Some(task) = self.notice_task.take() {
            task.abort();
        }
    }
}

enum SessionEnd {
    Stopped,
    Failed {
        error: GatewayError,
        reached_ready: bool,
    },
}

struct AccountRunner {
    account: AccountConfig,
    tunables: GatewayTunables,
    connector: Arc<dyn Connector>,
    cache: Arc<EntityCache>,
    rest: RestClient,
    events: mpsc::Sender<AccountEvent>,
    restart_budget: usize,
    restart_backoff: RetryPolicy,
    status: watch::Sender<AccountStatus>,
    stop: watch::Receiver<bool>,
}

impl AccountRunner {
    async fn run(mut self) {
        let mut restarts = 0;

        loop {
            self.rest.reopen();
            let (error, reached_ready) = match self.run_session(restarts).await {
                SessionEnd::Stopped => {
                    self.rest.close();
                    self.status.send_replace(AccountStatus::Stopped);
                    info!(event = "supervisor_account_stopped", account = %self.account.id);
                    return;
                }
                SessionEnd::Failed {
                    error,
                    reached_ready,
                } => (error, reached_ready),
            };

            // queued calls must not outlive the session they belong to
            self.rest.close();
            self.cache.clear();

            if reached_ready {
                restarts = 0;
            }
            if error.is_authentication_failure() || restarts >= self.restart_budget {
                warn!(
                    event = "supervisor_account_failed",
                    account = %self.account.id,
                    restarts,
                    error = %error
                );
                self.status
                    .send_replace(AccountStatus::Failed { restarts });
                self.emit(Event::AccountFailed {
                    reason: error.to_string(),
                    restarts,
                })
                .await;
                return;
            }

            restarts += 1;
            let delay = self.restart_backoff.delay_for_attempt(restarts);
            warn!(
                event = "supervisor_session_restart",
                account = %self.account.id,
                restart = restarts,
                budget = self.restart_budget,
                delay_ms = delay.as_millis() as u64,
                error = %error
            );
            if !self.sleep_or_stop(delay).await {
                self.status.send_replace(AccountStatus::Stopped);
                return;
            }
        }
    }

    async fn run_session(&mut self, restarts: usize) -> SessionEnd {
        let (signals_tx, mut signals) = mpsc::channel(SESSION_SIGNAL_BUFFER);
        let handle = ConnectionSession::new(
            self.account.clone(),
            self.tunables.clone(),
            self.connector.clone(),
            self.cache.clone(),
        )
        .with_rest(self.rest.clone())
        .spawn(signals_tx);

        let mut stopping = false;
        let mut reached_ready = false;
        loop {
            tokio::select! {
                signal = signals.recv() => {
                    let Some(signal) = signal else { break };
                    if let SessionSignal::StateChanged { to, .. } = &signal {
                        reached_ready |= *to == SessionState::Ready;
                        self.status.send_replace(AccountStatus::Running { state: *to, restarts });
                    }
                    self.emit(Event::from(signal)).await;
                }
                _ = wait_for_stop(&mut self.stop), if !stopping => {
                    debug!(event = "supervisor_stop_requested", account = %self.account.id);
                    stopping = true;
                    handle.shutdown();
                }
            }
        }

        match handle.join().await {
            Ok(()) => SessionEnd::Stopped,
            Err(_) if stopping => SessionEnd::Stopped,
            Err(error) => SessionEnd::Failed {
                error,
                reached_ready,
            },
        }
    }

    /// Queues `event`, waiting for room unless a stop is requested first.
    async fn emit(&self, event: Event) {
        let event = AccountEvent::new(self.account.id.clone(), event);
        let mut stop = self.stop.clone();
        tokio::select! {
            biased;
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!(event = "supervisor_event_unobserved", account = %self.account.id);
                }
            }
            _ = wait_for_stop(&mut stop) => {
                debug!(event = "supervisor_event_dropped_on_stop", account = %self.account.id);
            }
        }
    }

    async fn sleep_or_stop(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_for_stop(&mut self.stop) => false,
        }
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|requested| *requested).await;
}

fn lock_routes(
    routes: &NoticeRoutes,
) -> MutexGuard<'_, HashMap<AccountId, mpsc::Sender<AccountEvent>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use secrecy::SecretString;
    use serde_json::json;

    use super::{AccountStatus, SessionSupervisor, SupervisorError};
    use crate::config::{AccountConfig, ClientConfig, GatewayTunables};
    use crate::events::{Event, EventKind};
    use crate::gateway::proto::op;
    use crate::gateway::MemoryConnector;
    use crate::model::{AccountId, Snowflake};
    use crate::rest::{HttpRequest, HttpResponse, HttpTransport, RestError};
    use crate::retry::RetryPolicy;

    struct NoHttp;

    impl HttpTransport for NoHttp {
        fn send(&self, _request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RestError>> {
            Box::pin(async { Err(RestError::Connection("offline".to_string())) })
        }
    }

    fn account(id: &str) -> AccountConfig {
        AccountConfig::new(id, SecretString::new(format!("token-{id}")))
    }

    fn config() -> ClientConfig {
        ClientConfig::default()
            .with_gateway(
                GatewayTunables::default()
                    .with_endpoint("memory://gateway")
                    .with_max_reconnect_attempts(1)
                    .with_backoff(RetryPolicy {
                        max_attempts: 1,
                        initial_backoff: Duration::from_secs(1),
                        max_backoff: Duration::from_secs(1),
                        jitter: Duration::ZERO,
                    }),
            )
            .with_restart_budget(2)
            .with_event_buffer(256)
    }

    #[test]
    fn duplicate_accounts_are_rejected() {
        let result = SessionSupervisor::with_transports(
            config().with_account(account("a")).with_account(account("a")),
            Arc::new(MemoryConnector::new().0),
            Arc::new(NoHttp),
        );
        assert!(matches!(result, Err(SupervisorError::DuplicateAccount(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_an_error() {
        let (connector, _peers) = MemoryConnector::new();
        let mut supervisor = SessionSupervisor::with_transports(
            config().with_account(account("a")),
            Arc::new(connector),
            Arc::new(NoHttp),
        )
        .expect("supervisor");
        supervisor.start().expect("first start");
        assert!(matches!(supervisor.start(), Err(SupervisorError::AlreadyStarted)));
        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_account_fails_without_touching_others() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut supervisor = SessionSupervisor::with_transports(
            config().with_account(account("a")).with_account(account("b")),
            Arc::new(connector),
            Arc::new(NoHttp),
        )
        .expect("supervisor");
        let mut events = supervisor.take_events().expect("events");
        supervisor.start().expect("start");

        let a = AccountId::from("a");
        let b = AccountId::from("b");
        let mut healthy = None;
        let mut failed_connections = 0;
        while healthy.is_none() || failed_connections < 3 {
            let mut peer = peers.recv().await.expect("connection");
            peer.send_json(&json!({"op": op::HELLO, "d": {"heartbeat_interval": 40_000}}));
            let identify = peer.recv_op(op::IDENTIFY).await.expect("identify");
            if identify["d"]["token"] == "token-b" && healthy.is_none() {
                peer.send_json(&json!({
                    "op": 0, "s": 1, "t": "READY",
                    "d": {"user": {"id": "9", "username": "b"}, "session_id": "sb"}
                }));
                healthy = Some(peer);
            } else {
                assert_eq!(identify["d"]["token"], "token-a");
                peer.close(Some(4000));
                failed_connections += 1;
            }
        }

        let status = supervisor
            .wait_for_status(&a, |status| matches!(status, AccountStatus::Failed { .. }))
            .await
            .expect("known account");
        assert_eq!(status, AccountStatus::Failed { restarts: 2 });

        let mut failed = Vec::new();
        while let Some(event) = events.try_recv() {
            if event.kind() == EventKind::AccountFailed {
                failed.push(event.account.clone());
            }
        }
        assert_eq!(failed, vec![a.clone()]);
        assert!(supervisor.rest(&a).expect("rest").is_closed());

        assert!(matches!(
            supervisor.status(&b),
            Some(AccountStatus::Running { .. })
        ));
        assert!(supervisor.cache(&b).expect("cache").current_user().is_some());
        supervisor.shutdown().await;
        assert_eq!(supervisor.status(&b), Some(AccountStatus::Stopped));
        drop(healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_failure_is_not_restarted() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut supervisor = SessionSupervisor::with_transports(
            config().with_account(account("a")),
            Arc::new(connector),
            Arc::new(NoHttp),
        )
        .expect("supervisor");
        let mut events = supervisor.take_events().expect("events");
        supervisor.start().expect("start");

        let peer = peers.recv().await.expect("connection");
        peer.close(Some(4004));

        let failure = loop {
            let event = events.recv().await.expect("event");
            if let Event::AccountFailed { reason, restarts } = event.event {
                break (reason, restarts);
            }
        };
        assert_eq!(failure.1, 0);
        assert!(failure.0.contains("authentication"));
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_for_one_account_does_not_stall_another() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut supervisor = SessionSupervisor::with_transports(
            config()
                .with_event_buffer(4)
                .with_account(account("a"))
                .with_account(account("b")),
            Arc::new(connector),
            Arc::new(NoHttp),
        )
        .expect("supervisor");
        let a = AccountId::from("a");
        let b = AccountId::from("b");
        let _stuck = supervisor.take_account_events(&a).expect("a's queue");
        let mut b_events = supervisor.take_account_events(&b).expect("b's queue");
        assert!(supervisor.take_account_events(&b).is_none());
        let merged = supervisor.take_events().expect("merged stream");
        assert_eq!(merged.queue_count(), 0);
        supervisor.start().expect("start");

        let mut a_peer = None;
        let mut b_peer = None;
        while a_peer.is_none() || b_peer.is_none() {
            let mut peer = peers.recv().await.expect("connection");
            peer.send_json(&json!({"op": op::HELLO, "d": {"heartbeat_interval": 40_000}}));
            let identify = peer.recv_op(op::IDENTIFY).await.expect("identify");
            let token = identify["d"]["token"].as_str().expect("token").to_string();
            peer.send_json(&json!({
                "op": 0, "s": 1, "t": "READY",
                "d": {"user": {"id": "9", "username": token}, "session_id": token}
            }));
            if token == "token-a" {
                a_peer = Some(peer);
            } else {
                b_peer = Some(peer);
            }
        }
        let (a_peer, b_peer) = (
            a_peer.expect("a connected"),
            b_peer.expect("b connected"),
        );

        for seq in 0..40u64 {
            a_peer.send_json(&direct_message(seq + 2, 5_000 + seq, 700));
        }
        // let a's session run until its queue is full
        tokio::time::sleep(Duration::from_millis(10)).await;

        for seq in 0..90u64 {
            b_peer.send_json(&direct_message(seq + 2, 9_000 + seq, 800));
        }
        let mut created = 0;
        tokio::time::timeout(Duration::from_secs(30), async {
            while created < 90 {
                let event = b_events.recv().await.expect("b's event");
                assert_eq!(event.account, b);
                if event.kind() == EventKind::MessageCreate {
                    created += 1;
                }
            }
        })
        .await
        .expect("b drains while a is stuck");

        let cache = supervisor.cache(&b).expect("b's cache");
        assert_eq!(cache.messages(Snowflake::new(800)).len(), 90);
        supervisor.shutdown().await;
    }

    fn direct_message(seq: u64, id: u64, channel: u64) -> serde_json::Value {
        json!({
            "op": 0, "s": seq, "t": "MESSAGE_CREATE",
            "d": {
                "id": id.to_string(),
                "channel_id": channel.to_string(),
                "author": {"id": "2", "username": "alice"},
                "content": format!("message {id}")
            }
        })
    }
}
