//! Per-account gateway connection worker.
//!
//! [`ConnectionSession::spawn`] starts one task that owns the account's
//! gateway link for its whole life: it connects, identifies or resumes,
//! heartbeats, applies dispatches to the [`EntityCache`], and reconnects with
//! backoff until it is shut down or runs out of attempts.
//!
//! Frames are handled one at a time in arrival order. Every state transition
//! and every cache [`Change`] is pushed to the signal channel before the next
//! frame is read, so a full channel holds the session back instead of
//! reordering its output.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::cache::{Change, EntityCache, Mutation};
use crate::config::{gateway_endpoint, AccountConfig, GatewayTunables};
use crate::gateway::proto::{self, decode_dispatch, op, GatewayFrame, Hello, RESUMED};
use crate::gateway::state::{SessionMachine, SessionState};
use crate::gateway::transport::{Connector, TransportEvent, TransportLink};
use crate::gateway::{GatewayError, CLOSE_INVALID_SEQUENCE, CLOSE_SESSION_TIMED_OUT};
use crate::model::{AccountId, GuildId};
use crate::rest::RestClient;
use crate::retry::with_timeout;

/// Output of a running session, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionSignal {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// A dispatch changed the cache.
    Change(Change),
    /// The server accepted a resume and finished replaying missed events.
    Resumed,
    /// Inbound text frame, before decoding. Only sent with raw frames enabled.
    RawFrame(String),
}

/// Session id and sequence needed to resume without a new snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumeHandle {
    pub session_id: String,
    pub sequence: u64,
    pub resume_url: Option<String>,
}

/// Configured but not yet running gateway session for one account.
pub struct ConnectionSession {
    account: AccountConfig,
    tunables: GatewayTunables,
    connector: Arc<dyn Connector>,
    cache: Arc<EntityCache>,
    rest: Option<RestClient>,
}

impl ConnectionSession {
    pub fn new(
        account: AccountConfig,
        tunables: GatewayTunables,
        connector: Arc<dyn Connector>,
        cache: Arc<EntityCache>,
    ) -> Self {
        Self {
            account,
            tunables,
            connector,
            cache,
            rest: None,
        }
    }

    /// Attaches a REST client used to look up the gateway URL when no
    /// endpoint override is configured.
    pub fn with_rest(mut self, rest: RestClient) -> Self {
        self.rest = Some(rest);
        self
    }

    pub fn account(&self) -> &AccountId {
        &self.account.id
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Starts the worker task.
    pub fn spawn(self, signals: mpsc::Sender<SessionSignal>) -> SessionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (latency_tx, latency_rx) = watch::channel(None);
        let account = self.account.id.clone();

        let worker = SessionWorker {
            account: self.account,
            tunables: self.tunables,
            connector: self.connector,
            cache: self.cache,
            rest: self.rest,
            signals,
            machine: SessionMachine::default(),
            state_tx,
            latency_tx,
            shutdown: shutdown_rx,
            resume: None,
            last_sequence: None,
            gateway_url: None,
        };
        let task = tokio::spawn(worker.run());

        SessionHandle {
            account,
            shutdown: shutdown_tx,
            state: state_rx,
            latency: latency_rx,
            task,
        }
    }
}

/// Control handle for a spawned session. Dropping it shuts the session down.
#[derive(Debug)]
pub struct SessionHandle {
    account: AccountId,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<SessionState>,
    latency: watch::Receiver<Option<Duration>>,
    task: JoinHandle<Result<(), GatewayError>>,
}

impl SessionHandle {
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        *self.latency.borrow()
    }

    /// Asks the session to close its link and stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits until the session reaches `target`. Returns false if the session
    /// stopped without reaching it.
    pub async fn wait_for_state(&mut self, target: SessionState) -> bool {
        self.state.wait_for(|state| *state == target).await.is_ok()
    }

    /// Waits for the worker to stop. `Ok` means it was shut down on request.
    pub async fn join(self) -> Result<(), GatewayError> {
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Closed),
        }
    }
}

enum ConnectionOutcome {
    Shutdown,
    Reconnect,
}

enum FrameFlow {
    Continue,
    /// The handshake completed.
    Ready,
    /// A fresh identify went out on the current link.
    Reidentify,
    Reconnect,
}

struct SessionWorker {
    account: AccountConfig,
    tunables: GatewayTunables,
    connector: Arc<dyn Connector>,
    cache: Arc<EntityCache>,
    rest: Option<RestClient>,
    signals: mpsc::Sender<SessionSignal>,
    machine: SessionMachine,
    state_tx: watch::Sender<SessionState>,
    latency_tx: watch::Sender<Option<Duration>>,
    shutdown: watch::Receiver<bool>,
    resume: Option<ResumeHandle>,
    last_sequence: Option<u64>,
    gateway_url: Option<String>,
}

impl SessionWorker {
    async fn run(mut self) -> Result<(), GatewayError> {
        let max_failures = self.tunables.max_reconnect_attempts.max(1);
        let mut failures = 0;

        loop {
            if shutdown_requested(&self.shutdown) {
                return self.finish(Ok(())).await;
            }
            self.transition(SessionState::Connecting).await;

            let mut reached_ready = false;
            let result = self.run_connection(&mut reached_ready).await;
            if reached_ready {
                failures = 0;
            }

            let delay = match result {
                Ok(ConnectionOutcome::Shutdown) => return self.finish(Ok(())).await,
                Ok(ConnectionOutcome::Reconnect) => Duration::ZERO,
                Err(err) if !err.is_retryable() => {
                    warn!(
                        event = "gateway_session_failed",
                        account = %self.account.id,
                        error = %err
                    );
                    return self.finish(Err(err)).await;
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        event = "gateway_connection_lost",
                        account = %self.account.id,
                        attempt = failures,
                        max_attempts = max_failures,
                        error = %err
                    );
                    if failures >= max_failures {
                        return self
                            .finish(Err(GatewayError::ReconnectExhausted {
                                attempts: failures,
                                last: err.to_string(),
                            }))
                            .await;
                    }
                    self.tunables.backoff.delay_for_attempt(failures)
                }
            };

            self.transition(SessionState::Reconnecting).await;
            debug!(
                event = "gateway_reconnect_scheduled",
                account = %self.account.id,
                delay_ms = delay.as_millis() as u64,
                resumable = self.resume.is_some()
            );
            if !self.sleep_or_shutdown(delay).await {
                return self.finish(Ok(())).await;
            }
        }
    }

    async fn finish(mut self, result: Result<(), GatewayError>) -> Result<(), GatewayError> {
        self.transition(SessionState::Closed).await;
        result
    }

    async fn run_connection(
        &mut self,
        reached_ready: &mut bool,
    ) -> Result<ConnectionOutcome, GatewayError> {
        let url = match self.known_endpoint() {
            Some(url) => url,
            None => {
                let rest = self.rest.clone().ok_or(GatewayError::MissingEndpoint)?;
                let url = tokio::select! {
                    url = rest.gateway_url() => url?,
                    _ = wait_for_shutdown(&mut self.shutdown) => return Ok(ConnectionOutcome::Shutdown),
                };
                self.gateway_url = Some(url.clone());
                url
            }
        };
        debug!(event = "gateway_connecting", account = %self.account.id, url = %url);

        let opened = tokio::select! {
            opened = with_timeout(self.tunables.hello_timeout, open_link(self.connector.as_ref(), url)) => opened,
            _ = wait_for_shutdown(&mut self.shutdown) => return Ok(ConnectionOutcome::Shutdown),
        };
        let (link, hello, hello_text) = opened.map_err(|_| GatewayError::Timeout("hello"))??;
        let TransportLink {
            outbound,
            mut inbound,
        } = link;
        if self.account.raw_frames {
            self.emit(SessionSignal::RawFrame(hello_text)).await;
        }

        let interval = Duration::from_millis(hello.heartbeat_interval.max(1));
        debug!(
            event = "gateway_hello",
            account = %self.account.id,
            heartbeat_interval_ms = interval.as_millis() as u64
        );

        let handshake_window = self.start_handshake(&outbound).await?;
        let handshake = tokio::time::sleep(handshake_window);
        tokio::pin!(handshake);
        let mut handshaking = true;

        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_sent_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    debug!(event = "gateway_shutdown", account = %self.account.id);
                    return Ok(ConnectionOutcome::Shutdown);
                }
                _ = &mut handshake, if handshaking => {
                    let waiting_for = if self.machine.state() == SessionState::Resuming {
                        "resumed"
                    } else {
                        "ready"
                    };
                    return Err(GatewayError::Timeout(waiting_for));
                }
                _ = heartbeat.tick() => {
                    if heartbeat_sent_at.is_some() {
                        warn!(event = "gateway_heartbeat_missed", account = %self.account.id);
                        self.invalidate_session();
                        return Err(GatewayError::HeartbeatTimeout);
                    }
                    send(&outbound, proto::heartbeat(self.last_sequence)?)?;
                    heartbeat_sent_at = Some(Instant::now());
                    trace!(
                        event = "gateway_heartbeat_sent",
                        account = %self.account.id,
                        sequence = ?self.last_sequence
                    );
                }
                inbound_event = inbound.recv() => {
                    let text = match inbound_event {
                        Some(TransportEvent::Text(text)) => text,
                        Some(TransportEvent::Closed(code)) => {
                            if matches!(code, Some(CLOSE_INVALID_SEQUENCE | CLOSE_SESSION_TIMED_OUT)) {
                                self.invalidate_session();
                            }
                            return Err(GatewayError::from_close_code(code));
                        }
                        None => {
                            return Err(GatewayError::ConnectionLost("transport ended".to_string()));
                        }
                    };
                    match self.handle_frame(text, &outbound, &mut heartbeat_sent_at).await? {
                        FrameFlow::Continue => {}
                        FrameFlow::Ready => {
                            handshaking = false;
                            *reached_ready = true;
                        }
                        FrameFlow::Reidentify => {
                            handshake
                                .as_mut()
                                .reset(Instant::now() + self.tunables.ready_timeout);
                            handshaking = true;
                        }
                        FrameFlow::Reconnect => return Ok(ConnectionOutcome::Reconnect),
                    }
                }
            }
        }
    }

    fn known_endpoint(&self) -> Option<String> {
        if let Some(url) = self.tunables.endpoint_override.as_ref() {
            return Some(url.clone());
        }
        if let Some(url) = self
            .resume
            .as_ref()
            .and_then(|handle| handle.resume_url.as_deref())
        {
            return Some(gateway_endpoint(url));
        }
        self.gateway_url.clone()
    }

    /// Sends resume when a handle exists, identify otherwise. Returns how
    /// long the server has to complete the handshake.
    async fn start_handshake(
        &mut self,
        outbound: &mpsc::UnboundedSender<String>,
    ) -> Result<Duration, GatewayError> {
        match self.resume.clone() {
            Some(handle) => {
                self.transition(SessionState::Resuming).await;
                send(
                    outbound,
                    proto::resume(&self.account.token, &handle.session_id, handle.sequence)?,
                )?;
                debug!(
                    event = "gateway_resume_sent",
                    account = %self.account.id,
                    sequence = handle.sequence
                );
                Ok(self.tunables.resume_timeout)
            }
            None => {
                self.transition(SessionState::Identifying).await;
                send(outbound, proto::identify(&self.account)?)?;
                debug!(event = "gateway_identify_sent", account = %self.account.id);
                Ok(self.tunables.ready_timeout)
            }
        }
    }

    async fn handle_frame(
        &mut self,
        text: String,
        outbound: &mpsc::UnboundedSender<String>,
        heartbeat_sent_at: &mut Option<Instant>,
    ) -> Result<FrameFlow, GatewayError> {
        if self.account.raw_frames {
            self.emit(SessionSignal::RawFrame(text.clone())).await;
        }
        let frame = match GatewayFrame::parse(&text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    event = "gateway_frame_malformed",
                    account = %self.account.id,
                    error = %err
                );
                return Ok(FrameFlow::Continue);
            }
        };

        match frame.op {
            op::DISPATCH => self.handle_dispatch(frame, outbound).await,
            op::HEARTBEAT => {
                send(outbound, proto::heartbeat(self.last_sequence)?)?;
                heartbeat_sent_at.get_or_insert_with(Instant::now);
                Ok(FrameFlow::Continue)
            }
            op::HEARTBEAT_ACK => {
                if let Some(sent_at) = heartbeat_sent_at.take() {
                    let latency = sent_at.elapsed();
                    self.latency_tx.send_replace(Some(latency));
                    trace!(
                        event = "gateway_heartbeat_ack",
                        account = %self.account.id,
                        latency_ms = latency.as_millis() as u64
                    );
                }
                Ok(FrameFlow::Continue)
            }
            op::RECONNECT => {
                info!(event = "gateway_reconnect_requested", account = %self.account.id);
                Ok(FrameFlow::Reconnect)
            }
            op::INVALID_SESSION => {
                let resumable = frame.d.as_bool().unwrap_or(false);
                if resumable && self.resume.is_some() {
                    info!(
                        event = "gateway_session_resumable",
                        account = %self.account.id
                    );
                    return Ok(FrameFlow::Reconnect);
                }
                info!(event = "gateway_session_invalidated", account = %self.account.id);
                self.invalidate_session();
                self.transition(SessionState::Identifying).await;
                send(outbound, proto::identify(&self.account)?)?;
                Ok(FrameFlow::Reidentify)
            }
            other => {
                debug!(
                    event = "gateway_opcode_ignored",
                    account = %self.account.id,
                    op = other
                );
                Ok(FrameFlow::Continue)
            }
        }
    }

    async fn handle_dispatch(
        &mut self,
        frame: GatewayFrame,
        outbound: &mpsc::UnboundedSender<String>,
    ) -> Result<FrameFlow, GatewayError> {
        if let Some(sequence) = frame.s {
            if let Some(last) = self.last_sequence.filter(|last| sequence <= *last) {
                debug!(
                    event = "gateway_duplicate_dropped",
                    account = %self.account.id,
                    sequence,
                    last
                );
                return Ok(FrameFlow::Continue);
            }
            self.last_sequence = Some(sequence);
            if let Some(handle) = self.resume.as_mut() {
                handle.sequence = sequence;
            }
        }

        let Some(name) = frame.t else {
            warn!(
                event = "gateway_frame_malformed",
                account = %self.account.id,
                error = "dispatch without event name"
            );
            return Ok(FrameFlow::Continue);
        };

        if name == RESUMED {
            self.transition(SessionState::Ready).await;
            info!(
                event = "gateway_resumed",
                account = %self.account.id,
                sequence = ?self.last_sequence
            );
            self.emit(SessionSignal::Resumed).await;
            return Ok(FrameFlow::Ready);
        }

        let mutation = match decode_dispatch(&name, frame.d) {
            Ok(Some(mutation)) => mutation,
            Ok(None) => {
                debug!(
                    event = "gateway_dispatch_ignored",
                    account = %self.account.id,
                    name = %name
                );
                return Ok(FrameFlow::Continue);
            }
            Err(err) => {
                warn!(
                    event = "gateway_dispatch_malformed",
                    account = %self.account.id,
                    name = %name,
                    error = %err
                );
                return Ok(FrameFlow::Continue);
            }
        };

        let is_ready = if let Mutation::Ready(snapshot) = &mutation {
            self.resume = Some(ResumeHandle {
                session_id: snapshot.session_id.clone(),
                sequence: self.last_sequence.unwrap_or(0),
                resume_url: snapshot.resume_gateway_url.clone(),
            });
            true
        } else {
            false
        };

        let change = self.cache.apply(mutation);

        if is_ready {
            self.transition(SessionState::Ready).await;
            info!(
                event = "gateway_ready",
                account = %self.account.id,
                guilds = self.cache.read(|state| state.guilds().count())
            );
        }

        if let Some(change) = change {
            if self.account.chunk_members {
                for guild_id in self.guilds_to_chunk(&change) {
                    send(outbound, proto::request_guild_members(guild_id)?)?;
                    debug!(
                        event = "gateway_members_requested",
                        account = %self.account.id,
                        guild = %guild_id
                    );
                }
            }
            self.emit(SessionSignal::Change(change)).await;
        }

        Ok(if is_ready {
            FrameFlow::Ready
        } else {
            FrameFlow::Continue
        })
    }

    fn guilds_to_chunk(&self, change: &Change) -> Vec<GuildId> {
        match change {
            Change::Ready { .. } => self.cache.read(|state| {
                state
                    .guilds()
                    .filter(|guild| !guild.chunked)
                    .map(|guild| guild.id)
                    .collect()
            }),
            Change::GuildCreated(guild) if !guild.chunked => vec![guild.id],
            _ => Vec::new(),
        }
    }

    /// Forgets the resume handle and everything cached under it.
    fn invalidate_session(&mut self) {
        self.resume = None;
        self.last_sequence = None;
        self.cache.clear();
    }

    async fn transition(&mut self, next: SessionState) {
        let previous = match self.machine.advance(next) {
            Ok(previous) => previous,
            Err(err) => {
                warn!(
                    event = "gateway_transition_rejected",
                    account = %self.account.id,
                    error = %err
                );
                return;
            }
        };
        self.state_tx.send_replace(next);
        info!(
            event = "gateway_state_changed",
            account = %self.account.id,
            from = %previous,
            to = %next
        );
        self.emit(SessionSignal::StateChanged {
            from: previous,
            to: next,
        })
        .await;
    }

    async fn emit(&self, signal: SessionSignal) {
        if self.signals.send(signal).await.is_err() {
            trace!(event = "gateway_signal_unobserved", account = %self.account.id);
        }
    }

    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !shutdown_requested(&self.shutdown);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_for_shutdown(&mut self.shutdown) => false,
        }
    }
}

async fn open_link(
    connector: &dyn Connector,
    url: String,
) -> Result<(TransportLink, Hello, String), GatewayError> {
    let mut link = connector.connect(url).await?;
    match link.inbound.recv().await {
        Some(TransportEvent::Text(text)) => {
            let frame = GatewayFrame::parse(&text)?;
            if frame.op != op::HELLO {
                return Err(GatewayError::Protocol(format!(
                    "expected hello as first frame, got opcode {}",
                    frame.op
                )));
            }
            let hello: Hello = serde_json::from_value(frame.d)?;
            Ok((link, hello, text))
        }
        Some(TransportEvent::Closed(code)) => Err(GatewayError::from_close_code(code)),
        None => Err(GatewayError::ConnectionLost(
            "transport ended before hello".to_string(),
        )),
    }
}

fn send(outbound: &mpsc::UnboundedSender<String>, text: String) -> Result<(), GatewayError> {
    outbound
        .send(text)
        .map_err(|_| GatewayError::ConnectionLost("transport pump stopped".to_string()))
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Resolves once shutdown is requested or the handle is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|requested| *requested).await;
}
