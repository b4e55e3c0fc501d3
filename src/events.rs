//! Public event surface.
//!
//! Every account's sessions, cache changes and rate-limit notices are
//! flattened into [`AccountEvent`]s. Each account delivers into its own
//! bounded queue; [`EventStream`] merges those queues for applications
//! that want a single feed. Applications either drain events directly or
//! register handlers on a [`Dispatcher`], which calls them per
//! [`EventKind`] in registration order.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::SelectAll;
use futures_util::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::cache::{Change, ReactionChange, RemovedGuild, RoleUpdate};
use crate::gateway::{SessionSignal, SessionState};
use crate::model::{
    AccountId, Ban, Channel, Guild, GuildId, GuildMember, Message, Role, User, UserId,
};
use crate::rest::RateLimitNotice;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Initial snapshot applied.
    Ready {
        user: User,
        guilds: usize,
        private_channels: usize,
    },
    /// A dropped session was resumed without a new snapshot.
    Resumed,
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    GuildCreate(Guild),
    GuildUpdate {
        old: Guild,
        new: Guild,
    },
    GuildDelete(RemovedGuild),
    ChannelCreate(Channel),
    ChannelUpdate {
        old: Channel,
        new: Channel,
    },
    ChannelDelete(Channel),
    MessageCreate(Message),
    MessageUpdate {
        old: Message,
        new: Message,
    },
    MessageDelete(Message),
    ReactionAdd(ReactionChange),
    ReactionRemove(ReactionChange),
    MemberAdd(GuildMember),
    MemberUpdate {
        old: GuildMember,
        new: GuildMember,
    },
    MemberRemove(GuildMember),
    MembersChunk {
        guild_id: GuildId,
        count: usize,
        complete: bool,
    },
    RoleCreate(Role),
    RoleUpdate(RoleUpdate),
    RoleDelete {
        role: Role,
        pruned_members: Vec<UserId>,
    },
    BanCreate(Ban),
    BanRemove(Ban),
    /// A call was throttled and will be retried automatically.
    RateLimited(RateLimitNotice),
    /// Undecoded inbound frame, when raw frames are enabled.
    RawFrame(String),
    /// The account's session will not be restarted again.
    AccountFailed {
        reason: String,
        restarts: usize,
    },
}

/// Payload-free tag of an [`Event`], used as the dispatcher key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Ready,
    Resumed,
    StateChanged,
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    ReactionAdd,
    ReactionRemove,
    MemberAdd,
    MemberUpdate,
    MemberRemove,
    MembersChunk,
    RoleCreate,
    RoleUpdate,
    RoleDelete,
    BanCreate,
    BanRemove,
    RateLimited,
    RawFrame,
    AccountFailed,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ready { .. } => EventKind::Ready,
            Self::Resumed => EventKind::Resumed,
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::GuildCreate(_) => EventKind::GuildCreate,
            Self::GuildUpdate { .. } => EventKind::GuildUpdate,
            Self::GuildDelete(_) => EventKind::GuildDelete,
            Self::ChannelCreate(_) => EventKind::ChannelCreate,
            Self::ChannelUpdate { .. } => EventKind::ChannelUpdate,
            Self::ChannelDelete(_) => EventKind::ChannelDelete,
            Self::MessageCreate(_) => EventKind::MessageCreate,
            Self::MessageUpdate { .. } => EventKind::MessageUpdate,
            Self::MessageDelete(_) => EventKind::MessageDelete,
            Self::ReactionAdd(_) => EventKind::ReactionAdd,
            Self::ReactionRemove(_) => EventKind::ReactionRemove,
            Self::MemberAdd(_) => EventKind::MemberAdd,
            Self::MemberUpdate { .. } => EventKind::MemberUpdate,
            Self::MemberRemove(_) => EventKind::MemberRemove,
            Self::MembersChunk { .. } => EventKind::MembersChunk,
            Self::RoleCreate(_) => EventKind::RoleCreate,
            Self::RoleUpdate(_) => EventKind::RoleUpdate,
            Self::RoleDelete { .. } => EventKind::RoleDelete,
            Self::BanCreate(_) => EventKind::BanCreate,
            Self::BanRemove(_) => EventKind::BanRemove,
            Self::RateLimited(_) => EventKind::RateLimited,
            Self::RawFrame(_) => EventKind::RawFrame,
            Self::AccountFailed { .. } => EventKind::AccountFailed,
        }
    }
}

impl From<Change> for Event {
    fn from(change: Change) -> Self {
        match change {
            Change::Ready {
                user,
                guilds,
                private_channels,
            } => Self::Ready {
                user,
                guilds,
                private_channels,
            },
            Change::GuildCreated(guild) => Self::GuildCreate(guild),
            Change::GuildUpdated { old, new } => Self::GuildUpdate { old, new },
            Change::GuildDeleted(removed) => Self::GuildDelete(removed),
            Change::ChannelCreated(channel) => Self::ChannelCreate(channel),
            Change::ChannelUpdated { old, new } => Self::ChannelUpdate { old, new },
            Change::ChannelDeleted(channel) => Self::ChannelDelete(channel),
            Change::MessageCreated(message) => Self::MessageCreate(message),
            Change::MessageUpdated { old, new } => Self::MessageUpdate { old, new },
            Change::MessageDeleted(message) => Self::MessageDelete(message),
            Change::ReactionAdded(reaction) => Self::ReactionAdd(reaction),
            Change::ReactionRemoved(reaction) => Self::ReactionRemove(reaction),
            Change::MemberAdded(member) => Self::MemberAdd(member),
            Change::MemberUpdated { old, new } => Self::MemberUpdate { old, new },
            Change::MemberRemoved(member) => Self::MemberRemove(member),
            Change::MembersChunked {
                guild_id,
                count,
                complete,
            } => Self::MembersChunk {
                guild_id,
                count,
                complete,
            },
            Change::RoleCreated(role) => Self::RoleCreate(role),
            Change::RoleUpdated(update) => Self::RoleUpdate(update),
            Change::RoleDeleted {
                role,
                pruned_members,
            } => Self::RoleDelete {
                role,
                pruned_members,
            },
            Change::BanAdded(ban) => Self::BanCreate(ban),
            Change::BanRemoved(ban) => Self::BanRemove(ban),
        }
    }
}

impl From<SessionSignal> for Event {
    fn from(signal: SessionSignal) -> Self {
        match signal {
            SessionSignal::StateChanged { from, to } => Self::StateChanged { from, to },
            SessionSignal::Change(change) => Self::from(change),
            SessionSignal::Resumed => Self::Resumed,
            SessionSignal::RawFrame(text) => Self::RawFrame(text),
        }
    }
}

/// An [`Event`] tagged with the account it happened on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountEvent {
    pub account: AccountId,
    pub event: Event,
}

impl AccountEvent {
    pub fn new(account: AccountId, event: impl Into<Event>) -> Self {
        Self {
            account,
            event: event.into(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

/// One account's event queue as a stream.
struct AccountQueue(mpsc::Receiver<AccountEvent>);

impl Stream for AccountQueue {
    type Item = AccountEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AccountEvent>> {
        self.0.poll_recv(cx)
    }
}

/// Every account's events merged into one feed.
///
/// Queues are polled independently, so an account whose queue is empty or
/// slow never holds back events already waiting on another. Accounts added
/// to the supervisor later join the feed as they are created.
pub struct EventStream {
    joining: mpsc::UnboundedReceiver<mpsc::Receiver<AccountEvent>>,
    joining_open: bool,
    queues: SelectAll<AccountQueue>,
}

impl EventStream {
    pub(crate) fn new(joining: mpsc::UnboundedReceiver<mpsc::Receiver<AccountEvent>>) -> Self {
        Self {
            joining,
            joining_open: true,
            queues: SelectAll::new(),
        }
    }

    /// Next event from any account. `None` once every queue has closed.
    pub async fn recv(&mut self) -> Option<AccountEvent> {
        self.next().await
    }

    /// An event that is already waiting, if any.
    pub fn try_recv(&mut self) -> Option<AccountEvent> {
        self.next().now_or_never().flatten()
    }

    /// Number of account queues currently merged.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("queues", &self.queues.len())
            .field("joining_open", &self.joining_open)
            .finish()
    }
}

impl Stream for EventStream {
    type Item = AccountEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AccountEvent>> {
        let this = &mut *self;
        while this.joining_open {
            match this.joining.poll_recv(cx) {
                Poll::Ready(Some(queue)) => this.queues.push(AccountQueue(queue)),
                Poll::Ready(None) => this.joining_open = false,
                Poll::Pending => break,
            }
        }
        match this.queues.poll_next_unpin(cx) {
            Poll::Ready(None) if this.joining_open => Poll::Pending,
            polled => polled,
        }
    }
}

/// Registered event callback.
pub type Handler = Arc<dyn Fn(&AccountEvent) + Send + Sync>;

/// Routes events to handlers registered per [`EventKind`].
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<EventKind, Vec<Handler>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self
            .handlers
            .iter()
            .map(|(kind, handlers)| (*kind, handlers.len()))
            .collect();
        kinds.sort();
        f.debug_struct("Dispatcher").field("handlers", &kinds).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`. Handlers run in registration order.
    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> &mut Self
    where
        F: Fn(&AccountEvent) + Send + Sync + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
        self
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Calls every handler registered for the event's kind and returns how
    /// many ran.
    pub fn dispatch(&self, event: &AccountEvent) -> usize {
        let Some(handlers) = self.handlers.get(&event.kind()) else {
            return 0;
        };
        for handler in handlers {
            handler(event);
        }
        handlers.len()
    }

    /// Dispatches everything yielded by `events` until it ends.
    pub async fn run<S>(&self, mut events: S)
    where
        S: Stream<Item = AccountEvent> + Unpin,
    {
        while let Some(event) = events.next().await {
            self.dispatch(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::{AccountEvent, Dispatcher, Event, EventKind, EventStream};
    use crate::cache::Change;
    use crate::gateway::{SessionSignal, SessionState};
    use crate::model::{AccountId, Ban, Snowflake, User};

    fn user(id: u64) -> User {
        User {
            id: Snowflake::new(id),
            username: format!("user-{id}"),
            global_name: None,
            bot: false,
        }
    }

    fn ban_event() -> AccountEvent {
        AccountEvent::new(
            AccountId::from("main"),
            Change::BanAdded(Ban {
                guild_id: Snowflake::new(1),
                user: user(2),
            }),
        )
    }

    #[test]
    fn changes_map_to_named_events() {
        let event = ban_event();
        assert_eq!(event.kind(), EventKind::BanCreate);

        let ready = Event::from(Change::Ready {
            user: user(1),
            guilds: 2,
            private_channels: 0,
        });
        assert_eq!(ready.kind(), EventKind::Ready);

        let state = Event::from(SessionSignal::StateChanged {
            from: SessionState::Connecting,
            to: SessionState::Identifying,
        });
        assert_eq!(state.kind(), EventKind::StateChanged);
    }

    #[test]
    fn handlers_run_in_registration_order_per_kind() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        for label in ["first", "second", "third"] {
            let calls = calls.clone();
            dispatcher.on(EventKind::BanCreate, move |_| {
                calls.lock().expect("calls").push(label);
            });
        }
        let other = calls.clone();
        dispatcher.on(EventKind::MessageCreate, move |_| {
            other.lock().expect("calls").push("message");
        });

        assert_eq!(dispatcher.dispatch(&ban_event()), 3);
        assert_eq!(
            *calls.lock().expect("calls"),
            vec!["first", "second", "third"]
        );
        assert_eq!(dispatcher.handler_count(EventKind::MessageCreate), 1);
        assert_eq!(dispatcher.handler_count(EventKind::Ready), 0);
    }

    #[test]
    fn events_without_handlers_are_ignored() {
        let dispatcher = Dispatcher::new();
        let event = AccountEvent::new(AccountId::from("main"), Event::Resumed);
        assert_eq!(dispatcher.dispatch(&event), 0);
    }

    #[tokio::test]
    async fn run_drains_every_queue_until_they_close() {
        let seen = Arc::new(Mutex::new(0usize));
        let mut dispatcher = Dispatcher::new();
        let counter = seen.clone();
        dispatcher.on(EventKind::BanCreate, move |event| {
            assert_eq!(event.account.as_str(), "main");
            *counter.lock().expect("counter") += 1;
        });

        let (joining_tx, joining_rx) = mpsc::unbounded_channel();
        let (first_tx, first_rx) = mpsc::channel(4);
        let (second_tx, second_rx) = mpsc::channel(4);
        joining_tx.send(first_rx).expect("join");
        joining_tx.send(second_rx).expect("join");
        drop(joining_tx);

        first_tx.send(ban_event()).await.expect("send");
        second_tx.send(ban_event()).await.expect("send");
        second_tx.send(ban_event()).await.expect("send");
        drop(first_tx);
        drop(second_tx);
        dispatcher.run(EventStream::new(joining_rx)).await;

        assert_eq!(*seen.lock().expect("counter"), 3);
    }

    #[tokio::test]
    async fn idle_queue_does_not_hold_back_another() {
        let (joining_tx, joining_rx) = mpsc::unbounded_channel();
        let mut events = EventStream::new(joining_rx);
        let (_idle_tx, idle_rx) = mpsc::channel::<AccountEvent>(1);
        joining_tx.send(idle_rx).expect("join");
        assert!(events.try_recv().is_none());
        assert_eq!(events.queue_count(), 1);

        let (busy_tx, busy_rx) = mpsc::channel(4);
        joining_tx.send(busy_rx).expect("join late");
        busy_tx.send(ban_event()).await.expect("send");
        let event = events.recv().await.expect("event from the late queue");
        assert_eq!(event.kind(), EventKind::BanCreate);
        assert_eq!(events.queue_count(), 2);
        assert!(events.try_recv().is_none());
    }
}
