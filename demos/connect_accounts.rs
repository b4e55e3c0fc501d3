use std::error::Error;

use gatewire_sdk::config::{AccountConfig, ClientConfig};
use gatewire_sdk::events::{Dispatcher, Event, EventKind};
use gatewire_sdk::supervisor::SessionSupervisor;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

/// Comma-separated account tokens, e.g. `GATEWIRE_TOKENS=token-a,token-b`.
const TOKENS_VAR: &str = "GATEWIRE_TOKENS";

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tokens = std::env::var(TOKENS_VAR)
        .map_err(|_| format!("set {TOKENS_VAR} to one or more comma-separated tokens"))?;
    let mut config = ClientConfig::default();
    for (index, token) in tokens.split(',').map(str::trim).filter(|t| !t.is_empty()).enumerate() {
        config = config.with_account(
            AccountConfig::new(format!("account-{index}"), SecretString::new(token.to_string()))
                .with_chunk_members(true),
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut supervisor = SessionSupervisor::new(config)?;
        let events = supervisor
            .take_events()
            .ok_or("event stream already taken")?;

        let mut dispatcher = Dispatcher::new();
        dispatcher
            .on(EventKind::Ready, |event| {
                if let Event::Ready { user, guilds, .. } = &event.event {
                    println!("[{}] ready as {} in {guilds} guilds", event.account, user.username);
                }
            })
            .on(EventKind::MessageCreate, |event| {
                if let Event::MessageCreate(message) = &event.event {
                    println!(
                        "[{}] #{} {}: {}",
                        event.account, message.channel_id, message.author.username, message.content
                    );
                }
            })
            .on(EventKind::RateLimited, |event| {
                if let Event::RateLimited(notice) = &event.event {
                    println!(
                        "[{}] throttled on {} for {:?}",
                        event.account, notice.route, notice.retry_after
                    );
                }
            })
            .on(EventKind::AccountFailed, |event| {
                if let Event::AccountFailed { reason, restarts } = &event.event {
                    println!("[{}] gave up after {restarts} restarts: {reason}", event.account);
                }
            });

        supervisor.start()?;
        tokio::select! {
            _ = dispatcher.run(events) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        supervisor.shutdown().await;

        Ok::<(), Box<dyn Error>>(())
    })
}
