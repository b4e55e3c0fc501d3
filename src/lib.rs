//! Rust client SDK for a realtime chat gateway, driving many user accounts at once.
//!
//! The crate is organized by transport surface:
//! - `gateway`: per-account websocket session state machine with heartbeats,
//!   resume, and reconnect backoff.
//! - `rest`: typed HTTP endpoints behind a shared, bucket-aware rate limiter.
//! - `cache`: per-account entity cache that reports what each frame changed.
//! - `events`: the public event catalog and a handler dispatcher.
//! - `supervisor`: owns every account's session and restarts failed ones.
//! - `config`, `model`, `retry`: shared configuration, entities, and backoff.

/// Entity cache and change diffing.
pub mod cache;
/// Client, account, gateway, and REST configuration.
pub mod config;
/// Public events and handler dispatch.
pub mod events;
/// Realtime gateway protocol, transports, and sessions.
pub mod gateway;
/// Identifiers, entities, and permission resolution.
pub mod model;
/// HTTP client, routes, and rate limiting.
pub mod rest;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
/// Multi-account session supervision.
pub mod supervisor;

pub use cache::{Change, EntityCache};
pub use config::{AccountConfig, ClientConfig, GatewayTunables, RestOptions};
pub use events::{AccountEvent, Dispatcher, Event, EventKind, EventStream};
pub use gateway::{GatewayError, SessionState};
pub use rest::{RestClient, RestError};
pub use supervisor::{AccountStatus, SessionSupervisor, SupervisorError};
