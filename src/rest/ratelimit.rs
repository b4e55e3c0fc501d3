//! Rate-limit gate for outbound calls.
//!
//! Each call is classified into a bucket from its [`RouteKey`] and, for
//! per-account routes, the calling account. A bucket admits one call at a time
//! in arrival order; a bucket with no calls left waits for its reset before
//! admitting the next one. Unknown buckets admit their first call unblocked
//! and calibrate from the response headers.
//!
//! A 429 response requeues the call at the head of its bucket after the
//! server's `retry_after`. A global 429 pauses every bucket of that account.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::RestOptions;
use crate::model::AccountId;
use crate::rest::route::RouteKey;
use crate::rest::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::rest::RestError;
use crate::retry::{retry_async, with_timeout, RetryPolicy};

/// Fallback wait when a 429 carries no usable delay.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Whether a route's limit is counted per account or shared by all accounts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BucketScope {
    #[default]
    PerAccount,
    Shared,
}

/// Informational notice emitted for every 429 the limiter absorbs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitNotice {
    pub account: AccountId,
    pub route: RouteKey,
    pub retry_after: Duration,
    pub global: bool,
}

/// Point-in-time view of one bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub scope: BucketScope,
    /// `None` until a response has calibrated the bucket.
    pub remaining: Option<u32>,
    pub reset_at: Option<Instant>,
    /// Calls waiting for their turn.
    pub queued: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BucketKey {
    route: RouteKey,
    account: Option<AccountId>,
}

#[derive(Debug, Default)]
struct BucketState {
    remaining: Option<u32>,
    reset_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Bucket {
    state: tokio::sync::Mutex<BucketState>,
    queued: AtomicUsize,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct RateLimitHeaders {
    remaining: Option<u32>,
    reset_after: Option<Duration>,
    scope: Option<String>,
    global: bool,
}

impl RateLimitHeaders {
    fn parse(response: &HttpResponse) -> Self {
        Self {
            remaining: response
                .header("x-ratelimit-remaining")
                .and_then(|value| value.trim().parse().ok()),
            reset_after: response
                .header("x-ratelimit-reset-after")
                .and_then(parse_seconds),
            scope: response
                .header("x-ratelimit-scope")
                .map(|value| value.trim().to_ascii_lowercase()),
            global: response
                .header("x-ratelimit-global")
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("true")),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ThrottleBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

/// Shared gate for every outbound call of every account.
pub struct RateLimiter {
    transport: Arc<dyn HttpTransport>,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
    padding: Duration,
    default_scope: BucketScope,
    scopes: Mutex<HashMap<RouteKey, BucketScope>>,
    buckets: Mutex<HashMap<BucketKey, Arc<Bucket>>>,
    global_until: Mutex<HashMap<AccountId, Instant>>,
    notices: Option<mpsc::UnboundedSender<RateLimitNotice>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("request_timeout", &self.request_timeout)
            .field("padding", &self.padding)
            .field("default_scope", &self.default_scope)
            .field("buckets", &lock(&self.buckets).len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(transport: Arc<dyn HttpTransport>, options: &RestOptions) -> Self {
        Self {
            transport,
            request_timeout: options.request_timeout,
            retry_policy: options.retry_policy.clone(),
            padding: options.ratelimit_padding,
            default_scope: options.default_scope,
            scopes: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            global_until: Mutex::new(HashMap::new()),
            notices: None,
        }
    }

    /// Sends a [`RateLimitNotice`] to `notices` for every absorbed 429.
    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<RateLimitNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn scope_of(&self, route: &RouteKey) -> BucketScope {
        lock(&self.scopes)
            .get(route)
            .copied()
            .unwrap_or(self.default_scope)
    }

    /// Pins the scope of `route`, overriding the default.
    pub fn set_scope(&self, route: RouteKey, scope: BucketScope) {
        lock(&self.scopes).insert(route, scope);
    }

    /// Current state of the bucket `account` would use for `route`.
    ///
    /// Returns `None` for buckets never used, and while a call holds the
    /// bucket.
    pub fn bucket(&self, account: &AccountId, route: &RouteKey) -> Option<BucketSnapshot> {
        let scope = self.scope_of(route);
        let key = bucket_key(account, route, scope);
        let bucket = lock(&self.buckets).get(&key).cloned()?;
        let state = bucket.state.try_lock().ok()?;
        Some(BucketSnapshot {
            scope,
            remaining: state.remaining,
            reset_at: state.reset_at,
            queued: bucket.queued.load(Ordering::SeqCst),
        })
    }

    /// Instant until which `account` is globally throttled, if any.
    pub fn global_throttle(&self, account: &AccountId) -> Option<Instant> {
        lock(&self.global_until)
            .get(account)
            .copied()
            .filter(|until| *until > Instant::now())
    }

    /// Runs `request` through the bucket of `route`.
    ///
    /// Waits (cooperatively) for the bucket and any global throttle, absorbs
    /// 429 responses, and returns the first non-429 response. Fails with
    /// [`RestError::SessionClosed`] as soon as `closed` flips to `true`.
    pub async fn execute(
        &self,
        account: &AccountId,
        route: &RouteKey,
        request: HttpRequest,
        closed: &watch::Receiver<bool>,
    ) -> Result<HttpResponse, RestError> {
        let mut closed = closed.clone();
        if *closed.borrow() {
            return Err(RestError::SessionClosed);
        }

        let bucket = self.bucket_for(account, route);
        bucket.queued.fetch_add(1, Ordering::SeqCst);
        let acquired = tokio::select! {
            state = bucket.state.lock() => Some(state),
            _ = wait_closed(&mut closed) => None,
        };
        bucket.queued.fetch_sub(1, Ordering::SeqCst);
        let Some(mut state) = acquired else {
            return Err(RestError::SessionClosed);
        };

        loop {
            self.wait_for_global(account, &mut closed).await?;
            if let (Some(0), Some(reset_at)) = (state.remaining, state.reset_at) {
                let now = Instant::now();
                if reset_at > now {
                    debug!(
                        event = "ratelimit_bucket_exhausted",
                        account = %account,
                        bucket = %route,
                        delay_ms = (reset_at - now).as_millis() as u64
                    );
                    sleep_or_closed(reset_at, &mut closed).await?;
                    self.wait_for_global(account, &mut closed).await?;
                }
                state.remaining = None;
                state.reset_at = None;
            }
            if let Some(remaining) = state.remaining.as_mut() {
                *remaining = remaining.saturating_sub(1);
            }

            let response = self.dispatch(&request).await?;
            let headers = RateLimitHeaders::parse(&response);
            if self.calibrate(&mut state, &headers, route) {
                // The route now maps to another bucket; seed it with this window.
                let moved = self.bucket_for(account, route);
                let seeded = match moved.state.try_lock() {
                    Ok(mut target) => {
                        target.remaining = state.remaining;
                        target.reset_at = state.reset_at;
                        true
                    }
                    Err(_) => false,
                };
                if !seeded {
                    debug!(
                        event = "ratelimit_scope_seed_skipped",
                        account = %account,
                        bucket = %route
                    );
                }
            }

            if response.status != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            let body: ThrottleBody = serde_json::from_str(&response.body).unwrap_or_default();
            let retry_after = body
                .retry_after
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .or(headers.reset_after)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            let global =
                body.global || headers.global || headers.scope.as_deref() == Some("global");
            let resume_at = Instant::now() + retry_after + self.padding;

            warn!(
                event = "ratelimit_throttled",
                account = %account,
                bucket = %route,
                global,
                retry_after_ms = retry_after.as_millis() as u64
            );
            if let Some(notices) = self.notices.as_ref() {
                let _ = notices.send(RateLimitNotice {
                    account: account.clone(),
                    route: route.clone(),
                    retry_after,
                    global,
                });
            }

            if global {
                let mut throttled = lock(&self.global_until);
                let until = throttled.entry(account.clone()).or_insert(resume_at);
                if *until < resume_at {
                    *until = resume_at;
                }
            }
            sleep_or_closed(resume_at, &mut closed).await?;
        }
    }

    fn bucket_for(&self, account: &AccountId, route: &RouteKey) -> Arc<Bucket> {
        let key = bucket_key(account, route, self.scope_of(route));
        Arc::clone(lock(&self.buckets).entry(key).or_default())
    }

    async fn dispatch(&self, request: &HttpRequest) -> Result<HttpResponse, RestError> {
        let timeout = self.request_timeout;
        retry_async(
            &self.retry_policy,
            |_| {
                let request = request.clone();
                async move {
                    with_timeout(timeout, self.transport.send(request))
                        .await
                        .unwrap_or_else(|_| Err(RestError::Timeout(timeout)))
                }
            },
            RestError::is_retryable,
        )
        .await
    }

    /// Applies response headers to `state`. Returns `true` when the route's
    /// scope changed.
    fn calibrate(
        &self,
        state: &mut BucketState,
        headers: &RateLimitHeaders,
        route: &RouteKey,
    ) -> bool {
        if let Some(remaining) = headers.remaining {
            state.remaining = Some(remaining);
        }
        if let Some(reset_after) = headers.reset_after {
            state.reset_at = Some(Instant::now() + reset_after);
        }
        let scope = match headers.scope.as_deref() {
            Some("shared") => BucketScope::Shared,
            Some("user") => BucketScope::PerAccount,
            _ => return false,
        };
        if self.scope_of(route) == scope {
            return false;
        }
        debug!(event = "ratelimit_scope_changed", bucket = %route, scope = ?scope);
        self.set_scope(route.clone(), scope);
        true
    }

    async fn wait_for_global(
        &self,
        account: &AccountId,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<(), RestError> {
        while let Some(until) = self.global_throttle(account) {
            sleep_or_closed(until, closed).await?;
        }
        Ok(())
    }
}

fn bucket_key(account: &AccountId, route: &RouteKey, scope: BucketScope) -> BucketKey {
    BucketKey {
        route: route.clone(),
        account: match scope {
            BucketScope::PerAccount => Some(account.clone()),
            BucketScope::Shared => None,
        },
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once `closed` reads `true`; never resolves if the sender is gone.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let sender_gone = closed.wait_for(|closed| *closed).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

async fn sleep_or_closed(
    deadline: Instant,
    closed: &mut watch::Receiver<bool>,
) -> Result<(), RestError> {
    tokio::select! {
        _ = sleep_until(deadline) => Ok(()),
        _ = wait_closed(closed) => Err(RestError::SessionClosed),
    }
}
