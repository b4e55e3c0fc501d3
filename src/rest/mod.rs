//! HTTP surface of the platform.
//!
//! - `route`: call targets and their rate-limit keys.
//! - `ratelimit`: per-bucket queuing, 429 recovery and global throttles.
//! - `transport`: the [`HttpTransport`] seam and its reqwest implementation.
//! - `client`: per-account [`RestClient`] with typed endpoints.

/// Per-account typed endpoints.
pub mod client;
/// Bucket accounting and call gating.
pub mod ratelimit;
/// Route templates and rate-limit keys.
pub mod route;
/// HTTP transport abstraction.
pub mod transport;

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

pub use client::{BanEntry, ChannelEdit, MemberEdit, RestClient, RoleEdit};
pub use ratelimit::{BucketScope, BucketSnapshot, RateLimitNotice, RateLimiter};
pub use route::{Route, RouteKey};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("bad request: {body}")]
    BadRequest { body: String },

    #[error("unauthorized: {body}")]
    Unauthorized { body: String },

    #[error("forbidden: {body}")]
    Forbidden { body: String },

    #[error("not found: {body}")]
    NotFound { body: String },

    #[error("http status {status}: {body}")]
    Http { status: StatusCode, body: String },

    /// The platform demands a captcha; the call cannot be completed
    /// without out-of-band human interaction.
    #[error("captcha required")]
    CaptchaRequired {
        service: Option<String>,
        sitekey: Option<String>,
    },

    #[error("session closed")]
    SessionClosed,

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl RestError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => status.is_server_error(),
            _ => false,
        }
    }

    /// The account's credentials are no longer accepted.
    pub fn is_fatal_for_account(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// Maps a finished non-429 response to success or a typed error.
pub(crate) fn check_status(response: HttpResponse) -> Result<HttpResponse, RestError> {
    let status = response.status;
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::BAD_REQUEST {
        if let Some(captcha) = captcha_challenge(&response.body) {
            return Err(captcha);
        }
    }

    let body = summarize_error_body(&response.body);
    Err(match status {
        StatusCode::BAD_REQUEST => RestError::BadRequest { body },
        StatusCode::UNAUTHORIZED => RestError::Unauthorized { body },
        StatusCode::FORBIDDEN => RestError::Forbidden { body },
        StatusCode::NOT_FOUND => RestError::NotFound { body },
        status => RestError::Http { status, body },
    })
}

fn captcha_challenge(body: &str) -> Option<RestError> {
    #[derive(Debug, Deserialize)]
    struct CaptchaBody {
        #[serde(default)]
        captcha_key: Option<serde_json::Value>,
        #[serde(default)]
        captcha_service: Option<String>,
        #[serde(default)]
        captcha_sitekey: Option<String>,
    }

    match serde_json::from_str::<CaptchaBody>(body) {
        Ok(parsed) if parsed.captcha_key.is_some() || parsed.captcha_service.is_some() => {
            Some(RestError::CaptchaRequired {
                service: parsed.captcha_service,
                sitekey: parsed.captcha_sitekey,
            })
        }
        _ if body.contains("hcaptcha") => Some(RestError::CaptchaRequired {
            service: Some("hcaptcha".to_string()),
            sitekey: None,
        }),
        _ => None,
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<i64>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        match (parsed.message, parsed.code) {
            (Some(message), Some(code)) => return format!("{message} (code {code})"),
            (Some(message), None) => return message,
            _ => {}
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
