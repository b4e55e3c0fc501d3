use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use gatewire_sdk::config::RestOptions;
use gatewire_sdk::model::{AccountId, Snowflake};
use gatewire_sdk::rest::{
    HttpRequest, HttpResponse, HttpTransport, RateLimiter, RestClient, RestError, Route,
};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio::time::Instant;

/// Echoes message sends and answers with a fixed rate-limit window per call.
struct Windowed {
    /// `(remaining, reset_after)` headers for the n-th call; later calls reuse the last entry.
    windows: Vec<(u32, &'static str)>,
    sent: Mutex<Vec<(Instant, String, String)>>,
}

impl Windowed {
    fn new(windows: Vec<(u32, &'static str)>) -> Arc<Self> {
        Arc::new(Self {
            windows,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(Instant, String, String)> {
        self.sent.lock().expect("sent lock").clone()
    }
}

impl HttpTransport for Windowed {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RestError>> {
        Box::pin(async move {
            let content = request
                .body
                .as_ref()
                .and_then(|body| body["content"].as_str())
                .unwrap_or_default()
                .to_string();
            let token = request
                .authorization
                .as_ref()
                .map(|token| token.expose_secret().clone())
                .unwrap_or_default();
            let index = {
                let mut sent = self.sent.lock().expect("sent lock");
                sent.push((Instant::now(), token, content.clone()));
                sent.len() - 1
            };
            let (remaining, reset_after) = self
                .windows
                .get(index)
                .or_else(|| self.windows.last())
                .copied()
                .unwrap_or((5, "5"));
            let headers = HashMap::from([
                ("x-ratelimit-remaining".to_string(), remaining.to_string()),
                ("x-ratelimit-reset-after".to_string(), reset_after.to_string()),
            ]);
            let body = json!({
                "id": (1000 + index).to_string(),
                "channel_id": "300",
                "author": {"id": "1", "username": "sender"},
                "content": content,
            });
            Ok(HttpResponse {
                status: StatusCode::OK,
                headers,
                body: body.to_string(),
            })
        })
    }
}

fn limiter(transport: Arc<Windowed>) -> Arc<RateLimiter> {
    let options = RestOptions::default().with_ratelimit_padding(Duration::ZERO);
    Arc::new(RateLimiter::new(transport, &options))
}

fn client(label: &str, limiter: &Arc<RateLimiter>) -> RestClient {
    RestClient::new(
        AccountId::new(label),
        SecretString::new(format!("{label}-token")),
        "http://api.test/api/v10",
        Arc::clone(limiter),
    )
}

#[tokio::test(start_paused = true)]
async fn exhausted_bucket_queues_calls_in_order_until_reset() {
    let transport = Windowed::new(vec![(1, "5"), (0, "5"), (5, "5")]);
    let limiter = limiter(Arc::clone(&transport));
    let rest = client("a", &limiter);
    let channel = Snowflake::new(300);
    let start = Instant::now();

    let contents = ["one", "two", "three", "four", "five"];
    let results = join_all(
        contents
            .iter()
            .map(|content| rest.send_message(channel, content)),
    )
    .await;
    for (result, expected) in results.iter().zip(contents) {
        let sent = result.as_ref().expect("message sent");
        assert_eq!(sent.content, expected);
    }

    let sent = transport.sent();
    let order: Vec<&str> = sent.iter().map(|(_, _, content)| content.as_str()).collect();
    assert_eq!(order, contents);
    assert_eq!(sent[0].0, start);
    assert_eq!(sent[1].0, start);
    for (at, _, content) in &sent[2..] {
        assert_eq!(
            *at,
            start + Duration::from_secs(5),
            "{content} should wait for the window reset"
        );
    }

    let route = Route::post("/channels/{channel_id}/messages")
        .param(channel)
        .key();
    let snapshot = limiter
        .bucket(rest.account(), &route)
        .expect("bucket snapshot");
    assert_eq!(snapshot.queued, 0);
    assert_eq!(snapshot.remaining, Some(5));
}

#[tokio::test(start_paused = true)]
async fn accounts_do_not_share_per_account_buckets() {
    let transport = Windowed::new(vec![(0, "30"), (5, "5")]);
    let limiter = limiter(Arc::clone(&transport));
    let first = client("a", &limiter);
    let second = client("b", &limiter);
    let channel = Snowflake::new(300);
    let start = Instant::now();

    first
        .send_message(channel, "drains a")
        .await
        .expect("first account");
    second
        .send_message(channel, "b is fresh")
        .await
        .expect("second account");

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, "a-token");
    assert_eq!(sent[1].1, "b-token");
    assert_eq!(sent[1].0, start);

    first.close();
    assert!(matches!(
        first.send_message(channel, "after close").await,
        Err(RestError::SessionClosed)
    ));
    assert_eq!(transport.sent().len(), 2);
}
