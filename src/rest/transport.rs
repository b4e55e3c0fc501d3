use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::{Client, Method, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::rest::RestError;

/// A fully resolved outbound call. Cloned for every resend after a 429.
#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub authorization: Option<SecretString>,
    pub body: Option<Value>,
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("authorization", &self.authorization.as_ref().map(|_| "[redacted]"))
            .field("body", &self.body)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    /// Header names are lower-case.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Sends one request and returns the raw response, whatever its status.
pub trait HttpTransport: Send + Sync + 'static {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RestError>>;
}

/// [`HttpTransport`] over a shared reqwest client.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, RestError> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(RestError::Transport)?;
        Ok(Self { http })
    }

    async fn send_once(&self, request: HttpRequest) -> Result<HttpResponse, RestError> {
        let mut builder = self.http.request(request.method, request.url);
        if let Some(token) = request.authorization.as_ref() {
            builder = builder.header(reqwest::header::AUTHORIZATION, token.expose_secret());
        }
        if let Some(body) = request.body.as_ref() {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(RestError::Transport)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(RestError::Transport)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, RestError>> {
        Box::pin(self.send_once(request))
    }
}
