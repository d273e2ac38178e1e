use anyhow::Context;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub mod retry;

pub use retry::{RequestError, RequestFailed, ResilientClient, RetryPolicy};

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value, timeout: Duration) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url, timeout)
        }
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn query<K: Into<String>, V: Into<String>>(
        mut self,
        params: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_str::<T>(&self.body)
            .with_context(|| format!("response is not the expected JSON shape: {}", self.body))
    }
}

/// Failure below the HTTP layer: nothing usable came back from the peer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .http
            .request(req.method.clone(), req.url.as_str())
            .headers(req.headers.clone())
            .timeout(req.timeout);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let res = builder.send().await.map_err(classify)?;
        let status = res.status();
        let body = res.text().await.map_err(classify)?;
        Ok(HttpResponse { status, body })
    }
}

/// Resets, early closes and body read failures count as connection errors so
/// they are retried. Builder and URL errors stay `Other`.
fn classify(err: reqwest::Error) -> TransportError {
    let detail = describe(&err);
    if err.is_timeout() {
        TransportError::Timeout(detail)
    } else if err.is_builder() {
        TransportError::Other(detail)
    } else if err.is_connect() || err.is_request() || err.is_body() || caused_by_io(&err) {
        TransportError::Connect(detail)
    } else {
        TransportError::Other(detail)
    }
}

fn caused_by_io(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(e) = source {
        if e.is::<std::io::Error>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        out.push_str(": ");
        out.push_str(&e.to_string());
        source = e.source();
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    pub(crate) type Reply = Result<HttpResponse, TransportError>;

    /// Replays canned replies in order and records every request it sees.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        seen: Mutex<Vec<(HttpRequest, tokio::time::Instant)>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn requests(&self) -> Vec<HttpRequest> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|(req, _)| req.clone())
                .collect()
        }

        pub(crate) fn urls(&self) -> Vec<String> {
            self.requests().into_iter().map(|r| r.url).collect()
        }

        pub(crate) fn sent_at(&self) -> Vec<tokio::time::Instant> {
            self.seen.lock().unwrap().iter().map(|(_, at)| *at).collect()
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.seen
                .lock()
                .unwrap()
                .push((req.clone(), tokio::time::Instant::now()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".to_string())))
        }
    }

    pub(crate) fn ok(body: serde_json::Value) -> Reply {
        Ok(HttpResponse {
            status: StatusCode::OK,
            body: body.to_string(),
        })
    }

    pub(crate) fn status(code: u16, body: &str) -> Reply {
        Ok(HttpResponse {
            status: StatusCode::from_u16(code).unwrap(),
            body: body.to_string(),
        })
    }

    pub(crate) fn timeout() -> Reply {
        Err(TransportError::Timeout("operation timed out".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{RequestError, ResilientClient, RetryPolicy};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Accepts every connection and drops it without answering.
    async fn dropping_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });
        (format!("http://{addr}/v1beta/models"), hits)
    }

    fn transport() -> ReqwestTransport {
        ReqwestTransport::new().unwrap()
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let req = HttpRequest::get(format!("http://{addr}/"), Duration::from_secs(2));
        let err = transport().send(&req).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
    }

    #[tokio::test]
    async fn dropped_connection_is_connect_error() {
        let (url, hits) = dropping_server().await;

        let req = HttpRequest::post(url, json!({"ping": true}), Duration::from_secs(2));
        let err = transport().send(&req).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn silent_peer_is_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let req = HttpRequest::get(format!("http://{addr}/"), Duration::from_millis(200));
        let err = transport().send(&req).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "{err:?}");
    }

    #[tokio::test]
    async fn invalid_url_is_not_retryable() {
        let req = HttpRequest::get("not a url", Duration::from_secs(1));
        let err = transport().send(&req).await.unwrap_err();
        assert!(matches!(err, TransportError::Other(_)), "{err:?}");
    }

    #[tokio::test]
    async fn dropped_connections_are_retried() {
        let (url, hits) = dropping_server().await;
        let client = ResilientClient::new(Arc::new(transport()));

        let err = client
            .post(
                &url,
                HeaderMap::new(),
                json!({}),
                Duration::from_secs(2),
                RetryPolicy::new(2, Duration::from_millis(10)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err.last,
            RequestError::Transport(TransportError::Connect(_))
        ));
    }
}
