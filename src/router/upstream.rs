//! HTTP hop from the gateway to a service replica

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Connection refused, reset, or closed before a response
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response started but its body was cut off; the replica may already
    /// have done the work
    #[error("Response interrupted: {0}")]
    Interrupted(String),

    #[error("Upstream timed out after {0:?}")]
    Timeout(Duration),
}

/// Request forwarded unchanged to a replica
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path and query on the replica (`/v1/completions`)
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn new(method: Method, path: impl Into<String>, body: Bytes) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = strip_hop_by_hop(headers);
        self
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends one request to one replica address
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(
        &self,
        address: &str,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

/// Headers that describe a single connection, not the message
pub fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in [
        header::HOST,
        header::CONNECTION,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::TE,
        header::TRAILER,
        header::PROXY_AUTHORIZATION,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers
}

pub struct HttpUpstream {
    client: Client,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self { client, timeout }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(
        &self,
        address: &str,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = format!("http://{}{}", address, request.path);
        trace!("{} {}", request.method, url);

        let response = self
            .client
            .request(request.method, &url)
            .headers(request.headers)
            .body(request.body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(self.timeout)
                } else {
                    UpstreamError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let headers = strip_hop_by_hop(response.headers().clone());
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout(self.timeout)
            } else {
                UpstreamError::Interrupted(e.to_string())
            }
        })?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(any(test, feature = "testkit"))]
pub use self::mock::MockUpstream;

#[cfg(any(test, feature = "testkit"))]
mod mock {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Mutex;

    /// Answers with a JSON echo unless an address is told to fail
    #[derive(Default)]
    pub struct MockUpstream {
        failing: DashMap<String, UpstreamError>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl MockUpstream {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every request to `address` fail at the transport level
        pub fn fail(&self, address: &str) {
            self.failing.insert(
                address.to_string(),
                UpstreamError::Transport("connection refused".to_string()),
            );
        }

        pub fn fail_with(&self, address: &str, error: UpstreamError) {
            self.failing.insert(address.to_string(), error);
        }

        pub fn recover(&self, address: &str) {
            self.failing.remove(address);
        }

        /// `(address, path)` of every request, failed ones included
        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
        }
    }

    #[async_trait]
    impl Upstream for MockUpstream {
        async fn send(
            &self,
            address: &str,
            request: UpstreamRequest,
        ) -> Result<UpstreamResponse, UpstreamError> {
            self.calls
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push((address.to_string(), request.path.clone()));

            if let Some(error) = self.failing.get(address) {
                return Err(error.clone());
            }

            let body = serde_json::json!({
                "address": address,
                "path": request.path,
                "body": String::from_utf8_lossy(&request.body),
            });
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            );
            Ok(UpstreamResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from(body.to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use tokio::net::TcpListener;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "gateway".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer x".parse().unwrap());
        let headers = strip_hop_by_hop(headers);
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::AUTHORIZATION).is_some());
    }

    #[tokio::test]
    async fn test_http_upstream_passes_body_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let app = Router::new().route("/v1/completions", post(|body: Bytes| async move { body }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let upstream = HttpUpstream::new(Duration::from_secs(5));
        let response = upstream
            .send(
                &addr,
                UpstreamRequest::new(Method::POST, "/v1/completions", Bytes::from("{\"prompt\":\"hi\"}")),
            )
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"{\"prompt\":\"hi\"}");
    }

    #[tokio::test]
    async fn test_http_upstream_truncated_body_is_interrupted() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n{\"choices\":")
                .await
                .unwrap();
        });

        let upstream = HttpUpstream::new(Duration::from_secs(5));
        let result = upstream
            .send(&addr, UpstreamRequest::new(Method::POST, "/v1/completions", Bytes::new()))
            .await;
        assert!(matches!(result, Err(UpstreamError::Interrupted(_))));
    }

    #[tokio::test]
    async fn test_http_upstream_connection_refused_is_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let upstream = HttpUpstream::new(Duration::from_secs(2));
        let result = upstream
            .send(&addr, UpstreamRequest::new(Method::GET, "/v1/models", Bytes::new()))
            .await;
        assert!(matches!(result, Err(UpstreamError::Transport(_))));
    }
}
