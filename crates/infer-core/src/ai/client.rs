//! HTTP client for OpenAI-compatible gateways

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use super::format::build_request_body;
use super::parser::OpenAIParser;
use super::retry::{is_retryable_status, with_retry, IsRetryable};
use super::streaming::{ChatClient, ChatRequest, StreamPart};
use crate::config::{GatewayConfig, RetryConfig};

/// Why a request failed before its stream opened
#[derive(Debug, Error)]
enum SendError {
    #[error("Gateway returned {status}: {body}")]
    Status {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("No response from {url} within {secs} seconds")]
    NoResponse { url: String, secs: u64 },
}

impl IsRetryable for SendError {
    fn is_retryable(&self) -> bool {
        match self {
            SendError::Status { status, .. } => is_retryable_status(status.as_u16()),
            SendError::Transport { source, .. } => source.is_connect() || source.is_timeout(),
            SendError::NoResponse { .. } => true,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            SendError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Streams chat completions from `{base_url}/chat/completions`
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    response_timeout: Duration,
    retry: RetryConfig,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        // No overall timeout: a long generation must not be cut off mid-stream
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            response_timeout: config.response_timeout(),
            retry: config.retry.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// One attempt: send and wait for a successful status.
    async fn send_once(&self, body: &Value) -> Result<reqwest::Response, SendError> {
        let url = self.endpoint();
        let mut builder = self
            .http
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = match tokio::time::timeout(self.response_timeout, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => return Err(SendError::Transport { url, source }),
            Err(_) => {
                return Err(SendError::NoResponse {
                    url,
                    secs: self.response_timeout.as_secs(),
                })
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        let body = response.text().await.unwrap_or_default();
        Err(SendError::Status {
            status,
            body,
            retry_after,
        })
    }
}

/// `Retry-After` in its delay-seconds form.
fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl ChatClient for GatewayClient {
    async fn stream(&self, request: ChatRequest) -> Result<mpsc::UnboundedReceiver<StreamPart>> {
        let body = build_request_body(&request);
        tracing::info!(
            request_id = %request.request_id,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Starting chat stream"
        );

        let body = &body;
        let response = with_retry(&self.retry, move || self.send_once(body)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let request_id = request.request_id;
        tokio::spawn(async move {
            let mut parser = OpenAIParser::new();
            let mut buffer = BytesMut::new();
            let mut body = response.bytes_stream();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(request_id = %request_id, error = %e, "Stream read failed");
                        let _ = tx.send(StreamPart::Error {
                            error: format!("stream read failed: {e}"),
                        });
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line = buffer.split_to(pos);
                    buffer.advance(1);
                    let line = String::from_utf8_lossy(&line);
                    let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
                        continue;
                    };
                    match parser.parse_data(data) {
                        Ok(parts) => {
                            for part in parts {
                                if tx.send(part).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!(request_id = %request_id, error = %e, "Skipping malformed SSE line");
                        }
                    }
                }
            }

            for part in parser.drain_tool_calls() {
                let _ = tx.send(part);
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn status_error(status: u16) -> SendError {
        SendError::Status {
            status: StatusCode::from_u16(status).unwrap(),
            body: String::new(),
            retry_after: None,
        }
    }

    #[test]
    fn test_status_errors_retry_only_when_transient() {
        assert!(status_error(429).is_retryable());
        assert!(status_error(503).is_retryable());
        assert!(!status_error(400).is_retryable());
        assert!(!status_error(401).is_retryable());
        assert!(SendError::NoResponse {
            url: "http://x".into(),
            secs: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_retry_after_seconds() {
        let value = HeaderValue::from_static("7");
        assert_eq!(parse_retry_after(Some(&value)), Some(Duration::from_secs(7)));
        let date = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&date)), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn test_client_builds_from_defaults() {
        let client = GatewayClient::new(&GatewayConfig {
            base_url: "http://localhost:1/v1/".into(),
            ..GatewayConfig::default()
        })
        .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:1/v1/chat/completions");
        assert_eq!(client.response_timeout, Duration::from_secs(300));
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    return;
                }
            }
        }
    }

    /// Answers connection `n` with `responses[n]`, or holds it open silently
    /// once the list runs out.
    async fn serve(responses: Vec<&'static str>) -> (GatewayConfig, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                read_request(&mut socket).await;
                match responses.get(n) {
                    Some(response) => {
                        socket.write_all(response.as_bytes()).await.unwrap();
                        socket.shutdown().await.ok();
                    }
                    None => held.push(socket),
                }
            }
        });
        let config = GatewayConfig {
            base_url: format!("http://{}/v1", addr),
            response_timeout_secs: 1,
            retry: RetryConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                ..RetryConfig::default()
            },
            ..GatewayConfig::default()
        };
        (config, connections)
    }

    #[tokio::test]
    async fn test_silent_server_hits_response_timeout() {
        let (mut config, connections) = serve(Vec::new()).await;
        config.retry.enabled = false;
        let client = GatewayClient::new(&config).unwrap();

        let started = std::time::Instant::now();
        let err = client.send_once(&json!({"model": "m"})).await.unwrap_err();
        assert!(matches!(err, SendError::NoResponse { secs: 1, .. }), "{err}");
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_retried_until_ok() {
        let (config, connections) = serve(vec![
            "HTTP/1.1 503 Service Unavailable\r\nRetry-After: 0\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy",
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: 14\r\nConnection: close\r\n\r\ndata: [DONE]\n\n",
        ])
        .await;
        let client = GatewayClient::new(&config).unwrap();
        let body = &json!({"model": "m"});
        let client = &client;

        let response = with_retry(&client.retry, move || client.send_once(body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bad_request_is_not_retried() {
        let (config, connections) = serve(vec![
            "HTTP/1.1 400 Bad Request\r\nContent-Length: 3\r\nConnection: close\r\n\r\nbad",
        ])
        .await;
        let client = GatewayClient::new(&config).unwrap();
        let body = &json!({"model": "m"});
        let client = &client;

        let err = with_retry(&client.retry, move || client.send_once(body))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Status { status, .. } if status == StatusCode::BAD_REQUEST));
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }
}
