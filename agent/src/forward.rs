//! Remote forwarding of merged snapshots

use crate::config::ForwardConfig;
use crate::error::ForwardError;
use crate::metrics;
use anyhow::Context;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sends one HTTP request. Substituted in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request<Body>) -> anyhow::Result<Response<Body>>;
}

/// hyper client with a per-request timeout
pub struct HyperTransport {
    client: Client<HttpConnector>,
    timeout: Duration,
}

impl HyperTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: Request<Body>) -> anyhow::Result<Response<Body>> {
        tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .with_context(|| format!("no response within {:?}", self.timeout))?
            .context("request failed")
    }
}

/// Posts snapshots to the configured endpoint. Never retries.
#[derive(Clone)]
pub struct Forwarder {
    endpoint: String,
    transport: Arc<dyn Transport>,
}

impl Forwarder {
    pub fn new(config: &ForwardConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint: config.endpoint(),
            transport,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn forward(&self, buffer: Vec<u8>) -> Result<(), ForwardError> {
        let timer = metrics::FORWARD_DURATION.start_timer();
        let result = self.post(buffer).await;
        timer.observe_duration();

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::FORWARD_TOTAL.with_label_values(&[status]).inc();
        result
    }

    async fn post(&self, buffer: Vec<u8>) -> Result<(), ForwardError> {
        let size = buffer.len();
        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.endpoint)
            .header(CONTENT_TYPE, "text/plain; version=0.0.4")
            .header(CONTENT_LENGTH, size)
            .body(Body::from(buffer))?;

        let response = self
            .transport
            .send(request)
            .await
            .map_err(ForwardError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status {
                code: status.as_u16(),
                status: status.to_string(),
            });
        }

        // the body is released with the response
        drop(response);
        debug!("Forwarded {} bytes to {}", size, self.endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Seen {
        method: Method,
        uri: String,
        content_length: Option<String>,
        body: Vec<u8>,
    }

    struct FakeTransport {
        status: Option<StatusCode>,
        seen: Mutex<Vec<Seen>>,
    }

    impl FakeTransport {
        fn new(status: Option<StatusCode>) -> Arc<Self> {
            Arc::new(Self {
                status,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, request: Request<Body>) -> anyhow::Result<Response<Body>> {
            let (parts, body) = request.into_parts();
            let body = hyper::body::to_bytes(body).await?.to_vec();
            self.seen.lock().unwrap().push(Seen {
                method: parts.method,
                uri: parts.uri.to_string(),
                content_length: parts
                    .headers
                    .get(CONTENT_LENGTH)
                    .map(|v| v.to_str().unwrap().to_string()),
                body,
            });

            match self.status {
                Some(status) => Ok(Response::builder()
                    .status(status)
                    .body(Body::from("reply"))
                    .unwrap()),
                None => anyhow::bail!("connection refused"),
            }
        }
    }

    #[tokio::test]
    async fn test_forward_posts_buffer() {
        let transport = FakeTransport::new(Some(StatusCode::OK));
        let forwarder = Forwarder::new(&ForwardConfig::default(), transport.clone());

        forwarder.forward(b"metric 1\n".to_vec()).await.unwrap();

        let seen = transport.seen.lock().unwrap()[0].clone();
        assert_eq!(seen.method, Method::POST);
        assert_eq!(seen.uri, "http://169.254.169.254:80/v1/gpu_metrics");
        assert_eq!(seen.content_length.as_deref(), Some("9"));
        assert_eq!(seen.body, b"metric 1\n");
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let transport = FakeTransport::new(Some(StatusCode::METHOD_NOT_ALLOWED));
        let forwarder = Forwarder::new(&ForwardConfig::default(), transport);

        let err = forwarder.forward(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, ForwardError::Status { code: 405, .. }));
        let message = err.to_string();
        assert!(message.contains("405"));
        assert!(message.contains("Method Not Allowed"));
    }

    #[tokio::test]
    async fn test_transport_failure_is_error() {
        let transport = FakeTransport::new(None);
        let forwarder = Forwarder::new(&ForwardConfig::default(), transport);

        let err = forwarder.forward(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, ForwardError::Transport(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_next_forward() {
        let failing = Forwarder::new(&ForwardConfig::default(), FakeTransport::new(None));
        let transport = FakeTransport::new(Some(StatusCode::ACCEPTED));
        let ok = Forwarder::new(&ForwardConfig::default(), transport.clone());

        let buffer = b"metric 2\n".to_vec();
        assert!(failing.forward(buffer.clone()).await.is_err());
        assert!(ok.forward(buffer.clone()).await.is_ok());
        assert_eq!(transport.seen.lock().unwrap()[0].body, buffer);
    }

    #[test]
    fn test_invalid_endpoint_is_request_error() {
        let config = ForwardConfig {
            url: "http://bad host".to_string(),
            ..ForwardConfig::default()
        };
        let forwarder = Forwarder::new(&config, FakeTransport::new(Some(StatusCode::OK)));
        let err = tokio_test::block_on(forwarder.forward(Vec::new())).unwrap_err();
        assert!(matches!(err, ForwardError::Request(_)));
    }
}
