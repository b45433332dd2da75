//! HTTP transport abstraction.
//!
//! The delivery logic only needs "send this request, give me a status and a
//! body". Keeping that behind [`Transport`] lets tests script the backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

/// A fully built request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Header name/value pairs
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: Option<String>,
}

impl HttpRequest {
    /// Look up a header value by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status and body of a completed exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Raw body
    pub body: String,
}

impl HttpResponse {
    /// Build a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 4xx
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }
}

/// Failures below the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No response within the request timeout
    #[error("request timed out")]
    Timeout,

    /// Could not reach the server
    #[error("connection failed: {0}")]
    Connect(String),

    /// Anything else
    #[error("transport error: {0}")]
    Other(String),
}

/// Sends a request and returns whatever the server answered.
///
/// Non-2xx statuses are responses, not errors.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute one request.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    /// HTTP client
    client: Client,
}

impl HttpTransport {
    /// Create a transport whose client gives up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: ClientBuilder::new()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(HttpResponse::new(204, "").is_success());
        assert!(!HttpResponse::new(302, "").is_success());
        assert!(HttpResponse::new(422, "").is_client_error());
        assert!(!HttpResponse::new(503, "").is_client_error());
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let request = HttpRequest {
            method: Method::Get,
            url: "http://localhost/health/".into(),
            headers: vec![("X-Task-Id".into(), "t1".into())],
            body: None,
        };
        assert_eq!(request.header("x-task-id"), Some("t1"));
        assert_eq!(request.header("authorization"), None);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        let transport = HttpTransport::new(Duration::from_secs(2));
        let result = transport
            .execute(HttpRequest {
                method: Method::Get,
                url: "http://127.0.0.1:9/health/".into(),
                headers: vec![],
                body: None,
            })
            .await;
        assert!(matches!(
            result,
            Err(TransportError::Connect(_)) | Err(TransportError::Other(_)) | Err(TransportError::Timeout)
        ));
    }
}
