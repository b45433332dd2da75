//! Scripted transport for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

/// A transport that answers from a script and records every request.
///
/// Once the script runs out, every call gets the fallback answer.
pub struct MockTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    fallback: Mutex<Result<HttpResponse, TransportError>>,
    requests: Mutex<Vec<HttpRequest>>,
    latency: Duration,
}

impl MockTransport {
    /// Always answer 200.
    pub fn ok() -> Self {
        Self::with_fallback(Ok(HttpResponse::new(200, r#"{"success":true}"#)))
    }

    /// Always answer with `status`.
    pub fn status(status: u16) -> Self {
        Self::with_fallback(Ok(HttpResponse::new(status, "")))
    }

    /// Always fail with a connection error.
    pub fn unreachable() -> Self {
        Self::with_fallback(Err(TransportError::Connect("connection refused".into())))
    }

    fn with_fallback(fallback: Result<HttpResponse, TransportError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            requests: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Delay every answer (uses the tokio clock).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue one answer ahead of the fallback.
    pub fn push(&self, answer: Result<HttpResponse, TransportError>) {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).push_back(answer);
    }

    /// Change the fallback answer.
    pub fn set_fallback(&self, answer: Result<HttpResponse, TransportError>) {
        *self.fallback.lock().unwrap_or_else(|e| e.into_inner()) = answer;
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Requests whose URL ends with `suffix`.
    pub fn requests_to(&self, suffix: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.ends_with(suffix))
            .collect()
    }

    /// Number of requests seen.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match scripted {
            Some(answer) => answer,
            None => self.fallback.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }
}
