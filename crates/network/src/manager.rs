//! Batch delivery with retries, a circuit breaker and a FIFO request queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use effm_core::{Batch, Event, SharedConfig, TrackerConfig};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
use crate::transport::{HttpRequest, HttpResponse, Method, Transport, TransportError};
use crate::wire::{WireBatch, WireEvent};

/// Batch endpoint, relative to `apiEndpoint`.
pub const BATCH_PATH: &str = "/events/batch";
/// Single-event endpoint.
pub const SINGLE_PATH: &str = "/events/single";
/// Health endpoint.
pub const HEALTH_PATH: &str = "/health/";

/// Why a delivery did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    /// The breaker refused the call; nothing was sent
    #[error("service temporarily unavailable (circuit breaker {0})")]
    Unavailable(BreakerState),

    /// 4xx response; retrying would not help
    #[error("rejected by server (HTTP {status}): {message}")]
    Rejected {
        /// Status code
        status: u16,
        /// Server message
        message: String,
    },

    /// Every attempt failed with a retryable error
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last_error: String,
    },

    /// The payload could not be serialized
    #[error("could not encode payload: {0}")]
    Encode(String),
}

impl DeliveryError {
    /// Whether the server rejected the payload itself.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryError::Rejected { .. })
    }

    /// Whether the breaker turned the call away.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DeliveryError::Unavailable(_))
    }
}

/// A confirmed delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Final status code (0 when nothing needed sending)
    pub status: u16,
    /// Attempts used
    pub attempts: u32,
    /// Parsed response body (`{"raw": ...}` if not JSON)
    pub response: Value,
}

/// Outcome of a delivery.
pub type DeliveryResult = Result<Delivery, DeliveryError>;

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// 2xx within the timeout
    pub healthy: bool,
    /// Status code, if any response arrived
    pub status: Option<u16>,
    /// Round-trip time
    pub latency_ms: u64,
    /// Server time from the body, if it reported one
    pub server_time: Option<Value>,
    /// Transport error, if no response arrived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Network status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Events waiting in the request queue
    pub queue_size: usize,
    /// Whether the queue worker is running
    pub processing_queue: bool,
    /// Breaker view
    pub breaker: BreakerSnapshot,
}

/// Called with each queued event whose delivery failed.
pub type QueueFailureHandler = Arc<dyn Fn(Event, &DeliveryError) + Send + Sync>;

/// Delivers batches and single events to the events API.
pub struct NetworkManager {
    transport: Arc<dyn Transport>,
    config: SharedConfig,
    breaker: CircuitBreaker,
    queue: Mutex<VecDeque<Event>>,
    processing_queue: AtomicBool,
    on_queue_failure: Mutex<Option<QueueFailureHandler>>,
}

fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(body).unwrap_or_else(|_| serde_json::json!({ "raw": body }))
}

fn error_message(response: &HttpResponse) -> String {
    let parsed = parse_body(&response.body);
    for field in ["message", "detail", "error"] {
        match parsed.get(field) {
            Some(Value::String(s)) => return s.clone(),
            Some(v) if !v.is_null() => return v.to_string(),
            _ => {}
        }
    }
    let text: String = response.body.trim().chars().take(200).collect();
    if text.is_empty() {
        format!("HTTP {}", response.status)
    } else {
        text
    }
}

impl NetworkManager {
    /// Create a manager over `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: SharedConfig) -> Self {
        let breaker = CircuitBreaker::new(config.snapshot().circuit_breaker.clone());
        Self {
            transport,
            config,
            breaker,
            queue: Mutex::new(VecDeque::new()),
            processing_queue: AtomicBool::new(false),
            on_queue_failure: Mutex::new(None),
        }
    }

    /// The breaker guarding this manager.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Pick up breaker thresholds from the current configuration.
    pub fn reload_config(&self) {
        self.breaker
            .set_config(self.config.snapshot().circuit_breaker.clone());
    }

    fn url(config: &TrackerConfig, path: &str) -> String {
        format!(
            "{}/{}",
            config.api_endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn headers(config: &TrackerConfig) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("X-Tool-Type".to_string(), config.tool_type.to_string()),
            ("X-User-Id".to_string(), config.user_id.clone()),
            ("X-Project-Id".to_string(), config.project_id.clone()),
            ("X-Task-Id".to_string(), config.task_id.clone()),
        ];
        if let Some(key) = &config.api_key {
            headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
        }
        headers
    }

    /// Deliver a batch to `/events/batch`.
    pub async fn send_batch(&self, batch: &Batch) -> DeliveryResult {
        if batch.is_empty() {
            return Ok(Delivery {
                status: 0,
                attempts: 0,
                response: serde_json::json!({ "processed": 0, "failed": 0 }),
            });
        }
        let body = serde_json::to_string(&WireBatch::from_batch(batch))
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;
        debug!("Sending batch {} ({} events)", batch.batch_id(), batch.len());
        self.send_guarded(BATCH_PATH, body).await
    }

    /// Deliver one event to `/events/single`.
    pub async fn send_event(&self, event: &Event) -> DeliveryResult {
        let body = serde_json::to_string(&WireEvent::from_event(event))
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;
        self.send_guarded(SINGLE_PATH, body).await
    }

    async fn send_guarded(&self, path: &str, body: String) -> DeliveryResult {
        if !self.breaker.try_acquire() {
            let state = self.breaker.state();
            debug!("Circuit breaker is {}, skipping request to {}", state, path);
            return Err(DeliveryError::Unavailable(state));
        }

        let config = self.config.snapshot();
        let request = HttpRequest {
            method: Method::Post,
            url: Self::url(&config, path),
            headers: Self::headers(&config),
            body: Some(body),
        };

        let mut last_error = String::new();
        let mut attempts = 0;
        for attempt in 0..=config.max_retries {
            attempts += 1;
            debug!("POST {} (attempt {})", path, attempts);

            let outcome =
                tokio::time::timeout(config.request_timeout(), self.transport.execute(request.clone()))
                    .await
                    .unwrap_or(Err(TransportError::Timeout));

            match outcome {
                Ok(response) if response.is_success() => {
                    self.breaker.record_success();
                    return Ok(Delivery {
                        status: response.status,
                        attempts,
                        response: parse_body(&response.body),
                    });
                }
                Ok(response) => {
                    let message = error_message(&response);
                    last_error = format!("HTTP {}: {}", response.status, message);
                    if response.is_client_error() {
                        warn!("{} rejected with HTTP {}: {}", path, response.status, message);
                        self.breaker.record_failure();
                        return Err(DeliveryError::Rejected {
                            status: response.status,
                            message,
                        });
                    }
                }
                Err(e) => last_error = e.to_string(),
            }

            debug!("POST {} failed: {}", path, last_error);
            if attempt < config.max_retries {
                tokio::time::sleep(config.retry_delay() * (attempt + 1)).await;
            }
        }

        self.breaker.record_failure();
        warn!("{} failed after {} attempts: {}", path, attempts, last_error);
        Err(DeliveryError::Exhausted { attempts, last_error })
    }

    /// Probe `/health/`. Never touches the breaker.
    pub async fn health(&self) -> HealthReport {
        let config = self.config.snapshot();
        let request = HttpRequest {
            method: Method::Get,
            url: Self::url(&config, HEALTH_PATH),
            headers: Self::headers(&config),
            body: None,
        };
        let started = Instant::now();
        let outcome = tokio::time::timeout(config.request_timeout(), self.transport.execute(request))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                let body = parse_body(&response.body);
                HealthReport {
                    healthy: response.is_success(),
                    status: Some(response.status),
                    latency_ms,
                    server_time: body.get("timestamp").cloned(),
                    error: None,
                }
            }
            Err(e) => HealthReport {
                healthy: false,
                status: None,
                latency_ms,
                server_time: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Whether `/health/` answers 2xx.
    pub async fn check_health(&self) -> bool {
        self.health().await.healthy
    }

    /// Startup probe: an unhealthy service opens the breaker right away.
    pub async fn initial_health_check(&self) -> bool {
        let healthy = self.check_health().await;
        if healthy {
            info!("Events service is healthy");
        } else {
            warn!("Events service not available at startup, opening circuit breaker");
            self.breaker.force_open();
        }
        healthy
    }

    /// Periodic probe. Returns true when it observed a recovery and reset
    /// the breaker.
    pub async fn health_probe(&self) -> bool {
        let healthy = self.check_health().await;
        if healthy && !self.breaker.service_healthy() {
            info!("Events service recovered, resetting circuit breaker");
            self.breaker.reset();
            return true;
        }
        false
    }

    /// Install the handler for queued events that fail delivery.
    pub fn set_queue_failure_handler(&self, handler: QueueFailureHandler) {
        *self.lock_handler() = Some(handler);
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_handler(&self) -> std::sync::MutexGuard<'_, Option<QueueFailureHandler>> {
        self.on_queue_failure.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a single event for fire-and-forget delivery.
    ///
    /// Queued events are sent one at a time, in order. Must be called from
    /// within a tokio runtime.
    pub fn enqueue_event(self: &Arc<Self>, event: Event) {
        self.lock_queue().push_back(event);
        self.process_queue();
    }

    fn process_queue(self: &Arc<Self>) {
        if self.processing_queue.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = this.lock_queue().pop_front();
                match next {
                    Some(event) => {
                        if let Err(e) = this.send_event(&event).await {
                            debug!("Queued event {} not delivered: {}", event.event_id, e);
                            let handler = this.lock_handler().clone();
                            match handler {
                                Some(handler) => handler(event, &e),
                                None => warn!("Dropping undelivered queued event {}", event.event_id),
                            }
                        }
                    }
                    None => {
                        this.processing_queue.store(false, Ordering::Release);
                        // An enqueue may have raced with the release above.
                        if this.lock_queue().is_empty()
                            || this.processing_queue.swap(true, Ordering::AcqRel)
                        {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Remove and return everything still waiting in the queue.
    pub fn take_queue(&self) -> Vec<Event> {
        self.lock_queue().drain(..).collect()
    }

    /// Events waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    /// Status snapshot.
    pub fn status(&self) -> NetworkStatus {
        NetworkStatus {
            queue_size: self.queue_len(),
            processing_queue: self.processing_queue.load(Ordering::Acquire),
            breaker: self.breaker.snapshot(),
        }
    }
}
