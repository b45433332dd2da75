//! Tracker configuration.
//!
//! A [`TrackerConfig`] is validated once when it is built or parsed, and again
//! whenever a [`ConfigPatch`] is applied. Components read it through a
//! [`SharedConfig`], taking a snapshot at the start of each cycle so a patch
//! never changes settings halfway through a flush.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::ToolType;

/// Errors raised while building, parsing or patching configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required field is empty
    #[error("missing required field: {0}")]
    Missing(&'static str),

    /// A field is outside its allowed range
    #[error("field '{field}' out of range: {value} (expected {expected})")]
    OutOfRange {
        /// Field name, as spelled in JSON
        field: &'static str,
        /// Offending value
        value: String,
        /// Allowed range
        expected: &'static str,
    },

    /// JSON parse error (includes unknown fields)
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error while reading a config file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing
    pub recovery_timeout_ms: u64,
    /// Probe calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a duration.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Which durable store backs undelivered batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Transactional store if available, else the key-value file store
    #[default]
    Auto,
    /// SQLite record store
    Sqlite,
    /// One JSON file per key
    Json,
    /// Process memory (not durable; tests and dry runs)
    Memory,
}

/// Durable storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageConfig {
    /// Persist batches that fail delivery
    pub enabled: bool,
    /// Cap on stored bytes; oldest batches are evicted past it
    pub max_bytes: u64,
    /// Scope of the store (file directory / table namespace)
    pub namespace: String,
    /// Wipe stored batches on start
    pub clear_on_start: bool,
    /// Period of the stored-batch redelivery task
    pub retry_interval_ms: u64,
    /// Backend selection
    pub backend: StorageBackend,
    /// Base directory for file-backed stores
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 10 * 1024 * 1024,
            namespace: "efficiency_tracker_data".to_string(),
            clear_on_start: false,
            retry_interval_ms: 60_000,
            backend: StorageBackend::Auto,
            path: PathBuf::from(".effm"),
        }
    }
}

impl StorageConfig {
    /// Redelivery period as a duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Which environment signals are turned into events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct CaptureConfig {
    /// Clicks, key presses, scrolls, pointer movement
    pub user_interactions: bool,
    /// Runtime errors reported by the host
    pub errors: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            user_interactions: true,
            errors: true,
        }
    }
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_health_check_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_clock_skew_ms() -> u64 {
    60_000
}

fn default_sampling_rate() -> f64 {
    1.0
}

/// Complete tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TrackerConfig {
    /// Base URL of the events API
    pub api_endpoint: String,

    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// User producing events
    pub user_id: String,

    /// Current project
    pub project_id: String,

    /// Current task
    pub task_id: String,

    /// Producing tool
    #[serde(default)]
    pub tool_type: ToolType,

    /// Client version reported in batch metadata
    #[serde(default = "default_client_version")]
    pub client_version: String,

    /// Max events per flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Periodic flush interval
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Retries after the first delivery attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay; attempt `n` waits `n * retryDelayMs`
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Hard timeout per request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Period of the background health probe
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// How far in the future a timestamp may be before it is flagged
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: u64,

    /// Probability (0-1) of keeping a high-frequency interaction signal
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Environment signal capture
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Durable storage
    #[serde(default)]
    pub storage: StorageConfig,
}

impl TrackerConfig {
    /// Start building a configuration from the required fields.
    pub fn builder(
        api_endpoint: impl Into<String>,
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> TrackerConfigBuilder {
        TrackerConfigBuilder {
            config: TrackerConfig {
                api_endpoint: api_endpoint.into(),
                api_key: None,
                user_id: user_id.into(),
                project_id: project_id.into(),
                task_id: task_id.into(),
                tool_type: ToolType::default(),
                client_version: default_client_version(),
                batch_size: default_batch_size(),
                flush_interval_ms: default_flush_interval_ms(),
                max_retries: default_max_retries(),
                retry_delay_ms: default_retry_delay_ms(),
                request_timeout_ms: default_request_timeout_ms(),
                health_check_interval_ms: default_health_check_interval_ms(),
                max_clock_skew_ms: default_max_clock_skew_ms(),
                sampling_rate: default_sampling_rate(),
                capture: CaptureConfig::default(),
                circuit_breaker: CircuitBreakerConfig::default(),
                storage: StorageConfig::default(),
            },
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: TrackerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("apiEndpoint"));
        }
        check_id("userId", &self.user_id)?;
        check_id("projectId", &self.project_id)?;
        check_id("taskId", &self.task_id)?;

        check_range("batchSize", self.batch_size as u64, 1, 1000, "1..=1000")?;
        check_range("flushIntervalMs", self.flush_interval_ms, 1_000, 300_000, "1000..=300000")?;
        check_range("maxRetries", self.max_retries as u64, 0, 10, "0..=10")?;
        check_range("retryDelayMs", self.retry_delay_ms, 100, 30_000, "100..=30000")?;
        check_range("requestTimeoutMs", self.request_timeout_ms, 100, 120_000, "100..=120000")?;
        check_range("healthCheckIntervalMs", self.health_check_interval_ms, 1_000, u64::MAX, ">= 1000")?;

        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ConfigError::OutOfRange {
                field: "samplingRate",
                value: self.sampling_rate.to_string(),
                expected: "0..=1",
            });
        }

        let cb = &self.circuit_breaker;
        check_range("circuitBreaker.failureThreshold", cb.failure_threshold as u64, 1, u64::MAX, ">= 1")?;
        check_range("circuitBreaker.recoveryTimeoutMs", cb.recovery_timeout_ms, 1, u64::MAX, ">= 1")?;
        check_range("circuitBreaker.halfOpenMaxCalls", cb.half_open_max_calls as u64, 1, u64::MAX, ">= 1")?;

        let storage = &self.storage;
        check_range("storage.maxBytes", storage.max_bytes, 1024, u64::MAX, ">= 1024")?;
        check_range("storage.retryIntervalMs", storage.retry_interval_ms, 1_000, u64::MAX, ">= 1000")?;
        if storage.namespace.trim().is_empty() {
            return Err(ConfigError::Missing("storage.namespace"));
        }

        Ok(())
    }

    /// Apply a patch, returning the validated result. `self` is unchanged.
    pub fn apply(&self, patch: &ConfigPatch) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = &patch.api_key {
            next.api_key = Some(v.clone());
        }
        if let Some(v) = &patch.user_id {
            next.user_id = v.clone();
        }
        if let Some(v) = &patch.project_id {
            next.project_id = v.clone();
        }
        if let Some(v) = &patch.task_id {
            next.task_id = v.clone();
        }
        if let Some(v) = patch.batch_size {
            next.batch_size = v;
        }
        if let Some(v) = patch.flush_interval_ms {
            next.flush_interval_ms = v;
        }
        if let Some(v) = patch.max_retries {
            next.max_retries = v;
        }
        if let Some(v) = patch.retry_delay_ms {
            next.retry_delay_ms = v;
        }
        if let Some(v) = patch.request_timeout_ms {
            next.request_timeout_ms = v;
        }
        if let Some(v) = patch.health_check_interval_ms {
            next.health_check_interval_ms = v;
        }
        if let Some(v) = patch.max_clock_skew_ms {
            next.max_clock_skew_ms = v;
        }
        if let Some(v) = patch.sampling_rate {
            next.sampling_rate = v;
        }
        if let Some(v) = &patch.capture {
            next.capture = v.clone();
        }
        if let Some(v) = &patch.circuit_breaker {
            next.circuit_breaker = v.clone();
        }
        if let Some(v) = patch.storage_max_bytes {
            next.storage.max_bytes = v;
        }
        next.validate()?;
        Ok(next)
    }

    /// Periodic flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Base retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Hard request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Health probe period.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

fn check_id(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let len = value.trim().chars().count();
    if len == 0 {
        return Err(ConfigError::Missing(field));
    }
    if len > 100 {
        return Err(ConfigError::OutOfRange {
            field,
            value: format!("{} chars", len),
            expected: "1..=100 chars",
        });
    }
    Ok(())
}

fn check_range(
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        });
    }
    Ok(())
}

/// Builder for [`TrackerConfig`].
#[derive(Debug, Clone)]
pub struct TrackerConfigBuilder {
    config: TrackerConfig,
}

impl TrackerConfigBuilder {
    /// Set the bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    /// Set the producing tool.
    pub fn with_tool_type(mut self, tool: ToolType) -> Self {
        self.config.tool_type = tool;
        self
    }

    /// Set the reported client version.
    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.config.client_version = version.into();
        self
    }

    /// Set max events per flush.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the periodic flush interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set retries after the first attempt.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the base retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the hard request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the health probe period.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the interaction sampling rate.
    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.config.sampling_rate = rate;
        self
    }

    /// Set signal capture flags.
    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.config.capture = capture;
        self
    }

    /// Set circuit breaker settings.
    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = breaker;
        self
    }

    /// Set storage settings.
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<TrackerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Partial update of a running tracker's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigPatch {
    /// New bearer token
    pub api_key: Option<String>,
    /// New user
    pub user_id: Option<String>,
    /// New project
    pub project_id: Option<String>,
    /// New task
    pub task_id: Option<String>,
    /// New batch size
    pub batch_size: Option<usize>,
    /// New flush interval
    pub flush_interval_ms: Option<u64>,
    /// New retry count
    pub max_retries: Option<u32>,
    /// New retry delay
    pub retry_delay_ms: Option<u64>,
    /// New request timeout
    pub request_timeout_ms: Option<u64>,
    /// New health probe period
    pub health_check_interval_ms: Option<u64>,
    /// New clock skew allowance
    pub max_clock_skew_ms: Option<u64>,
    /// New sampling rate
    pub sampling_rate: Option<f64>,
    /// New capture flags
    pub capture: Option<CaptureConfig>,
    /// New breaker settings
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// New storage cap
    pub storage_max_bytes: Option<u64>,
}

/// Configuration shared between pipeline components.
///
/// Readers take an `Arc` snapshot; replacing the config never mutates a
/// snapshot that is already in use.
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<RwLock<Arc<TrackerConfig>>>);

impl SharedConfig {
    /// Wrap a validated configuration.
    pub fn new(config: TrackerConfig) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(config))))
    }

    /// Current configuration.
    pub fn snapshot(&self) -> Arc<TrackerConfig> {
        let guard = self.0.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Validate and install a patched configuration.
    pub fn update(&self, patch: &ConfigPatch) -> Result<Arc<TrackerConfig>, ConfigError> {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(guard.apply(patch)?);
        *guard = Arc::clone(&next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TrackerConfigBuilder {
        TrackerConfig::builder("http://localhost:8000/api/v1", "user-1", "project-1", "task-1")
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = base().build().unwrap();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.flush_interval(), Duration::from_secs(10));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.storage.max_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = base().with_batch_size(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "batchSize", .. }));

        let err = base().with_sampling_rate(1.5).build().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "samplingRate", .. }));

        let err = base().with_retry_delay(Duration::from_millis(10)).build().unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "retryDelayMs", .. }));
    }

    #[test]
    fn test_missing_identity_rejected() {
        let err = TrackerConfig::builder("http://x", "  ", "p", "t").build().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("userId")));
    }

    #[test]
    fn test_json_rejects_unknown_fields() {
        let json = r#"{
            "apiEndpoint": "http://x",
            "userId": "u", "projectId": "p", "taskId": "t",
            "batchSize": 10,
            "bogus": true
        }"#;
        assert!(matches!(TrackerConfig::from_json_str(json), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_json_nested_options() {
        let json = r#"{
            "apiEndpoint": "http://x",
            "userId": "u", "projectId": "p", "taskId": "t",
            "toolType": "image-tool",
            "circuitBreaker": { "failureThreshold": 2 },
            "storage": { "enabled": false, "backend": "memory" }
        }"#;
        let config = TrackerConfig::from_json_str(json).unwrap();
        assert_eq!(config.tool_type, ToolType::ImageTool);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.half_open_max_calls, 3);
        assert!(!config.storage.enabled);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("effm.json");
        std::fs::write(&path, r#"{"apiEndpoint":"http://x","userId":"u","projectId":"p","taskId":"t"}"#).unwrap();
        let config = TrackerConfig::from_file(&path).unwrap();
        assert_eq!(config.api_endpoint, "http://x");
    }

    #[test]
    fn test_patch_is_validated() {
        let shared = SharedConfig::new(base().build().unwrap());
        let before = shared.snapshot();

        let bad = ConfigPatch { batch_size: Some(5000), ..Default::default() };
        assert!(shared.update(&bad).is_err());
        assert_eq!(shared.snapshot().batch_size, 100);

        let good = ConfigPatch { batch_size: Some(20), sampling_rate: Some(0.5), ..Default::default() };
        shared.update(&good).unwrap();
        assert_eq!(shared.snapshot().batch_size, 20);
        assert_eq!(shared.snapshot().sampling_rate, 0.5);
        // Earlier snapshots are unaffected.
        assert_eq!(before.batch_size, 100);
    }

    #[test]
    fn test_patch_rejects_unknown_fields() {
        let json = r#"{ "batchSize": 5, "flushEvery": 3 }"#;
        assert!(serde_json::from_str::<ConfigPatch>(json).is_err());
    }
}
