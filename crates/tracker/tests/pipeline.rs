//! End-to-end tests of the tracker pipeline over a scripted transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use effm_core::{
    AnnotationAction, AnnotationData, AnnotationType, CircuitBreakerConfig, ConfigPatch,
    Event, EventData, EventKind, StorageBackend, StorageConfig, TaskStatus, TrackerConfig,
};
use effm_network::{HttpResponse, MockTransport, BATCH_PATH, SINGLE_PATH};
use effm_storage::{MemoryStore, StorageAdapter};
use effm_tracker::{Tracker, TrackerError};
use tokio::sync::watch;

fn config(batch_size: usize) -> TrackerConfig {
    TrackerConfig::builder("http://effm.test/api", "user-1", "project-1", "task-1")
        .with_batch_size(batch_size)
        .with_flush_interval(Duration::from_secs(300))
        .with_max_retries(0)
        .with_retry_delay(Duration::from_millis(100))
        .with_health_check_interval(Duration::from_secs(3600))
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 100,
            recovery_timeout_ms: 1,
            half_open_max_calls: 1,
        })
        .with_storage(StorageConfig {
            backend: StorageBackend::Memory,
            retry_interval_ms: 3_600_000,
            ..StorageConfig::default()
        })
        .build()
        .unwrap()
}

async fn tracker(
    config: TrackerConfig,
    transport: &Arc<MockTransport>,
    store: &Arc<MemoryStore>,
) -> Tracker {
    Tracker::builder(config)
        .with_transport(transport.clone())
        .with_storage_adapter(store.clone())
        .build()
        .await
        .unwrap()
}

fn annotation() -> AnnotationData {
    AnnotationData::new(AnnotationAction::Complete, AnnotationType::Polygon)
}

/// Number of events in each batch request, in send order.
fn batch_sizes(transport: &MockTransport) -> Vec<usize> {
    transport
        .requests_to(BATCH_PATH)
        .iter()
        .map(|r| {
            let body: serde_json::Value = serde_json::from_str(r.body.as_deref().unwrap()).unwrap();
            body["events"].as_array().unwrap().len()
        })
        .collect()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn full_batches_flush_in_background_and_stop_drains_the_rest() {
    let transport = Arc::new(MockTransport::ok());
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker(config(2), &transport, &store).await;

    tracker.start().await;
    tracker.track_annotation(annotation()).unwrap();
    wait_until(|| batch_sizes(&transport).len() == 1).await;

    tracker.track_annotation(annotation()).unwrap();
    tracker.track_annotation(annotation()).unwrap();
    wait_until(|| batch_sizes(&transport).len() == 2).await;

    tracker.stop().await;
    assert_eq!(batch_sizes(&transport), vec![2, 2, 1]);
    assert!(store.keys().await.unwrap().is_empty());

    let status = tracker.status().await;
    assert_eq!(status.counters.total_events, 5);
    assert_eq!(status.counters.delivered_events, 5);
    assert_eq!(status.counters.delivered_batches, 3);
    assert_eq!(status.buffer.buffer_size, 0);
    assert!(status.last_flush_at.is_some());
}

#[tokio::test]
async fn undelivered_events_are_stored_then_resent() {
    let transport = Arc::new(MockTransport::unreachable());
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker(config(10), &transport, &store).await;

    let errors = Arc::new(AtomicUsize::new(0));
    let seen = errors.clone();
    tracker
        .on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    tracker.start().await;
    for _ in 0..3 {
        tracker.track_annotation(annotation()).unwrap();
    }
    tracker.stop().await;

    // started + 3 annotations + paused
    assert_eq!(tracker.stored_events().await.unwrap().len(), 5);
    assert!(errors.load(Ordering::SeqCst) >= 1);
    assert_eq!(tracker.status().await.counters.lost_events, 0);

    transport.set_fallback(Ok(HttpResponse::new(200, "{}")));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let outcome = tracker.retry_stored_events().await;
    assert_eq!(outcome.events_delivered, 5);
    assert_eq!(outcome.batches_removed, 1);
    assert!(outcome.stopped_by.is_none());
    assert!(tracker.stored_events().await.unwrap().is_empty());

    // Nothing left to resend.
    let again = tracker.retry_stored_events().await;
    assert_eq!(again.events_delivered, 0);
    assert_eq!(tracker.status().await.counters.redelivered_events, 5);
}

#[tokio::test]
async fn lifecycle_events_follow_start_pause_resume_stop() {
    let transport = Arc::new(MockTransport::ok());
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker(config(50), &transport, &store).await;

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    tracker.add_listener(
        Some(EventKind::TaskStatus),
        Arc::new(move |event: &Event| {
            if let EventData::TaskStatus(data) = &event.data {
                sink.lock().unwrap().push(data.status);
            }
        }),
    );

    assert!(tracker.track_annotation(annotation()).is_none());

    tracker.start().await;
    tracker.pause().await;
    assert!(tracker.track_annotation(annotation()).is_none());
    tracker.resume().await;
    assert!(tracker.track_annotation(annotation()).is_some());
    tracker.stop().await;

    assert_eq!(
        *statuses.lock().unwrap(),
        vec![TaskStatus::Started, TaskStatus::Paused, TaskStatus::Resumed, TaskStatus::Paused]
    );
    assert!(!tracker.is_running());
}

#[tokio::test]
async fn restored_connectivity_resends_stored_batches() {
    let transport = Arc::new(MockTransport::unreachable());
    let store = Arc::new(MemoryStore::new());
    let (online, connectivity) = watch::channel(false);
    let tracker = Tracker::builder(config(10))
        .with_transport(transport.clone())
        .with_storage_adapter(store.clone())
        .with_connectivity(connectivity)
        .build()
        .await
        .unwrap();

    tracker.start().await;
    assert!(!tracker.status().await.online);
    tracker.track_annotation(annotation()).unwrap();
    tracker.force_flush().await;
    assert_eq!(tracker.stored_events().await.unwrap().len(), 2);

    transport.set_fallback(Ok(HttpResponse::new(200, "{}")));
    tokio::time::sleep(Duration::from_millis(10)).await;
    online.send(true).unwrap();

    let store_ref = store.clone();
    for _ in 0..400 {
        if store_ref.keys().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(store.keys().await.unwrap().is_empty());
    assert!(tracker.status().await.online);
    tracker.stop().await;
}

#[tokio::test]
async fn immediate_events_use_the_single_event_endpoint() {
    let transport = Arc::new(MockTransport::ok());
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker(config(50), &transport, &store).await;

    tracker.start().await;
    let id = tracker
        .send_immediately(EventData::Annotation(annotation()))
        .unwrap();
    wait_until(|| transport.requests_to(SINGLE_PATH).len() == 1).await;

    let request = &transport.requests_to(SINGLE_PATH)[0];
    let body: serde_json::Value = serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["metadata"]["eventId"], id.to_string());
    tracker.stop().await;
}

#[tokio::test]
async fn failed_immediate_events_fall_back_to_the_buffer() {
    let transport = Arc::new(MockTransport::unreachable());
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker(config(50), &transport, &store).await;

    tracker.start().await;
    tracker.send_immediately(EventData::Annotation(annotation())).unwrap();
    wait_until(|| {
        let network = tracker.network_status();
        network.queue_size == 0 && !network.processing_queue
    })
    .await;
    tracker.stop().await;

    let kinds: Vec<EventKind> = tracker
        .stored_events()
        .await
        .unwrap()
        .iter()
        .map(|e| e.data.kind())
        .collect();
    assert!(kinds.contains(&EventKind::Annotation));
}

#[tokio::test]
async fn status_hooks_fire_until_unsubscribed() {
    let transport = Arc::new(MockTransport::ok());
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker(config(50), &transport, &store).await;

    let running = Arc::new(Mutex::new(Vec::new()));
    let sink = running.clone();
    let id = tracker
        .on_status_change(move |status| sink.lock().unwrap().push(status.running))
        .unwrap();

    tracker.start().await;
    tracker.pause().await;
    assert!(tracker.unsubscribe(id));
    tracker.stop().await;

    assert_eq!(*running.lock().unwrap(), vec![true, true]);
    assert!(!tracker.unsubscribe(id));
}

#[tokio::test]
async fn panicking_flush_hook_is_reported_and_isolated() {
    let transport = Arc::new(MockTransport::ok());
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker(config(50), &transport, &store).await;

    let flushed = Arc::new(AtomicUsize::new(0));
    let count = flushed.clone();
    tracker.on_flush(|_| panic!("hook failure")).unwrap();
    tracker
        .on_flush(move |batch| {
            count.fetch_add(batch.len(), Ordering::SeqCst);
        })
        .unwrap();
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    tracker
        .on_error(move |e| sink.lock().unwrap().push(e.to_string()))
        .unwrap();

    tracker.start().await;
    tracker.track_annotation(annotation()).unwrap();
    tracker.stop().await;

    assert_eq!(flushed.load(Ordering::SeqCst), 3);
    assert!(reported.lock().unwrap().iter().any(|e| e.contains("flush hook")));
}

#[tokio::test]
async fn clear_on_start_drops_previous_batches() {
    let store = Arc::new(MemoryStore::new());

    let offline = Arc::new(MockTransport::unreachable());
    let first = tracker(config(10), &offline, &store).await;
    first.start().await;
    first.stop().await;
    assert!(!store.keys().await.unwrap().is_empty());

    let mut cfg = config(10);
    cfg.storage.clear_on_start = true;
    let second = tracker(cfg, &offline, &store).await;
    second.start().await;
    assert_eq!(second.storage_stats().await.unwrap().unwrap().batch_count, 0);
    second.clear_buffer();
    second.stop().await;
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let mut cfg = config(10);
    cfg.batch_size = 0;
    let result = Tracker::builder(cfg).build().await;
    assert!(matches!(result, Err(TrackerError::Config(_))));
}

#[tokio::test]
async fn config_updates_apply_to_the_next_flush() {
    let transport = Arc::new(MockTransport::ok());
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker(config(50), &transport, &store).await;

    tracker.start().await;
    tracker
        .update_config(ConfigPatch {
            batch_size: Some(2),
            ..ConfigPatch::default()
        })
        .await
        .unwrap();
    assert_eq!(tracker.config().batch_size, 2);

    tracker.track_annotation(annotation()).unwrap();
    wait_until(|| batch_sizes(&transport).len() == 1).await;
    assert_eq!(batch_sizes(&transport), vec![2]);

    let rejected = tracker
        .update_config(ConfigPatch {
            sampling_rate: Some(2.0),
            ..ConfigPatch::default()
        })
        .await;
    assert!(rejected.is_err());
    assert_eq!(tracker.config().sampling_rate, 1.0);
    tracker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_a_flush_already_on_the_wire() {
    let transport = Arc::new(MockTransport::ok().with_latency(Duration::from_secs(5)));
    let store = Arc::new(MemoryStore::new());
    let mut config = config(50);
    config.flush_interval_ms = 1_000;
    config.request_timeout_ms = 10_000;
    let tracker = tracker(config, &transport, &store).await;

    tracker.start().await;
    tracker.track_annotation(annotation()).unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(tracker.status().await.buffer.flushing);

    tracker.stop().await;

    // started + annotation from the timer flush, then paused
    assert_eq!(batch_sizes(&transport), vec![2, 1]);
    let counters = tracker.status().await.counters;
    assert_eq!(counters.delivered_events, 3);
    assert_eq!(counters.lost_events, 0);
    assert!(store.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn unsubscribing_a_flush_hook_keeps_error_hooks() {
    let transport = Arc::new(MockTransport::ok());
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker(config(50), &transport, &store).await;

    let errors = Arc::new(AtomicUsize::new(0));
    let seen = errors.clone();
    tracker
        .on_error(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let flushes = Arc::new(AtomicUsize::new(0));
    let count = flushes.clone();
    let flush_id = tracker
        .on_flush(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(tracker.unsubscribe(flush_id));
    assert!(!tracker.unsubscribe(flush_id));

    tracker.start().await;
    let mut fields = effm_core::Metadata::new();
    fields.insert("status".into(), "exploded".into());
    assert!(tracker.track_raw(EventKind::TaskStatus, fields).is_none());
    tracker.stop().await;

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(flushes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn raw_events_are_tracked_or_reported() {
    let transport = Arc::new(MockTransport::ok());
    let store = Arc::new(MemoryStore::new());
    let tracker = tracker(config(50), &transport, &store).await;

    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    tracker
        .on_error(move |e| sink.lock().unwrap().push(e.to_string()))
        .unwrap();

    tracker.start().await;
    let mut bad = effm_core::Metadata::new();
    bad.insert("status".into(), "exploded".into());
    assert!(tracker.track_raw(EventKind::TaskStatus, bad).is_none());

    let mut good = effm_core::Metadata::new();
    good.insert("status".into(), "completed".into());
    good.insert("timeSpent".into(), 1200.into());
    assert!(tracker.track_raw(EventKind::TaskStatus, good).is_some());
    tracker.stop().await;

    assert_eq!(reported.lock().unwrap().len(), 1);
    // started + completed + paused
    assert_eq!(tracker.status().await.counters.delivered_events, 3);
    assert_eq!(tracker.status().await.counters.invalid_events, 1);
}
