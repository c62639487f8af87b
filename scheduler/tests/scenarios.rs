//! Literal end-to-end scenarios against the public scheduler API, driven by
//! [`MockWorkerClient`] instead of a real worker fleet.

use std::sync::Arc;
use std::time::Duration;

use scheduler::testing::MockWorkerClient;
use scheduler::{
    Config, Event, Priority, RequestSpec, SamplingParams, Scheduler, SchedulerError, WorkerRole,
    WorkerSeed,
};

fn config(max_queue_size: usize) -> Config {
    Config {
        max_queue_size,
        ..Config::default()
    }
}

fn req(priority: Priority, timeout_ms: Option<u64>) -> RequestSpec {
    RequestSpec {
        model_id: "M".to_string(),
        prompt: "hi".to_string(),
        sampling_params: SamplingParams {
            max_tokens: Some(4),
            ..SamplingParams::default()
        },
        priority,
        timeout_ms,
    }
}

fn event_kind(e: &Event) -> &'static str {
    match e {
        Event::RequestQueued { .. } => "request_queued",
        Event::PrefillStarted { .. } => "prefill_started",
        Event::PrefillCompleted { .. } => "prefill_completed",
        Event::TransferStarted { .. } => "transfer_started",
        Event::TransferCompleted { .. } => "transfer_completed",
        Event::DecodeStarted { .. } => "decode_started",
        Event::DecodeCompleted { .. } => "decode_completed",
        Event::RequestCompleted { .. } => "request_completed",
        Event::RequestFailed { .. } => "request_failed",
        Event::WorkerOnline { .. } => "worker_online",
        Event::WorkerOffline { .. } => "worker_offline",
    }
}

/// S1 - happy path.
#[tokio::test]
async fn s1_happy_path() {
    let client = Arc::new(MockWorkerClient::new());
    client.set_decode_response("ok", 4);
    let scheduler = Scheduler::new(config(10), client);
    scheduler.register_worker(WorkerSeed {
        id: "p1".to_string(),
        endpoint: "http://p1".to_string(),
        role: WorkerRole::Prefill,
        model_id: "M".to_string(),
        max_concurrency: Some(8),
    });
    scheduler.register_worker(WorkerSeed {
        id: "d1".to_string(),
        endpoint: "http://d1".to_string(),
        role: WorkerRole::Decode,
        model_id: "M".to_string(),
        max_concurrency: Some(8),
    });
    scheduler.start();

    let (_, rx) = scheduler.submit(req(Priority::Normal, None)).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("pipeline should settle")
        .unwrap()
        .expect("pipeline should succeed");
    scheduler.stop().await;

    assert_eq!(outcome.text, "ok");
    let metrics = scheduler.metrics();
    assert_eq!(metrics.total_completed, 1);
    assert_eq!(metrics.total_failed, 0);

    let kinds: Vec<&'static str> = scheduler
        .events(50)
        .iter()
        .map(event_kind)
        .filter(|k| *k != "worker_online")
        .collect();
    assert_eq!(
        kinds,
        vec![
            "request_queued",
            "prefill_started",
            "prefill_completed",
            "transfer_started",
            "transfer_completed",
            "decode_started",
            "decode_completed",
            "request_completed",
        ]
    );
}

/// S2 - queue full.
#[tokio::test]
async fn s2_queue_full() {
    let client = Arc::new(MockWorkerClient::new());
    let scheduler = Scheduler::new(config(0), client);

    let err = scheduler.submit(req(Priority::Normal, None)).unwrap_err();
    assert!(matches!(err, SchedulerError::QueueFull { size: 0, max: 0 }));

    let metrics = scheduler.metrics();
    assert_eq!(metrics.total_completed, 0);
    assert_eq!(metrics.total_failed, 0);
}

/// S3 - priority ordering: no prefill worker at submission time, then one
/// registered; dispatch must process high, then normal, then low.
#[tokio::test]
async fn s3_priority_ordering() {
    let client = Arc::new(MockWorkerClient::new());
    let scheduler = Scheduler::new(config(10), client);

    let (id_a, rx_a) = scheduler.submit(req(Priority::Low, None)).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let (id_b, rx_b) = scheduler.submit(req(Priority::Normal, None)).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let (id_c, rx_c) = scheduler.submit(req(Priority::High, None)).unwrap();

    scheduler.register_worker(WorkerSeed {
        id: "p1".to_string(),
        endpoint: "http://p1".to_string(),
        role: WorkerRole::Prefill,
        model_id: "M".to_string(),
        max_concurrency: Some(1),
    });
    scheduler.register_worker(WorkerSeed {
        id: "d1".to_string(),
        endpoint: "http://d1".to_string(),
        role: WorkerRole::Decode,
        model_id: "M".to_string(),
        max_concurrency: Some(1),
    });
    scheduler.start();

    for rx in [rx_c, rx_b, rx_a] {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("pipeline should settle")
            .unwrap()
            .expect("pipeline should succeed");
    }
    scheduler.stop().await;

    let prefill_started: Vec<String> = scheduler
        .events(50)
        .into_iter()
        .filter_map(|e| match e {
            Event::PrefillStarted { request_id, .. } => Some(request_id),
            _ => None,
        })
        .collect();
    assert_eq!(prefill_started, vec![id_c, id_b, id_a]);
}

/// S4 - transfer back-pressure: at most one transfer in flight, and
/// transfers complete in submission order under a single-slot queue.
#[tokio::test]
async fn s4_transfer_back_pressure() {
    let client = Arc::new(MockWorkerClient::new());
    client.set_transfer_delay(Duration::from_millis(50));
    let scheduler = Scheduler::new(config(10), client);
    scheduler.register_worker(WorkerSeed {
        id: "p1".to_string(),
        endpoint: "http://p1".to_string(),
        role: WorkerRole::Prefill,
        model_id: "M".to_string(),
        max_concurrency: Some(8),
    });
    scheduler.register_worker(WorkerSeed {
        id: "d1".to_string(),
        endpoint: "http://d1".to_string(),
        role: WorkerRole::Decode,
        model_id: "M".to_string(),
        max_concurrency: Some(8),
    });
    scheduler.start();

    let mut ids = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (id, rx) = scheduler.submit(req(Priority::Normal, None)).unwrap();
        ids.push(id);
        receivers.push(rx);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for rx in receivers {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("pipeline should settle")
            .unwrap()
            .expect("pipeline should succeed");
    }
    scheduler.stop().await;

    let completions: Vec<String> = scheduler
        .events(50)
        .into_iter()
        .filter_map(|e| match e {
            Event::TransferCompleted { request_id, .. } => Some(request_id),
            _ => None,
        })
        .collect();
    assert_eq!(completions, ids);
}

/// S5 - stale worker eviction.
#[tokio::test]
async fn s5_stale_worker_eviction() {
    let client = Arc::new(MockWorkerClient::new());
    client.set_unhealthy();
    let scheduler = Scheduler::new(
        Config {
            health_check_interval_ms: 20,
            ..config(10)
        },
        client,
    );
    scheduler.register_worker(WorkerSeed {
        id: "p1".to_string(),
        endpoint: "http://p1".to_string(),
        role: WorkerRole::Prefill,
        model_id: "M".to_string(),
        max_concurrency: Some(1),
    });

    scheduler.start();
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.stop().await;

    assert!(scheduler.worker_pool().available(WorkerRole::Prefill).is_empty());
    assert!(scheduler
        .events(50)
        .iter()
        .any(|e| matches!(e, Event::WorkerOffline { worker_id, .. } if worker_id == "p1")));
}

/// S6 - queue timeout: no prefill worker, short timeout, failure before
/// any prefill attempt.
#[tokio::test]
async fn s6_queue_timeout() {
    let client = Arc::new(MockWorkerClient::new());
    let scheduler = Scheduler::new(config(10), client);
    scheduler.start();

    let (_, rx) = scheduler.submit(req(Priority::Normal, Some(10))).unwrap();
    let err = tokio::time::timeout(Duration::from_millis(500), rx)
        .await
        .expect("pipeline should settle")
        .unwrap()
        .expect_err("request should time out in queue");
    scheduler.stop().await;

    assert!(matches!(err, SchedulerError::QueueTimeout { .. }));
    assert!(scheduler
        .events(50)
        .iter()
        .all(|e| !matches!(e, Event::PrefillStarted { .. })));
}
