mod common;

use async_trait::async_trait;
use common::{FailingStore, ScriptedInvoker, ScriptedProbe, is_valid_lifecycle};
use fleetwatch::{
    ChunkStatus, FleetError, FleetStore, FleetWatcher, Invoker, MemoryStore, OperationStatus,
    Result, Target, TargetConfig, WatcherConfig,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn watcher_with(
    config: WatcherConfig,
    invoker: Arc<dyn Invoker>,
    store: Arc<dyn FleetStore>,
) -> FleetWatcher {
    FleetWatcher::builder(config)
        .probe(Arc::new(ScriptedProbe::new()))
        .invoker(invoker)
        .store(store)
        .build()
        .unwrap()
}

fn fast_config() -> WatcherConfig {
    WatcherConfig::new().chunk_pause(Duration::ZERO)
}

fn assert_gap(actual: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    assert!(
        actual >= expected && actual < expected + Duration::from_millis(10),
        "expected a gap of ~{:?}, got {:?}",
        expected,
        actual
    );
}

/// Echoes a page of ids for a `{limit, offset}` payload.
fn page_responder(payload: &Value) -> std::result::Result<Value, String> {
    let limit = payload["limit"].as_u64().unwrap_or(0);
    let offset = payload["offset"].as_u64().unwrap_or(0);
    let results: Vec<Value> = (offset..offset + limit).map(|id| json!({ "id": id })).collect();
    Ok(json!({ "results": results, "total": limit }))
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_exponentially_then_exhaust() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.fail_times("query", 3, "connection refused");
    invoker.ok("query", json!({ "rows": 1 }));
    let store = Arc::new(MemoryStore::new());
    let watcher = watcher_with(fast_config(), invoker.clone(), store.clone());
    watcher
        .reconcile(&[TargetConfig::http("db", "http://db.local")
            .max_retries(3)
            .base_delay(Duration::from_millis(1000))
            .backoff_multiplier(2.0)])
        .await
        .unwrap();

    let err = watcher
        .execute_supervised("db", "query", json!({}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        FleetError::Exhausted {
            target: "db".to_string(),
            operation: "query".to_string(),
            attempts: 3,
            last_error: "connection refused".to_string(),
        }
    );

    let calls = invoker.calls();
    assert_eq!(calls.len(), 3, "a 4th attempt must never be made");
    assert_gap(calls[1].at - calls[0].at, 1000);
    assert_gap(calls[2].at - calls[1].at, 2000);

    let record = watcher.recent_operations(1).await.remove(0);
    assert_eq!(record.status, OperationStatus::Failed);
    assert_eq!(record.attempt, 3);
    assert_eq!(record.max_attempts, 3);
    assert_eq!(record.error.as_deref(), Some("connection refused"));

    let history = watcher.operation_history(&record.id).await.unwrap();
    assert_eq!(
        history,
        vec![
            OperationStatus::Pending,
            OperationStatus::InProgress,
            OperationStatus::Retrying,
            OperationStatus::InProgress,
            OperationStatus::Retrying,
            OperationStatus::InProgress,
            OperationStatus::Failed,
        ]
    );
    assert!(is_valid_lifecycle(&history));
}

#[tokio::test(start_paused = true)]
async fn backoff_is_capped_at_max_delay() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.fail_times("sync", 5, "busy");
    let watcher = watcher_with(fast_config(), invoker.clone(), Arc::new(MemoryStore::new()));
    watcher
        .reconcile(&[TargetConfig::http("storage", "http://storage.local")
            .max_retries(5)
            .base_delay(Duration::from_millis(1000))
            .backoff_multiplier(10.0)
            .max_delay(Duration::from_millis(5000))])
        .await
        .unwrap();

    let err = watcher.execute_supervised("storage", "sync", json!({})).await.unwrap_err();
    assert!(matches!(err, FleetError::Exhausted { attempts: 5, .. }));

    let calls = invoker.calls();
    let expected = [1000, 5000, 5000, 5000];
    for (pair, expected_ms) in calls.windows(2).zip(expected) {
        assert_gap(pair[1].at - pair[0].at, expected_ms);
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failure_then_success_completes() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.fail("query", "timeout");
    invoker.ok("query", json!({ "rows": [1, 2] }));
    let watcher = watcher_with(fast_config(), invoker.clone(), Arc::new(MemoryStore::new()));
    watcher
        .reconcile(&[TargetConfig::http("db", "http://db.local").base_delay(Duration::from_millis(50))])
        .await
        .unwrap();

    let value = watcher.execute_supervised("db", "query", json!({ "sql": "select 1" })).await.unwrap();
    assert_eq!(value, json!({ "rows": [1, 2] }));

    let record = watcher.recent_operations(10).await.remove(0);
    assert_eq!(record.status, OperationStatus::Completed);
    assert_eq!(record.attempt, 2);
    assert_eq!(record.result, Some(json!({ "rows": [1, 2] })));
    assert_eq!(record.error, None);
    assert_eq!(record.payload, json!({ "sql": "select 1" }));

    let history = watcher.operation_history(&record.id).await.unwrap();
    assert!(is_valid_lifecycle(&history));
    assert_eq!(history.last(), Some(&OperationStatus::Completed));
}

#[tokio::test]
async fn unknown_target_is_rejected_without_a_record() {
    let invoker = Arc::new(ScriptedInvoker::new());
    let watcher = watcher_with(fast_config(), invoker.clone(), Arc::new(MemoryStore::new()));

    let err = watcher.execute_supervised("ghost", "query", json!({})).await.unwrap_err();
    assert_eq!(err, FleetError::UnknownTarget("ghost".to_string()));
    assert!(watcher.recent_operations(10).await.is_empty());
    assert_eq!(invoker.call_count(), 0);
}

#[tokio::test]
async fn critical_operation_is_paged_and_merged() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.respond_with(page_responder);
    let watcher = watcher_with(fast_config(), invoker.clone(), Arc::new(MemoryStore::new()));
    watcher
        .reconcile(&[TargetConfig::http("d1-database", "http://d1.local").critical("search_clients")])
        .await
        .unwrap();

    let merged = watcher
        .execute_supervised("d1-database", "search_clients", json!({ "query": "smith", "limit": 25 }))
        .await
        .unwrap();
    assert_eq!(merged["total"], json!(25));
    assert_eq!(merged["results"].as_array().unwrap().len(), 25);
    assert_eq!(merged["chunked"], json!(true));

    let pages: Vec<(u64, u64)> = invoker
        .calls()
        .iter()
        .map(|call| {
            assert_eq!(call.payload["query"], json!("smith"));
            (call.payload["offset"].as_u64().unwrap(), call.payload["limit"].as_u64().unwrap())
        })
        .collect();
    assert_eq!(pages, vec![(0, 10), (10, 10), (20, 5)]);

    let record = watcher.recent_operations(1).await.remove(0);
    assert!(record.chunked);
    let chunks = watcher.operation_chunks(&record.id).await.unwrap();
    assert_eq!(chunks.len(), 3);
    for (index, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, index);
        assert_eq!(chunk.status, ChunkStatus::Completed);
        assert_eq!(chunk.id, format!("{}-a1-c{}", record.id, index));
    }
}

#[tokio::test]
async fn oversized_or_overflowing_page_requests_are_rejected_up_front() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.respond_with(page_responder);
    let watcher = watcher_with(
        fast_config().max_chunks(5),
        invoker.clone(),
        Arc::new(MemoryStore::new()),
    );
    watcher
        .reconcile(&[TargetConfig::http("d1-database", "http://d1.local").critical("search_clients")])
        .await
        .unwrap();

    let overflow = watcher
        .execute_supervised(
            "d1-database",
            "search_clients",
            json!({ "limit": 20, "offset": u64::MAX }),
        )
        .await
        .unwrap_err();
    assert!(matches!(overflow, FleetError::InvalidPayload(_)), "{:?}", overflow);

    let oversized = watcher
        .execute("d1-database", "search_clients", json!({ "limit": 5_000_000 }))
        .await
        .unwrap_err();
    assert!(matches!(oversized, FleetError::InvalidPayload(_)), "{:?}", oversized);

    assert_eq!(invoker.call_count(), 0);
    assert!(watcher.recent_operations(10).await.is_empty());

    let within = watcher
        .execute_supervised("d1-database", "search_clients", json!({ "limit": 50 }))
        .await
        .unwrap();
    assert_eq!(within["total"], json!(50));
    assert_eq!(invoker.call_count(), 5);
}

#[tokio::test]
async fn merged_total_matches_non_null_chunks() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.ok("search_trips", json!({ "results": [1, 2, 3], "total": 3 }));
    invoker.fail("search_trips", "upstream 502");
    invoker.ok("search_trips", json!({ "results": [4, 5], "total": 2 }));
    let watcher = watcher_with(fast_config(), invoker.clone(), Arc::new(MemoryStore::new()));
    watcher
        .reconcile(&[TargetConfig::http("trips", "http://trips.local").critical("search_trips")])
        .await
        .unwrap();

    let merged = watcher
        .execute_supervised("trips", "search_trips", json!({ "limit": 30 }))
        .await
        .unwrap();
    assert_eq!(merged["total"], json!(5));
    assert_eq!(merged["results"], json!([1, 2, 3, 4, 5]));

    let record = watcher.recent_operations(1).await.remove(0);
    assert_eq!(record.status, OperationStatus::Completed);
    let statuses: Vec<ChunkStatus> = watcher
        .operation_chunks(&record.id)
        .await
        .unwrap()
        .into_iter()
        .map(|chunk| chunk.status)
        .collect();
    assert_eq!(
        statuses,
        vec![ChunkStatus::Completed, ChunkStatus::Failed, ChunkStatus::Completed]
    );
}

#[tokio::test(start_paused = true)]
async fn first_chunk_failure_fails_the_attempt_and_retries_every_chunk() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.fail("search_clients", "cold start");
    invoker.respond_with(page_responder);
    let watcher = watcher_with(fast_config(), invoker.clone(), Arc::new(MemoryStore::new()));
    watcher
        .reconcile(&[TargetConfig::http("d1-database", "http://d1.local")
            .critical("search_clients")
            .max_retries(2)
            .base_delay(Duration::from_millis(100))])
        .await
        .unwrap();

    let merged = watcher
        .execute_supervised("d1-database", "search_clients", json!({ "limit": 30 }))
        .await
        .unwrap();
    assert_eq!(merged["total"], json!(30));
    assert_eq!(invoker.call_count(), 4);

    let record = watcher.recent_operations(1).await.remove(0);
    assert_eq!(record.attempt, 2);
    let chunks = watcher.operation_chunks(&record.id).await.unwrap();
    let layout: Vec<(u32, usize, ChunkStatus)> = chunks
        .iter()
        .map(|chunk| (chunk.attempt, chunk.chunk_index, chunk.status))
        .collect();
    assert_eq!(
        layout,
        vec![
            (1, 0, ChunkStatus::Failed),
            (2, 0, ChunkStatus::Completed),
            (2, 1, ChunkStatus::Completed),
            (2, 2, ChunkStatus::Completed),
        ]
    );
}

#[tokio::test]
async fn majority_of_failed_chunks_fails_the_operation() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.ok("search_clients", json!({ "results": [1], "total": 1 }));
    invoker.fail("search_clients", "quota");
    invoker.fail("search_clients", "quota");
    let watcher = watcher_with(fast_config(), invoker.clone(), Arc::new(MemoryStore::new()));
    watcher
        .reconcile(&[TargetConfig::http("d1-database", "http://d1.local")
            .critical("search_clients")
            .max_retries(1)])
        .await
        .unwrap();

    let err = watcher
        .execute_supervised("d1-database", "search_clients", json!({ "limit": 30 }))
        .await
        .unwrap_err();
    match err {
        FleetError::Exhausted {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(attempts, 1);
            assert_eq!(last_error, "2 of 3 chunks failed");
        }
        other => panic!("expected Exhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn non_critical_operation_is_not_chunked() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.ok("search_clients", json!({ "results": [], "total": 0 }));
    let watcher = watcher_with(fast_config(), invoker.clone(), Arc::new(MemoryStore::new()));
    watcher
        .reconcile(&[TargetConfig::http("d1-database", "http://d1.local")])
        .await
        .unwrap();

    let payload = json!({ "limit": 25 });
    watcher
        .execute_supervised("d1-database", "search_clients", payload.clone())
        .await
        .unwrap();
    let calls = invoker.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].payload, payload);
    assert!(!watcher.recent_operations(1).await[0].chunked);
}

struct SlowInvoker;

#[async_trait]
impl Invoker for SlowInvoker {
    async fn invoke(&self, _target: &Target, _operation: &str, _payload: &Value) -> Result<Value> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(json!({}))
    }
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_counts_as_a_failed_attempt() {
    let watcher = watcher_with(fast_config(), Arc::new(SlowInvoker), Arc::new(MemoryStore::new()));
    watcher
        .reconcile(&[TargetConfig::http("db", "http://db.local")
            .max_retries(2)
            .base_delay(Duration::from_millis(10))
            .attempt_timeout(Duration::from_millis(100))])
        .await
        .unwrap();

    let err = watcher.execute_supervised("db", "query", json!({})).await.unwrap_err();
    assert_eq!(
        err,
        FleetError::Exhausted {
            target: "db".to_string(),
            operation: "query".to_string(),
            attempts: 2,
            last_error: "attempt timed out after 100ms".to_string(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn backoff_of_one_operation_does_not_block_another() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.fail("slow_op", "busy");
    invoker.ok("slow_op", json!("late"));
    invoker.ok("fast_op", json!("early"));
    let watcher = Arc::new(watcher_with(fast_config(), invoker.clone(), Arc::new(MemoryStore::new())));
    watcher
        .reconcile(&[
            TargetConfig::http("slow", "http://slow.local").base_delay(Duration::from_secs(10)),
            TargetConfig::http("fast", "http://fast.local"),
        ])
        .await
        .unwrap();

    let started = Instant::now();
    let background = {
        let watcher = watcher.clone();
        tokio::spawn(async move { watcher.execute_supervised("slow", "slow_op", json!({})).await })
    };
    tokio::task::yield_now().await;

    let fast = watcher.execute_supervised("fast", "fast_op", json!({})).await.unwrap();
    assert_eq!(fast, json!("early"));
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(background.await.unwrap().unwrap(), json!("late"));
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn store_outage_does_not_break_the_lifecycle() {
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.fail("query", "reset by peer");
    invoker.ok("query", json!({ "ok": true }));
    let store = Arc::new(FailingStore::new());
    let watcher = watcher_with(fast_config(), invoker.clone(), store.clone());
    watcher
        .reconcile(&[TargetConfig::http("db", "http://db.local").base_delay(Duration::from_millis(10))])
        .await
        .unwrap();

    let value = watcher.execute_supervised("db", "query", json!({})).await.unwrap();
    assert_eq!(value, json!({ "ok": true }));
    assert!(store.attempted_writes() >= 5);

    let recent = watcher.recent_operations(5).await;
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].status, OperationStatus::Completed);
    assert_eq!(recent[0].attempt, 2);
    assert_eq!(recent[0].result, Some(json!({ "ok": true })));

    let by_id = watcher.operation(&recent[0].id).await.unwrap();
    assert_eq!(by_id.status, OperationStatus::Completed);
}
