//! Integration tests for the task store over the in-memory backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use taskq::backend::{Backend, InMemoryBackend};
use taskq::config::QueueConfig;
use taskq::error::Error;
use taskq::model::*;
use taskq::store::{Store, canonical_json, hash_input};

const MAX_AGE: Duration = Duration::from_secs(60);

fn test_store() -> Store<InMemoryBackend> {
    Store::new(InMemoryBackend::new(), &QueueConfig::default())
}

async fn saved(store: &Store<InMemoryBackend>, input: Value) -> Task<Value, Value> {
    let mut task = Task::create(input);
    store.save(&mut task).await.unwrap();
    task
}

async fn finished(store: &Store<InMemoryBackend>, input: Value, output: Value) -> Task<Value, Value> {
    let mut task = saved(store, input).await;
    task.set_in_progress().unwrap();
    store.save(&mut task).await.unwrap();
    task.set_done(output).unwrap();
    store.save(&mut task).await.unwrap();
    task
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn save_then_get_round_trips() {
    let store = test_store();
    let task = finished(&store, json!({"a": [1, 2]}), json!({"sum": 3})).await;

    let loaded: Task<Value, Value> = store.get(task.id()).await.unwrap().unwrap();
    assert_eq!(loaded.id(), task.id());
    assert_eq!(loaded.status(), Status::Done);
    assert_eq!(loaded.input(), &json!({"a": [1, 2]}));
    assert_eq!(loaded.output().and_then(TaskOutput::data), Some(&json!({"sum": 3})));
    // Stored as epoch millis, so compare at that precision.
    assert_eq!(
        loaded.created_at().map(|t| t.timestamp_millis()),
        task.created_at().map(|t| t.timestamp_millis())
    );
    assert!(loaded.taken_at().is_some());
}

#[tokio::test]
async fn typed_payloads_round_trip() {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Resize {
        width: u32,
        height: u32,
    }

    let store = test_store();
    let mut task: Task<Resize, ()> = Task::create(Resize {
        width: 10,
        height: 20,
    });
    store.save(&mut task).await.unwrap();

    let loaded: Task<Resize, ()> = store.get(task.id()).await.unwrap().unwrap();
    assert_eq!(
        loaded.input(),
        &Resize {
            width: 10,
            height: 20
        }
    );
    assert!(loaded.output().is_none());
}

#[tokio::test]
async fn second_save_keeps_created_at_and_sets_updated_at() {
    let store = test_store();
    let mut task = saved(&store, json!(1)).await;
    let created = task.created_at();

    store.save(&mut task).await.unwrap();
    let loaded: Task<Value, Value> = store.get(task.id()).await.unwrap().unwrap();

    assert_eq!(
        loaded.created_at().map(|t| t.timestamp_millis()),
        created.map(|t| t.timestamp_millis())
    );
    assert!(loaded.updated_at().is_some());
}

#[tokio::test]
async fn missing_task_is_none() {
    let store = test_store();
    let loaded: Option<Task<Value, Value>> = store.get(&TaskId::from("nope")).await.unwrap();
    assert!(loaded.is_none());
}

#[tokio::test]
async fn corrupted_metadata_is_an_error() {
    let store = test_store();
    let id = TaskId::from("broken");
    store
        .backend()
        .hset_all(
            &store.data_key(&id),
            &[
                ("input", "1".to_string()),
                ("output", "null".to_string()),
                ("metadata", "{not json".to_string()),
            ],
            None,
        )
        .await
        .unwrap();

    let err = store.get::<Value, Value>(&id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidMetadata { .. }), "got {err}");
}

#[tokio::test]
async fn metadata_for_another_id_is_an_error() {
    let store = test_store();
    let task = saved(&store, json!(1)).await;
    let raw = store
        .backend()
        .hget(&store.data_key(task.id()), "metadata")
        .await
        .unwrap()
        .unwrap();

    let other = TaskId::from("other");
    store
        .backend()
        .hset_all(
            &store.data_key(&other),
            &[("input", "1".to_string()), ("metadata", raw)],
            None,
        )
        .await
        .unwrap();

    let err = store.get::<Value, Value>(&other).await.unwrap_err();
    assert!(matches!(err, Error::InvalidMetadata { .. }));
}

#[tokio::test(start_paused = true)]
async fn record_expires_after_ttl() {
    let config = QueueConfig {
        ttl: Duration::from_secs(5),
        ..QueueConfig::default()
    };
    let store = Store::new(InMemoryBackend::new(), &config);
    let mut task = saved(&store, json!(1)).await;

    tokio::time::advance(Duration::from_secs(3)).await;
    // Later saves do not refresh the TTL.
    store.save(&mut task).await.unwrap();
    assert!(store.get::<Value, Value>(task.id()).await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(store.get::<Value, Value>(task.id()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn save_after_expiry_recreates_record_with_ttl() {
    let config = QueueConfig {
        ttl: Duration::from_secs(5),
        ..QueueConfig::default()
    };
    let store = Store::new(InMemoryBackend::new(), &config);
    let mut task = saved(&store, json!("slow")).await;
    task.set_in_progress().unwrap();
    store.save(&mut task).await.unwrap();

    // The work outlives the record; the final save recreates it.
    tokio::time::advance(Duration::from_secs(6)).await;
    task.set_done(json!("late")).unwrap();
    store.save(&mut task).await.unwrap();
    let loaded: Task<Value, Value> = store.get(task.id()).await.unwrap().unwrap();
    assert_eq!(loaded.status(), Status::Done);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(store.get::<Value, Value>(task.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn huge_ttls_never_expire() {
    let config = QueueConfig {
        ttl: Duration::from_secs(u64::MAX),
        ..QueueConfig::default()
    };
    let store = Store::new(InMemoryBackend::new(), &config);
    let task = finished(&store, json!("forever"), json!(1)).await;
    assert!(store.get::<Value, Value>(task.id()).await.unwrap().is_some());

    store.create_cache_reference(&task, Duration::MAX).await;
    let hit = store.check_cache(&json!("forever"), MAX_AGE).await.unwrap();
    assert_eq!(hit.as_ref(), Some(task.id()));
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pop_is_strict_priority_then_fifo() {
    let store = test_store();
    let low1 = saved(&store, json!("low1")).await;
    let high = saved(&store, json!("high")).await;
    let low2 = saved(&store, json!("low2")).await;
    let medium = saved(&store, json!("medium")).await;

    store.push(&low1, Priority::Low).await.unwrap();
    store.push(&high, Priority::High).await.unwrap();
    store.push(&low2, Priority::Low).await.unwrap();
    store.push(&medium, Priority::Medium).await.unwrap();

    let mut order = Vec::new();
    while let Some(id) = store.pop().await.unwrap() {
        order.push(id);
    }
    assert_eq!(
        order,
        vec![
            high.id().clone(),
            medium.id().clone(),
            low1.id().clone(),
            low2.id().clone()
        ]
    );
}

#[tokio::test]
async fn pop_on_empty_queue_is_none() {
    let store = test_store();
    assert!(store.pop().await.unwrap().is_none());
}

#[tokio::test]
async fn pending_counts_each_lane() {
    let store = test_store();
    for _ in 0..2 {
        let task = saved(&store, json!(null)).await;
        store.push(&task, Priority::High).await.unwrap();
    }
    let task = saved(&store, json!(null)).await;
    store.push(&task, Priority::Low).await.unwrap();

    assert_eq!(store.pending(Priority::High).await.unwrap(), 2);
    assert_eq!(store.pending(Priority::Medium).await.unwrap(), 0);
    assert_eq!(store.pending(Priority::Low).await.unwrap(), 1);

    store.pop().await.unwrap();
    assert_eq!(store.pending(Priority::High).await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_pops_deliver_each_id_once() {
    let backend = InMemoryBackend::new();
    let config = QueueConfig::default();
    let store = Store::new(backend.handle(), &config);
    for i in 0..20 {
        let task = saved(&store, json!(i)).await;
        store.push(&task, Priority::Low).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let worker = Store::new(backend.handle(), &config);
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(id) = worker.pop().await.unwrap() {
                ids.push(id);
            }
            ids
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let total = all.len();
    all.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    all.dedup();
    assert_eq!(total, 20);
    assert_eq!(all.len(), 20);
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cache_hit_after_reference_created() {
    let store = test_store();
    let task = finished(&store, json!({"x": 1, "y": 2}), json!(3)).await;
    store.create_cache_reference(&task, MAX_AGE).await;

    // Key order does not matter.
    let hit = store
        .check_cache(&json!({"y": 2, "x": 1}), MAX_AGE)
        .await
        .unwrap();
    assert_eq!(hit.as_ref(), Some(task.id()));
}

#[tokio::test]
async fn struct_and_value_inputs_share_a_cache_entry() {
    #[derive(Serialize)]
    struct Point {
        y: i32,
        x: i32,
    }

    let store = test_store();
    let task = finished(&store, json!({"x": 1, "y": 2}), json!(3)).await;
    store.create_cache_reference(&task, MAX_AGE).await;

    let hit = store.check_cache(&Point { y: 2, x: 1 }, MAX_AGE).await.unwrap();
    assert_eq!(hit.as_ref(), Some(task.id()));
}

#[tokio::test]
async fn cache_miss_without_reference() {
    let store = test_store();
    finished(&store, json!("a"), json!("b")).await;
    assert!(store.check_cache(&json!("a"), MAX_AGE).await.unwrap().is_none());
}

#[tokio::test]
async fn cache_collision_is_a_miss() {
    let store = test_store();
    let other = finished(&store, json!({"input": "B"}), json!("result-B")).await;

    // Point the hash of input A at a task whose stored input is B.
    let hash_a = hash_input(&canonical_json(&json!({"input": "A"})).unwrap());
    store
        .backend()
        .set_ex(&store.cache_key(&hash_a), other.id().as_str(), MAX_AGE)
        .await
        .unwrap();

    let hit = store
        .check_cache(&json!({"input": "A"}), MAX_AGE)
        .await
        .unwrap();
    assert!(hit.is_none());
}

#[tokio::test]
async fn stale_cached_result_is_a_miss() {
    let store = test_store();
    let task = finished(&store, json!("old"), json!("result")).await;
    store.create_cache_reference(&task, MAX_AGE).await;

    // Rewrite the record as if it was last updated two minutes ago.
    let mut metadata = serde_json::to_value(task.metadata()).unwrap();
    let two_minutes_ago = chrono::Utc::now().timestamp_millis() - 120_000;
    metadata["createdAt"] = json!(two_minutes_ago);
    metadata["updatedAt"] = json!(two_minutes_ago);
    store
        .backend()
        .hset_all(
            &store.data_key(task.id()),
            &[("metadata", metadata.to_string())],
            None,
        )
        .await
        .unwrap();

    assert!(store.check_cache(&json!("old"), MAX_AGE).await.unwrap().is_none());
    // A looser max age still accepts it.
    let hit = store
        .check_cache(&json!("old"), Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(hit.as_ref(), Some(task.id()));
}

#[tokio::test]
async fn cache_reference_to_missing_task_is_a_miss() {
    let store = test_store();
    let hash = hash_input(&canonical_json(&json!("gone")).unwrap());
    store
        .backend()
        .set_ex(&store.cache_key(&hash), "no-such-task", MAX_AGE)
        .await
        .unwrap();

    assert!(store.check_cache(&json!("gone"), MAX_AGE).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn cache_reference_expires_after_its_ttl() {
    let store = test_store();
    let task = finished(&store, json!("short"), json!(1)).await;
    store
        .create_cache_reference(&task, Duration::from_secs(2))
        .await;

    assert!(store.check_cache(&json!("short"), MAX_AGE).await.unwrap().is_some());
    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(store.check_cache(&json!("short"), MAX_AGE).await.unwrap().is_none());
}

#[test]
fn hash_is_hex_sha256_of_canonical_json() {
    let canonical = canonical_json(&json!({"b": 1, "a": 2})).unwrap();
    assert_eq!(canonical, r#"{"a":2,"b":1}"#);
    let hash = hash_input(&canonical);
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn disposed_store_rejects_commands() {
    let store = test_store();
    store.dispose().await.unwrap();

    let err = store.pop().await.unwrap_err();
    assert!(err.to_string().contains("storage error"));
}
