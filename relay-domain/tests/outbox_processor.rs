use chrono::{Duration as ChronoDuration, Utc};
use relay_domain::clock::{Clock, ManualClock};
use relay_domain::eventing::{
    BrokerAdapter, CountingMetrics, InMemoryBroker, NoJitter, OutboxProcessor, ProcessorConfig,
    TopicMap,
};
use relay_domain::persist::{
    InMemoryStore, OutboxEntry, OutboxStatus, OutboxStore, SerializedEvent, TransactionManager,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "user.created";

fn event(aggregate_id: &str, version: usize, padding: usize) -> OutboxEntry {
    let event = SerializedEvent::builder()
        .event_id(uuid::Uuid::new_v4().to_string())
        .event_type("UserCreated".to_string())
        .event_version(version)
        .aggregate_id(aggregate_id.to_string())
        .aggregate_type("user".to_string())
        .occurred_at(Utc::now())
        .payload(json!({"type": "UserCreated", "bio": "x".repeat(padding)}))
        .build();
    OutboxEntry::pending(&event, Utc::now()).unwrap()
}

async fn seed(store: &InMemoryStore, entries: Vec<OutboxEntry>) {
    let mut tx = store.begin().await.unwrap();
    store.append_within(&mut tx, entries).await.unwrap();
    store.commit(tx).await.unwrap();
}

fn processor(
    id: &str,
    store: &InMemoryStore,
    broker: &InMemoryBroker,
    clock: &ManualClock,
    metrics: Arc<CountingMetrics>,
    batch_size: usize,
) -> OutboxProcessor<InMemoryStore> {
    OutboxProcessor::builder()
        .store(Arc::new(store.clone()))
        .adapter(BrokerAdapter::new(
            Arc::new(broker.clone()),
            TopicMap::new().route("UserCreated", TOPIC),
        ))
        .clock(Arc::new(clock.clone()))
        .jitter(Arc::new(NoJitter))
        .metrics(metrics)
        .config(ProcessorConfig {
            processor_id: id.to_string(),
            batch_size,
            ..Default::default()
        })
        .build()
}

#[tokio::test]
async fn broker_outage_retries_with_exponential_backoff() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new(2);
    let clock = ManualClock::default();
    let metrics = Arc::new(CountingMetrics::new());
    let p = processor("p1", &store, &broker, &clock, metrics.clone(), 10);

    let entry = event("u1", 1, 0);
    let id = entry.id.clone();
    seed(&store, vec![entry]).await;
    broker.fail_next_publishes(3);

    let mut expected_delay = 1;
    for retry in 1..=3u32 {
        let start = clock.now();
        let report = p.tick().await.unwrap();
        assert_eq!(report.failed, 1);

        let e = store.get(&id).await.unwrap().unwrap();
        assert_eq!(e.status, OutboxStatus::Failed);
        assert_eq!(e.retry_count, retry);
        assert_eq!(
            e.next_attempt_at,
            Some(start + ChronoDuration::seconds(expected_delay))
        );

        // 未到重试时间不会被再次认领
        assert_eq!(p.tick().await.unwrap().claimed, 0);
        clock.advance(ChronoDuration::seconds(expected_delay));
        expected_delay *= 2;
    }

    let report = p.tick().await.unwrap();
    assert_eq!(report.published, 1);
    let e = store.get(&id).await.unwrap().unwrap();
    assert_eq!(e.status, OutboxStatus::Published);
    assert_eq!(e.published_at, Some(clock.now()));
    assert_eq!(broker.messages(TOPIC).await.len(), 1);
    assert_eq!(metrics.snapshot().retries, 3);
}

#[tokio::test]
async fn crashed_processor_lease_is_reclaimed() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new(2);
    let clock = ManualClock::default();
    seed(&store, vec![event("u1", 1, 0)]).await;

    // p1 认领后消失
    let claimed = store
        .claim_batch("p1", 10, Duration::from_secs(30), clock.now())
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    let p2 = processor(
        "p2",
        &store,
        &broker,
        &clock,
        Arc::new(CountingMetrics::new()),
        10,
    );
    let report = p2.tick().await.unwrap();
    assert_eq!(report.reclaimed, 0);
    assert_eq!(report.claimed, 0);

    clock.advance(ChronoDuration::seconds(31));
    let report = p2.tick().await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.published, 1);

    let e = store.get(&claimed[0].id).await.unwrap().unwrap();
    assert_eq!(e.status, OutboxStatus::Published);
    assert_eq!(e.retry_count, 0);
}

#[tokio::test]
async fn poison_entry_goes_dead_and_blocks_later_versions() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new(2);
    broker.set_max_message_bytes(Some(1024)).await;
    let clock = ManualClock::default();
    let metrics = Arc::new(CountingMetrics::new());
    let p = processor("p1", &store, &broker, &clock, metrics.clone(), 10);

    let oversize = event("u1", 1, 4096);
    let successor = event("u1", 2, 0);
    let sibling = event("u2", 1, 0);
    let (oversize_id, successor_id) = (oversize.id.clone(), successor.id.clone());
    seed(&store, vec![oversize, successor, sibling]).await;

    for _ in 0..10 {
        p.tick().await.unwrap();
        clock.advance(ChronoDuration::seconds(600));
    }

    let dead = store.get(&oversize_id).await.unwrap().unwrap();
    assert_eq!(dead.status, OutboxStatus::Dead);
    assert_eq!(dead.retry_count, 9);
    assert!(dead.last_error.unwrap().contains("exceeds limit"));

    let blocked = store.get(&successor_id).await.unwrap().unwrap();
    assert_eq!(blocked.status, OutboxStatus::Pending);
    assert_eq!(blocked.retry_count, 0);

    // 后续 tick 依旧不会越过 DEAD 前驱
    let report = p.tick().await.unwrap();
    assert_eq!(report.claimed, 0);

    let published: Vec<String> = broker
        .messages(TOPIC)
        .await
        .into_iter()
        .map(|m| m.message.key)
        .collect();
    assert_eq!(published, vec!["u2".to_string()]);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.poison_events, 1);
    assert_eq!(snapshot.blocked, 1);
    assert_eq!(snapshot.retries, 9);

    let counts = store.status_counts().await.unwrap();
    assert_eq!((counts.dead, counts.pending, counts.published), (1, 1, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_processors_publish_each_entry_once_in_order() {
    const AGGREGATES: usize = 1_000;
    const VERSIONS: usize = 10;
    const TOTAL: usize = AGGREGATES * VERSIONS;

    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new(8);
    let clock = ManualClock::default();

    let entries: Vec<OutboxEntry> = (0..AGGREGATES)
        .flat_map(|a| (1..=VERSIONS).map(move |v| event(&format!("agg-{a}"), v, 0)))
        .collect();
    seed(&store, entries).await;

    let mut tasks = Vec::new();
    for id in ["p1", "p2"] {
        let p = processor(
            id,
            &store,
            &broker,
            &clock,
            Arc::new(CountingMetrics::new()),
            50,
        );
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut published = 0;
            loop {
                let report = p.tick().await.unwrap();
                published += report.published;
                if report.claimed == 0 {
                    if store.status_counts().await.unwrap().outstanding() == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
            published
        }));
    }

    let mut published = 0;
    for task in tasks {
        published += tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(published, TOTAL);

    let messages = broker.messages(TOPIC).await;
    assert_eq!(messages.len(), TOTAL);

    let mut ids = HashSet::new();
    let mut last_version: HashMap<String, usize> = HashMap::new();
    for m in &messages {
        assert!(ids.insert(m.message.header("outboxEntryId").unwrap().to_string()));
        let version: usize = m.message.header("eventVersion").unwrap().parse().unwrap();
        let previous = last_version.insert(m.message.key.clone(), version).unwrap_or(0);
        assert_eq!(version, previous + 1, "out of order for {}", m.message.key);
    }
    assert_eq!(store.status_counts().await.unwrap().published, TOTAL);
}
