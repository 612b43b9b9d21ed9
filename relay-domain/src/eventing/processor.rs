//! Outbox 处理器（OutboxProcessor）
//!
//! 每个服务实例一个长驻循环，把 Outbox 中的条目可靠地投递到中间件：
//! 1. 回收租约过期的条目；
//! 2. 认领一批条目（空批次则休眠 `poll_interval`）；
//! 3. 按聚合分组、组内按版本升序逐条发布，组内首个失败即停止该组；
//! 4. 成功标记 PUBLISHED；失败按指数退避标记 FAILED，达到 `max_retries` 标记 DEAD；
//! 5. 被停止的组中剩余条目归还为 PENDING，不计重试。
//!
//! 多个处理器可并发运行，安全性由存储的原子认领保证。
//! 取消时当前条目完成“发布 + 标记”后退出，批次剩余条目归还。
//!
use super::{BackoffJitter, BackoffPolicy, BrokerAdapter, NoopMetrics, PipelineMetrics};
use crate::clock::{Clock, SystemClock};
use crate::error::{DomainError, DomainResult};
use crate::persist::{OutboxEntry, OutboxStore};
use bon::Builder;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// 处理器配置
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// 稳定标识，写入 `lease_owner`
    pub processor_id: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    /// 累计失败达到该次数后标记 DEAD
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// PUBLISHED 条目的保留期
    pub retention: Duration,
    /// 同一批次内并行处理的聚合组数
    pub group_concurrency: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            processor_id: format!("relay-{}", uuid::Uuid::new_v4()),
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            lease_duration: Duration::from_secs(30),
            max_retries: 10,
            backoff: BackoffPolicy::default(),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            group_concurrency: 4,
        }
    }
}

/// 单次 tick 的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reclaimed: usize,
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    pub dead: usize,
    /// 因组内前序失败或取消而归还的条目
    pub released: usize,
}

impl TickReport {
    fn merge(mut self, other: TickReport) -> Self {
        self.reclaimed += other.reclaimed;
        self.claimed += other.claimed;
        self.published += other.published;
        self.failed += other.failed;
        self.dead += other.dead;
        self.released += other.released;
        self
    }
}

#[derive(Builder)]
pub struct OutboxProcessor<S>
where
    S: OutboxStore + 'static,
{
    store: Arc<S>,
    adapter: BrokerAdapter,
    #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)]
    clock: Arc<dyn Clock>,
    #[builder(default = Arc::new(super::RandomJitter::default()) as Arc<dyn BackoffJitter>)]
    jitter: Arc<dyn BackoffJitter>,
    #[builder(default = Arc::new(NoopMetrics) as Arc<dyn PipelineMetrics>)]
    metrics: Arc<dyn PipelineMetrics>,
    #[builder(default)]
    config: ProcessorConfig,
}

impl<S> OutboxProcessor<S>
where
    S: OutboxStore + 'static,
{
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn processor_id(&self) -> &str {
        &self.config.processor_id
    }

    /// 执行一轮“回收 → 认领 → 发布 → 标记”
    ///
    /// 回收或认领时存储不可用返回错误；
    /// 单个条目的失败只影响该条目所在的聚合组。
    pub async fn tick(&self) -> DomainResult<TickReport> {
        self.tick_until(&CancellationToken::new()).await
    }

    async fn tick_until(&self, token: &CancellationToken) -> DomainResult<TickReport> {
        let now = self.clock.now();
        let reclaimed = self.store.reclaim_expired_leases(now).await?;
        if reclaimed > 0 {
            info!(count = reclaimed, "reclaimed expired outbox leases");
            self.metrics.leases_reclaimed(reclaimed);
        }

        let entries = self
            .store
            .claim_batch(
                &self.config.processor_id,
                self.config.batch_size,
                self.config.lease_duration,
                now,
            )
            .await?;

        let claimed = entries.len();
        if claimed > 0 {
            debug!(count = claimed, "claimed outbox entries");
        }

        let report = stream::iter(group_by_aggregate(entries))
            .map(|group| self.process_group(group, token))
            .buffer_unordered(self.config.group_concurrency.max(1))
            .fold(TickReport::default(), |acc, r| async move { acc.merge(r) })
            .await;

        Ok(TickReport {
            reclaimed,
            claimed,
            ..report
        })
    }

    async fn process_group(
        &self,
        group: Vec<OutboxEntry>,
        token: &CancellationToken,
    ) -> TickReport {
        let mut report = TickReport::default();
        let mut remaining = group.into_iter();

        while let Some(entry) = remaining.next() {
            if token.is_cancelled() {
                report.released += self.release(std::iter::once(entry).chain(remaining)).await;
                return report;
            }
            if entry
                .lease_expires_at
                .is_some_and(|at| self.clock.now() >= at)
            {
                warn!(
                    entry_id = %entry.id,
                    aggregate_id = %entry.aggregate_id,
                    "outbox lease expired mid-group; skipping the rest"
                );
                report.released += self.release(std::iter::once(entry).chain(remaining)).await;
                return report;
            }

            match self.adapter.publish(&entry).await {
                Ok(topic) => {
                    let marked = self
                        .store
                        .mark_published(&entry.id, self.processor_id(), self.clock.now())
                        .await;
                    match marked {
                        Ok(()) => {
                            debug!(
                                entry_id = %entry.id,
                                aggregate_id = %entry.aggregate_id,
                                event_version = entry.event_version,
                                topic = %topic,
                                "outbox entry published"
                            );
                            self.metrics.entry_published(&topic);
                            report.published += 1;
                        }
                        Err(e @ DomainError::LeaseLost { .. }) => {
                            // 条目已被其他处理器认领，剩余条目同样不再属于本处理器
                            warn!(
                                entry_id = %entry.id,
                                error = %e,
                                "outbox lease lost after publish"
                            );
                            return report;
                        }
                        Err(e) => {
                            // 已发布但未能标记：租约过期后会重发，订阅端去重
                            warn!(
                                entry_id = %entry.id,
                                error = %e,
                                "failed to mark outbox entry published"
                            );
                            report.released += self.release(remaining).await;
                            return report;
                        }
                    }
                }
                Err(e) => {
                    match self.handle_failure(&entry, &e).await {
                        Ok(true) => report.dead += 1,
                        Ok(false) => report.failed += 1,
                        Err(DomainError::LeaseLost { .. }) => return report,
                        Err(_) => {}
                    }
                    report.released += self.release(remaining).await;
                    return report;
                }
            }
        }

        report
    }

    /// 记录一次发布失败，返回条目是否进入 DEAD
    async fn handle_failure(&self, entry: &OutboxEntry, cause: &DomainError) -> DomainResult<bool> {
        let reason = cause.to_string();

        if entry.retry_count.saturating_add(1) >= self.config.max_retries {
            let poison = DomainError::PoisonEntry {
                entry_id: entry.id.clone(),
                reason: reason.clone(),
            };
            if let Err(e) = self
                .store
                .mark_dead(&entry.id, self.processor_id(), &reason)
                .await
            {
                warn!(entry_id = %entry.id, error = %e, "failed to mark outbox entry dead");
                return Err(e);
            }
            error!(
                entry_id = %entry.id,
                aggregate_id = %entry.aggregate_id,
                event_type = %entry.event_type,
                event_version = entry.event_version,
                retry_count = entry.retry_count,
                error = %poison,
                "poison outbox entry; aggregate blocked until operator action"
            );
            self.metrics.poison_event(&entry.event_type);
            self.metrics.aggregate_blocked(&entry.aggregate_id);
            return Ok(true);
        }

        let delay = self
            .jitter
            .jittered(self.config.backoff.delay(entry.retry_count));
        let next_attempt_at = saturating_add(self.clock.now(), delay);

        match self
            .store
            .mark_failed(&entry.id, self.processor_id(), &reason, next_attempt_at)
            .await
        {
            Ok(()) => {
                warn!(
                    entry_id = %entry.id,
                    aggregate_id = %entry.aggregate_id,
                    event_type = %entry.event_type,
                    retry_count = entry.retry_count + 1,
                    next_attempt_at = %next_attempt_at,
                    error = %cause,
                    "outbox publish failed; retry scheduled"
                );
                self.metrics.retry_scheduled(&entry.event_type);
                Ok(false)
            }
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "failed to mark outbox entry failed");
                Err(e)
            }
        }
    }

    async fn release(&self, entries: impl Iterator<Item = OutboxEntry>) -> usize {
        let mut released = 0;
        for entry in entries {
            match self.store.release(&entry.id, self.processor_id()).await {
                Ok(()) => released += 1,
                // 归还失败时等待租约过期
                Err(e) => warn!(entry_id = %entry.id, error = %e, "failed to release outbox entry"),
            }
        }
        released
    }

    /// 删除早于 `now - retention` 的 PUBLISHED 条目
    pub async fn compact_published(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        let horizon = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention));
        let Some(horizon) = horizon else {
            debug!(
                retention = ?self.config.retention,
                "retention reaches past the earliest time; nothing to compact"
            );
            return Ok(0);
        };
        let removed = self.store.compact(horizon).await?;
        if removed > 0 {
            info!(count = removed, horizon = %horizon, "compacted published outbox entries");
            self.metrics.entries_compacted(removed);
        }
        Ok(removed)
    }

    /// 长驻循环，直到 `token` 被取消
    pub async fn run(&self, token: CancellationToken) {
        let span = info_span!("outbox_processor", processor_id = %self.config.processor_id);

        async {
            info!(
                batch_size = self.config.batch_size,
                max_retries = self.config.max_retries,
                "outbox processor started"
            );
            let mut consecutive_failures: u32 = 0;

            while !token.is_cancelled() {
                let pause = match self.tick_until(&token).await {
                    Ok(report) => {
                        consecutive_failures = 0;
                        if report.claimed > 0 {
                            continue;
                        }
                        self.config.poll_interval
                    }
                    Err(e) => {
                        warn!(error = %e, "outbox tick failed; backing off");
                        self.metrics.tick_failed();
                        let pause = self.config.backoff.delay(consecutive_failures);
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        pause
                    }
                };

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            info!("outbox processor stopped");
        }
        .instrument(span)
        .await
    }
}

/// 溢出时取可表示的最晚时间
fn saturating_add(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// 认领结果已按 `(aggregate_id, event_version)` 排序；组内再按版本排序一次
fn group_by_aggregate(entries: Vec<OutboxEntry>) -> Vec<Vec<OutboxEntry>> {
    let mut groups: BTreeMap<String, Vec<OutboxEntry>> = BTreeMap::new();
    for entry in entries {
        groups.entry(entry.aggregate_id.clone()).or_default().push(entry);
    }
    groups
        .into_values()
        .map(|mut group| {
            group.sort_by_key(|e| e.event_version);
            group
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::eventing::{
        BrokerMessage, CountingMetrics, InMemoryBroker, MessageBroker, MessageConsumer, NoJitter,
        TopicMap,
    };
    use crate::persist::{InMemoryStore, OutboxStatus, SerializedEvent, TransactionManager};
    use async_trait::async_trait;
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use serde_json::json;

    type AfterPublish = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

    /// 每次成功发布后运行一段钩子，用来在组处理中途改变外部状态
    struct HookedBroker {
        inner: InMemoryBroker,
        after_publish: AfterPublish,
    }

    #[async_trait]
    impl MessageBroker for HookedBroker {
        async fn publish(&self, message: &BrokerMessage) -> DomainResult<()> {
            self.inner.publish(message).await?;
            (self.after_publish)().await;
            Ok(())
        }

        async fn consumer(
            &self,
            topic: &str,
            group: &str,
        ) -> DomainResult<Box<dyn MessageConsumer>> {
            self.inner.consumer(topic, group).await
        }

        async fn ping(&self) -> DomainResult<()> {
            self.inner.ping().await
        }
    }

    fn hooked(
        inner: &InMemoryBroker,
        after_publish: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Arc<dyn MessageBroker> {
        Arc::new(HookedBroker {
            inner: inner.clone(),
            after_publish: Box::new(after_publish),
        })
    }

    fn entry(aggregate_id: &str, version: usize) -> OutboxEntry {
        let event = SerializedEvent::builder()
            .event_id(uuid::Uuid::new_v4().to_string())
            .event_type("UserCreated".to_string())
            .event_version(version)
            .aggregate_id(aggregate_id.to_string())
            .aggregate_type("user".to_string())
            .occurred_at(Utc::now())
            .payload(json!({"type": "UserCreated"}))
            .build();
        OutboxEntry::pending(&event, Utc::now()).unwrap()
    }

    async fn seed(store: &InMemoryStore, entries: Vec<OutboxEntry>) {
        let mut tx = store.begin().await.unwrap();
        store.append_within(&mut tx, entries).await.unwrap();
        store.commit(tx).await.unwrap();
    }

    fn processor(
        store: &InMemoryStore,
        broker: &InMemoryBroker,
        clock: &ManualClock,
        metrics: Arc<CountingMetrics>,
    ) -> OutboxProcessor<InMemoryStore> {
        processor_on(store, Arc::new(broker.clone()), clock, metrics)
    }

    fn processor_on(
        store: &InMemoryStore,
        broker: Arc<dyn MessageBroker>,
        clock: &ManualClock,
        metrics: Arc<CountingMetrics>,
    ) -> OutboxProcessor<InMemoryStore> {
        OutboxProcessor::builder()
            .store(Arc::new(store.clone()))
            .adapter(BrokerAdapter::new(
                broker,
                TopicMap::new().route("UserCreated", "user.created"),
            ))
            .clock(Arc::new(clock.clone()))
            .jitter(Arc::new(NoJitter))
            .metrics(metrics)
            .config(ProcessorConfig {
                processor_id: "p1".into(),
                max_retries: 3,
                ..Default::default()
            })
            .build()
    }

    #[test]
    fn grouping_keeps_version_order() {
        let groups = group_by_aggregate(vec![entry("b", 1), entry("a", 2), entry("a", 1)]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].aggregate_id, "a");
        assert_eq!(
            groups[0].iter().map(|e| e.event_version).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn failure_stops_group_and_releases_successors() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new(1);
        let clock = ManualClock::default();
        let metrics = Arc::new(CountingMetrics::new());
        seed(&store, vec![entry("a", 1), entry("a", 2)]).await;

        broker.fail_next_publishes(1);
        let report = processor(&store, &broker, &clock, metrics.clone())
            .tick()
            .await
            .unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.released, 1);
        let entries = store.entries().await;
        assert_eq!(entries[0].status, OutboxStatus::Failed);
        assert_eq!(
            entries[0].next_attempt_at,
            Some(clock.now() + chrono::Duration::seconds(1))
        );
        assert_eq!(entries[1].status, OutboxStatus::Pending);
        assert_eq!(entries[1].retry_count, 0);
        assert_eq!(metrics.snapshot().retries, 1);
        assert!(broker.messages("user.created").await.is_empty());
    }

    #[tokio::test]
    async fn store_outage_fails_the_tick() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new(1);
        let clock = ManualClock::default();
        store.set_available(false);

        let err = processor(&store, &broker, &clock, Arc::new(CountingMetrics::new()))
            .tick()
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn compaction_respects_retention() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new(1);
        let clock = ManualClock::default();
        let metrics = Arc::new(CountingMetrics::new());
        seed(&store, vec![entry("a", 1)]).await;

        let p = processor(&store, &broker, &clock, metrics.clone());
        assert_eq!(p.tick().await.unwrap().published, 1);

        assert_eq!(p.compact_published(clock.now()).await.unwrap(), 0);
        let later = clock.now() + chrono::Duration::days(8);
        assert_eq!(p.compact_published(later).await.unwrap(), 1);
        assert_eq!(metrics.snapshot().compacted, 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new(1);
        let clock = ManualClock::default();
        let metrics = Arc::new(CountingMetrics::new());
        let p = Arc::new(processor(&store, &broker, &clock, metrics));
        seed(&store, vec![entry("a", 1)]).await;

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let p = p.clone();
            let token = token.clone();
            async move { p.run(token).await }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.messages("user.created").await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_mid_group_finishes_current_entry_and_releases_the_rest() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new(1);
        let clock = ManualClock::default();
        let token = CancellationToken::new();
        seed(&store, vec![entry("a", 1), entry("a", 2), entry("a", 3)]).await;

        let cancel = token.clone();
        let broker_on_cancel = hooked(&broker, move || {
            cancel.cancel();
            async {}.boxed()
        });
        let p = processor_on(
            &store,
            broker_on_cancel,
            &clock,
            Arc::new(CountingMetrics::new()),
        );

        let report = p.tick_until(&token).await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.published, 1);
        assert_eq!(report.released, 2);

        let entries = store.entries().await;
        assert_eq!(entries[0].status, OutboxStatus::Published);
        for e in &entries[1..] {
            assert_eq!(e.status, OutboxStatus::Pending);
            assert_eq!(e.retry_count, 0);
            assert!(e.lease_owner.is_none());
        }
        assert_eq!(broker.messages("user.created").await.len(), 1);
    }

    #[tokio::test]
    async fn expired_lease_stops_the_group() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new(1);
        let clock = ManualClock::default();
        seed(&store, vec![entry("a", 1), entry("a", 2)]).await;

        let ticking = clock.clone();
        let slow_broker = hooked(&broker, move || {
            ticking.advance(chrono::Duration::seconds(31));
            async {}.boxed()
        });
        let p = processor_on(&store, slow_broker, &clock, Arc::new(CountingMetrics::new()));

        let report = p.tick().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.released, 1);

        let entries = store.entries().await;
        assert_eq!(entries[0].status, OutboxStatus::Published);
        assert_eq!(entries[1].status, OutboxStatus::Pending);
        assert_eq!(broker.messages("user.created").await.len(), 1);
    }

    #[tokio::test]
    async fn stale_processor_leaves_a_taken_over_group_alone() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new(1);
        let clock = ManualClock::default();
        seed(&store, vec![entry("a", 1), entry("a", 2)]).await;

        // 发布完成前租约过期，另一处理器回收并重新认领
        let (rival_store, rival_clock) = (store.clone(), clock.clone());
        let stalled_broker = hooked(&broker, move || {
            let store = rival_store.clone();
            let clock = rival_clock.clone();
            async move {
                clock.advance(chrono::Duration::seconds(31));
                store.reclaim_expired_leases(clock.now()).await.unwrap();
                store
                    .claim_batch("p2", 10, Duration::from_secs(30), clock.now())
                    .await
                    .unwrap();
            }
            .boxed()
        });
        let p = processor_on(&store, stalled_broker, &clock, Arc::new(CountingMetrics::new()));

        let report = p.tick().await.unwrap();
        assert_eq!(report.published, 0);
        assert_eq!(report.released, 0);

        for e in store.entries().await {
            assert_eq!(e.status, OutboxStatus::InFlight);
            assert_eq!(e.lease_owner.as_deref(), Some("p2"));
        }
    }

    #[tokio::test]
    async fn oversized_retention_compacts_nothing() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new(1);
        seed(&store, vec![entry("a", 1)]).await;

        let p = OutboxProcessor::builder()
            .store(Arc::new(store.clone()))
            .adapter(BrokerAdapter::new(
                Arc::new(broker.clone()),
                TopicMap::new().route("UserCreated", "user.created"),
            ))
            .config(ProcessorConfig {
                retention: Duration::from_secs(10u64.pow(13)),
                ..Default::default()
            })
            .build();

        assert_eq!(p.tick().await.unwrap().published, 1);
        assert_eq!(p.compact_published(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.entries().await.len(), 1);
    }

    #[test]
    fn retry_time_saturates_instead_of_overflowing() {
        let now = Utc::now();
        assert_eq!(saturating_add(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            saturating_add(now, Duration::from_secs(1)),
            now + chrono::Duration::seconds(1)
        );
    }
}
