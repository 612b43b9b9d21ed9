//! 订阅运行时（SubscriberLoop）
//!
//! 每个 `(topic, group)` 一个消费循环：
//! 1. 取下一条消息（可被取消）；
//! 2. 解码消息头与负载，畸形消息视为毒消息：记录、计数、提交位点、继续；
//! 3. 调用绑定的处理器，按错误分类决定位点：
//!    - 可重试：不提交，退避后由中间件重新投递；
//!    - 永久失败：提交（跳过）；
//!    - 重复：等价于成功，提交；
//!    - 成功：提交。
//!
//! 处理器本身需按 `(eventType, aggregateId, eventVersion)` 幂等。
//!
use super::{
    BackoffPolicy, BrokerAdapter, InboundEvent, NoopMetrics, PipelineMetrics, ReceivedMessage,
};
use crate::error::{DomainResult, ErrorClass};
use async_trait::async_trait;
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// 订阅端消息处理器
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &InboundEvent) -> DomainResult<()>;
}

/// 有意留空的处理器：确认收到即提交位点
#[derive(Debug, Clone)]
pub struct IgnoreEvents {
    name: String,
}

impl IgnoreEvents {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl MessageHandler for IgnoreEvents {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &InboundEvent) -> DomainResult<()> {
        debug!(handler = %self.name, key = %event.natural_key(), "event ignored");
        Ok(())
    }
}

/// 单条消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Handled,
    Duplicate,
    Poison,
    /// 永久失败，跳过
    Skipped,
    /// 可重试失败，位点保持不动
    Retry,
}

impl Delivery {
    pub fn commits(&self) -> bool {
        !matches!(self, Delivery::Retry)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberReport {
    pub handled: usize,
    pub duplicates: usize,
    pub poison: usize,
    pub skipped: usize,
    pub retries: usize,
}

impl SubscriberReport {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Handled => self.handled += 1,
            Delivery::Duplicate => self.duplicates += 1,
            Delivery::Poison => self.poison += 1,
            Delivery::Skipped => self.skipped += 1,
            Delivery::Retry => self.retries += 1,
        }
    }
}

#[derive(Builder)]
pub struct SubscriberLoop {
    #[builder(into)]
    topic: String,
    #[builder(into)]
    group: String,
    adapter: BrokerAdapter,
    handler: Arc<dyn MessageHandler>,
    #[builder(default = Arc::new(NoopMetrics) as Arc<dyn PipelineMetrics>)]
    metrics: Arc<dyn PipelineMetrics>,
    /// 可重试失败后的首次退避，连续失败时翻倍
    #[builder(default = Duration::from_secs(1))]
    retry_backoff: Duration,
}

impl SubscriberLoop {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.retry_backoff, self.retry_backoff.saturating_mul(30))
    }

    /// 解码并处理一条消息，返回处理结果（不涉及位点）
    pub async fn deliver(&self, received: &ReceivedMessage) -> Delivery {
        let event = match self.adapter.decode(received) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    partition = received.partition,
                    offset = received.offset,
                    error = %e,
                    "poison message skipped"
                );
                self.metrics.poison_message(&self.topic);
                return Delivery::Poison;
            }
        };

        let key = event.natural_key();
        match self.handler.handle(&event).await {
            Ok(()) => {
                debug!(key = %key, offset = received.offset, "message handled");
                Delivery::Handled
            }
            Err(e) => match e.class() {
                ErrorClass::Duplicate => {
                    debug!(key = %key, "duplicate message acknowledged");
                    self.metrics.duplicate_message(&self.topic);
                    Delivery::Duplicate
                }
                ErrorClass::Retryable => {
                    warn!(
                        key = %key,
                        handler = %self.handler.name(),
                        error = %e,
                        "handler failed; will retry"
                    );
                    self.metrics.handler_failed(self.handler.name());
                    Delivery::Retry
                }
                ErrorClass::Permanent => {
                    warn!(
                        key = %key,
                        handler = %self.handler.name(),
                        error = %e,
                        "handler failed permanently; skipping"
                    );
                    self.metrics.handler_failed(self.handler.name());
                    Delivery::Skipped
                }
            },
        }
    }

    /// 长驻消费循环，直到 `token` 被取消或消费者关闭
    pub async fn run(&self, token: CancellationToken) -> SubscriberReport {
        let span = info_span!("subscriber", topic = %self.topic, group = %self.group);

        async {
            let mut report = SubscriberReport::default();
            let backoff = self.backoff();
            let mut failures: u32 = 0;

            let mut consumer = loop {
                match self.adapter.broker().consumer(&self.topic, &self.group).await {
                    Ok(consumer) => break consumer,
                    Err(e) => {
                        warn!(error = %e, "failed to create consumer; retrying");
                        if !pause(&token, backoff.delay(failures)).await {
                            return report;
                        }
                        failures = failures.saturating_add(1);
                    }
                }
            };
            info!(handler = %self.handler.name(), "subscriber started");

            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = consumer.next() => next,
                };

                let received = match next {
                    Ok(Some(received)) => received,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to receive message");
                        if !pause(&token, backoff.delay(failures)).await {
                            break;
                        }
                        failures = failures.saturating_add(1);
                        continue;
                    }
                };

                let delivery = self.deliver(&received).await;
                report.record(delivery);

                if delivery.commits() {
                    failures = 0;
                    if let Err(e) = consumer.commit(&received).await {
                        // 未提交的消息会被重新投递，由处理器去重
                        warn!(offset = received.offset, error = %e, "failed to commit offset");
                    }
                } else {
                    if !pause(&token, backoff.delay(failures)).await {
                        break;
                    }
                    failures = failures.saturating_add(1);
                }
            }

            info!(
                handled = report.handled,
                duplicates = report.duplicates,
                poison = report.poison,
                "subscriber stopped"
            );
            report
        }
        .instrument(span)
        .await
    }
}

/// 可取消的等待；被取消时返回 `false`
async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use crate::eventing::{CountingMetrics, InMemoryBroker, MessageBroker, TopicMap};
    use crate::persist::{OutboxEntry, SerializedEvent};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 前 `fail_first` 次返回可重试错误，之后记录成功处理的键
    #[derive(Default)]
    struct FlakyHandler {
        fail_first: usize,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn handle(&self, event: &InboundEvent) -> DomainResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(DomainError::store_unavailable("transient"));
            }
            self.seen.lock().unwrap().push(event.natural_key());
            Ok(())
        }
    }

    fn entry(version: usize) -> OutboxEntry {
        let event = SerializedEvent::builder()
            .event_id(uuid::Uuid::new_v4().to_string())
            .event_type("UserCreated".to_string())
            .event_version(version)
            .aggregate_id("u1".to_string())
            .aggregate_type("user".to_string())
            .occurred_at(Utc::now())
            .payload(json!({"type": "UserCreated"}))
            .build();
        OutboxEntry::pending(&event, Utc::now()).unwrap()
    }

    fn adapter(broker: &InMemoryBroker) -> BrokerAdapter {
        BrokerAdapter::new(
            Arc::new(broker.clone()),
            TopicMap::new().route("UserCreated", "user.created"),
        )
    }

    #[tokio::test]
    async fn retryable_failure_redelivers_then_commits() {
        let broker = InMemoryBroker::new(1);
        let adapter = adapter(&broker);
        adapter.publish(&entry(1)).await.unwrap();
        adapter.publish(&entry(2)).await.unwrap();

        let handler = Arc::new(FlakyHandler {
            fail_first: 2,
            ..Default::default()
        });
        let subscriber = Arc::new(
            SubscriberLoop::builder()
                .topic("user.created")
                .group("g")
                .adapter(adapter)
                .handler(handler.clone())
                .retry_backoff(Duration::from_millis(1))
                .build(),
        );

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let subscriber = subscriber.clone();
            let token = token.clone();
            async move { subscriber.run(token).await }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.committed_offset("g", "user.created", 0).await < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        token.cancel();
        let report = task.await.unwrap();

        assert_eq!(report.retries, 2);
        assert_eq!(report.handled, 2);
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec!["UserCreated/u1/1".to_string(), "UserCreated/u1/2".to_string()]
        );
    }

    #[tokio::test]
    async fn poison_message_is_committed_and_counted() {
        let broker = InMemoryBroker::new(1);
        let adapter = adapter(&broker);
        let mut garbage = adapter.to_message(&entry(1)).unwrap();
        garbage.value = b"{".to_vec();
        broker.publish(&garbage).await.unwrap();

        let metrics = Arc::new(CountingMetrics::new());
        let subscriber = SubscriberLoop::builder()
            .topic("user.created")
            .group("g")
            .adapter(adapter)
            .handler(Arc::new(IgnoreEvents::new("noop")))
            .metrics(metrics.clone())
            .build();

        let mut consumer = broker.consumer("user.created", "g").await.unwrap();
        let received = consumer.next().await.unwrap().unwrap();
        let delivery = subscriber.deliver(&received).await;
        assert_eq!(delivery, Delivery::Poison);
        assert!(delivery.commits());
        assert_eq!(metrics.snapshot().poison_messages, 1);
    }

    #[tokio::test]
    async fn duplicate_and_permanent_errors_commit() {
        struct Rejecting(DomainError);

        #[async_trait]
        impl MessageHandler for Rejecting {
            fn name(&self) -> &str {
                "rejecting"
            }

            async fn handle(&self, _event: &InboundEvent) -> DomainResult<()> {
                Err(match &self.0 {
                    DomainError::Duplicate { key } => DomainError::Duplicate { key: key.clone() },
                    _ => DomainError::invalid_input("bad"),
                })
            }
        }

        let broker = InMemoryBroker::new(1);
        let adapter = adapter(&broker);
        adapter.publish(&entry(1)).await.unwrap();
        let received = broker.messages("user.created").await.remove(0);

        let duplicate = SubscriberLoop::builder()
            .topic("user.created")
            .group("g")
            .adapter(adapter.clone())
            .handler(Arc::new(Rejecting(DomainError::Duplicate { key: "k".into() })))
            .build();
        assert_eq!(duplicate.deliver(&received).await, Delivery::Duplicate);

        let invalid = SubscriberLoop::builder()
            .topic("user.created")
            .group("g")
            .adapter(adapter)
            .handler(Arc::new(Rejecting(DomainError::invalid_input("bad"))))
            .build();
        let delivery = invalid.deliver(&received).await;
        assert_eq!(delivery, Delivery::Skipped);
        assert!(delivery.commits());
    }
}
