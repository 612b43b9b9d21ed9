//! 内存版消息中间件（InMemoryBroker）
//!
//! 以分区日志模拟分区式中间件，满足 `MessageBroker` 协议：
//! - 按分区键的稳定哈希选择分区，同一键始终落在同一分区、保持写入顺序；
//! - 位点按 `(group, topic)` 保存；`next` 总是返回各分区第一条未提交的消息，
//!   因此未提交的消息会被重新投递，已提交的不会；
//! - 故障注入：不可用、接下来 N 次发布失败、消息大小上限、发布延迟；
//! - 典型用途：测试环境、示例与本地开发。
//!
use crate::error::{DomainError, DomainResult as Result};
use crate::eventing::{BrokerMessage, MessageBroker, MessageConsumer, ReceivedMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<BrokerMessage>>>,
    // (group, topic) -> 每个分区下一条待消费的位点
    committed: HashMap<(String, String), Vec<u64>>,
    publish_delay: Option<Duration>,
    max_message_bytes: Option<usize>,
}

struct Inner {
    partitions: usize,
    state: Mutex<State>,
    notify: Notify,
    unavailable: AtomicBool,
    failing_publishes: AtomicUsize,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(4)
    }
}

impl InMemoryBroker {
    /// 创建内存中间件，每个主题 `partitions` 个分区（至少 1 个）
    pub fn new(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                unavailable: AtomicBool::new(false),
                failing_publishes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.inner.partitions
    }

    /// 分区键到分区号的稳定映射
    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as usize
    }

    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// 接下来 `n` 次发布返回 `BrokerUnavailable`
    pub fn fail_next_publishes(&self, n: usize) {
        self.inner.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// 超过上限的消息被拒收（`BrokerRejected`）
    pub async fn set_max_message_bytes(&self, limit: Option<usize>) {
        self.inner.state.lock().await.max_message_bytes = limit;
    }

    /// 每次发布在确认前等待的时长
    pub async fn set_publish_delay(&self, delay: Option<Duration>) {
        self.inner.state.lock().await.publish_delay = delay;
    }

    /// 直接写入一条消息（不经过故障注入），用于模拟上游重复投递或畸形消息
    pub async fn inject(&self, message: BrokerMessage) {
        self.append(message).await;
    }

    /// 主题下的全部消息，按分区、位点排序
    pub async fn messages(&self, topic: &str) -> Vec<ReceivedMessage> {
        let state = self.inner.state.lock().await;
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter()
                    .enumerate()
                    .map(move |(offset, message)| ReceivedMessage {
                        message: message.clone(),
                        partition,
                        offset: offset as u64,
                    })
            })
            .collect()
    }

    /// 消费组在某分区上的下一条待消费位点
    pub async fn committed_offset(&self, group: &str, topic: &str, partition: usize) -> u64 {
        self.inner
            .state
            .lock()
            .await
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .and_then(|offsets| offsets.get(partition).copied())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::broker_unavailable("in-memory broker offline"));
        }
        Ok(())
    }

    async fn append(&self, message: BrokerMessage) {
        let partition = self.partition_for(&message.key);
        let partitions = self.inner.partitions;
        {
            let mut state = self.inner.state.lock().await;
            let logs = state
                .topics
                .entry(message.topic.clone())
                .or_insert_with(|| vec![Vec::new(); partitions]);
            logs[partition].push(message);
        }
        self.inner.notify.notify_waiters();
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: &BrokerMessage) -> Result<()> {
        self.check_available()?;

        let (delay, limit) = {
            let state = self.inner.state.lock().await;
            (state.publish_delay, state.max_message_bytes)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .inner
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DomainError::broker_unavailable("injected publish failure"));
        }

        if let Some(limit) = limit.filter(|limit| message.value.len() > *limit) {
            return Err(DomainError::BrokerRejected {
                reason: format!(
                    "message of {} bytes exceeds limit of {limit}",
                    message.value.len()
                ),
            });
        }

        self.append(message.clone()).await;
        Ok(())
    }

    async fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn MessageConsumer>> {
        self.check_available()?;
        Ok(Box::new(InMemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            cursor: 0,
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
    group: String,
    // 轮询起始分区，避免某个分区独占
    cursor: usize,
}

impl InMemoryConsumer {
    fn group_key(&self) -> (String, String) {
        (self.group.clone(), self.topic.clone())
    }
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
    async fn next(&mut self) -> Result<Option<ReceivedMessage>> {
        let inner = self.broker.inner.clone();
        let partitions = inner.partitions;

        loop {
            self.broker.check_available()?;

            let notified = {
                let state = inner.state.lock().await;
                let committed = state.committed.get(&self.group_key());

                if let Some(logs) = state.topics.get(&self.topic) {
                    for step in 0..partitions {
                        let partition = (self.cursor + step) % partitions;
                        let offset = committed
                            .and_then(|c| c.get(partition).copied())
                            .unwrap_or(0);
                        if let Some(message) = logs[partition].get(offset as usize) {
                            self.cursor = (partition + 1) % partitions;
                            return Ok(Some(ReceivedMessage {
                                message: message.clone(),
                                partition,
                                offset,
                            }));
                        }
                    }
                }

                // 在持有锁时注册，保证不会错过随后的发布通知
                inner.notify.notified()
            };

            notified.await;
        }
    }

    async fn commit(&mut self, message: &ReceivedMessage) -> Result<()> {
        self.broker.check_available()?;
        let partitions = self.broker.inner.partitions;
        let mut state = self.broker.inner.state.lock().await;
        let offsets = state
            .committed
            .entry(self.group_key())
            .or_insert_with(|| vec![0; partitions]);
        if let Some(slot) = offsets.get_mut(message.partition) {
            *slot = (*slot).max(message.offset + 1);
        }
        Ok(())
    }
}
