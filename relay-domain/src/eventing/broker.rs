//! 消息中间件端口（MessageBroker）
//!
//! 定义发布与按消费组拉取的最小协议：
//! - `publish`：仅在中间件确认持久接收后返回；超时或不确定结果一律视为失败；
//! - `consumer`：为 `(topic, group)` 创建消费者，位点由中间件按组保存；
//! - `MessageConsumer::next` 阻塞等待下一条消息，调用方通过 `select!` 取消；
//! - 未提交位点的消息会被重新投递（至少一次）。
//!
use crate::error::DomainResult as Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// 发往中间件的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    /// 分区键（聚合 ID），保证同一聚合落在同一分区
    pub key: String,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl BrokerMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// 消费端收到的消息及其位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message: BrokerMessage,
    pub partition: usize,
    pub offset: u64,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, message: &BrokerMessage) -> Result<()>;

    async fn consumer(&self, topic: &str, group: &str) -> Result<Box<dyn MessageConsumer>>;

    /// 可达性探测（启动期使用）
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait MessageConsumer: Send {
    /// 等待下一条消息；消费者关闭时返回 `None`
    async fn next(&mut self) -> Result<Option<ReceivedMessage>>;

    /// 提交位点：该消息及同分区更早的消息不再投递给本组
    async fn commit(&mut self, message: &ReceivedMessage) -> Result<()>;
}
