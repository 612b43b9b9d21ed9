//! 事件投递子系统（eventing）
//!
//! 把 Outbox 中已提交的事件可靠地送达中间件，并在订阅端幂等消费：
//! - `MessageBroker`/`MessageConsumer`：中间件端口，附内存实现 `InMemoryBroker`；
//! - `BrokerAdapter`：条目与消息之间的转换、主题路由、发布超时与解码校验；
//! - `OutboxProcessor`：认领、按聚合有序发布、退避重试、毒事件隔离与压缩；
//! - `SubscriberLoop`：按 `(topic, group)` 消费，依错误分类决定位点提交；
//! - `BackoffPolicy`/`BackoffJitter`、`PipelineMetrics`：退避与指标端口。
//!
//! 该模块不绑定具体传输实现，可对接任意分区式消息系统。
//!
pub mod adapter;
pub mod backoff;
pub mod broker;
pub mod broker_inmemory;
pub mod metrics;
pub mod processor;
pub mod subscriber;

pub use adapter::{BrokerAdapter, InboundEvent, TopicMap};
pub use backoff::{BackoffJitter, BackoffPolicy, NoJitter, RandomJitter};
pub use broker::{BrokerMessage, MessageBroker, MessageConsumer, ReceivedMessage};
pub use broker_inmemory::InMemoryBroker;
pub use metrics::{CountingMetrics, MetricsSnapshot, NoopMetrics, PipelineMetrics};
pub use processor::{OutboxProcessor, ProcessorConfig, TickReport};
pub use subscriber::{Delivery, IgnoreEvents, MessageHandler, SubscriberLoop, SubscriberReport};
