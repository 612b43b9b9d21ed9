//! 运行时装配（RelayRuntime）
//!
//! 启动期探测存储与中间件，任一不可达立即失败；启动后在同一个取消令牌下运行：
//! - Outbox 处理器长驻循环；
//! - 周期压缩已发布条目；
//! - 每个订阅绑定一个消费循环。
//!
//! `RuntimeHandle` 负责关闭与等待，被丢弃时同样会发出取消。
//!
use crate::config::RelayConfig;
use crate::error::AppError;
use relay_domain::clock::{Clock, SystemClock};
use relay_domain::eventing::{
    BackoffJitter, BrokerAdapter, MessageBroker, MessageHandler, NoopMetrics, OutboxProcessor,
    PipelineMetrics, RandomJitter, SubscriberLoop, TopicMap,
};
use relay_domain::persist::{OutboxStore, TransactionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct RelayRuntime<S>
where
    S: OutboxStore + 'static,
{
    config: RelayConfig,
    store: Arc<S>,
    broker: Arc<dyn MessageBroker>,
    topics: TopicMap,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn BackoffJitter>,
    metrics: Arc<dyn PipelineMetrics>,
    bindings: Vec<(String, Arc<dyn MessageHandler>)>,
}

impl<S> RelayRuntime<S>
where
    S: OutboxStore + 'static,
{
    /// 校验配置并探测依赖
    pub async fn bootstrap(
        config: RelayConfig,
        store: Arc<S>,
        broker: Arc<dyn MessageBroker>,
    ) -> Result<Self, AppError> {
        config.validate()?;

        store.ping().await.map_err(|e| AppError::Bootstrap {
            component: "store",
            reason: e.to_string(),
        })?;
        broker.ping().await.map_err(|e| AppError::Bootstrap {
            component: "broker",
            reason: e.to_string(),
        })?;

        info!(
            processor_id = %config.processor.id,
            endpoints = ?config.broker.endpoints,
            "relay runtime bootstrapped"
        );

        Ok(Self {
            config,
            store,
            broker,
            topics: TopicMap::new(),
            clock: Arc::new(SystemClock),
            jitter: Arc::new(RandomJitter::default()),
            metrics: Arc::new(NoopMetrics),
            bindings: Vec::new(),
        })
    }

    pub fn topics(mut self, topics: TopicMap) -> Self {
        self.topics = topics;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn jitter(mut self, jitter: Arc<dyn BackoffJitter>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// 以配置中的消费组订阅 `topic`
    pub fn subscribe(mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.bindings.push((topic.into(), handler));
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn start(self) -> RuntimeHandle {
        let token = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(self.bindings.len() + 2);

        let adapter = BrokerAdapter::new(self.broker.clone(), self.topics.clone())
            .with_publish_timeout(self.config.broker.publish_timeout);

        let processor = Arc::new(
            OutboxProcessor::builder()
                .store(self.store.clone())
                .adapter(adapter.clone())
                .clock(self.clock.clone())
                .jitter(self.jitter.clone())
                .metrics(self.metrics.clone())
                .config(self.config.processor_config())
                .build(),
        );

        // 处理器（长循环）
        {
            let processor = processor.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move { processor.run(token).await }));
        }

        // 压缩（周期任务）
        {
            let clock = self.clock.clone();
            let interval = self.config.outbox.compaction_interval;

            tasks.push(spawn_periodic(token.clone(), interval, move || {
                let processor = processor.clone();
                let now = clock.now();
                async move {
                    if let Err(e) = processor.compact_published(now).await {
                        warn!(error = %e, "outbox compaction failed");
                    }
                }
            }));
        }

        // 订阅（每个绑定一个长循环）
        for (topic, handler) in self.bindings {
            let subscriber = SubscriberLoop::builder()
                .topic(topic)
                .group(self.config.subscriber.group_id.clone())
                .adapter(adapter.clone())
                .handler(handler)
                .metrics(self.metrics.clone())
                .retry_backoff(self.config.subscriber.retry_backoff)
                .build();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                subscriber.run(token).await;
            }));
        }

        info!(tasks = tasks.len(), "relay runtime started");
        RuntimeHandle { token, tasks }
    }
}

fn spawn_periodic<F, Fut>(token: CancellationToken, interval: Duration, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => f().await,
            }
        }
    })
}

/// 运行时句柄：发出关闭信号并等待所有任务退出
pub struct RuntimeHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// 等待所有任务退出；需先调用 `shutdown`（或取消令牌）
    pub async fn join(mut self) -> Result<(), AppError> {
        for task in std::mem::take(&mut self.tasks) {
            task.await?;
        }
        info!("relay runtime stopped");
        Ok(())
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
