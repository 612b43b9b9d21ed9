//! 进程内事件分发（EventDispatcher）
//!
//! 命令提交后，把已记录的事件交给本进程内注册的处理器：
//! - 同一事件类型的处理器按注册顺序依次执行（含订阅全部类型的处理器）；
//! - 单个处理器失败只记录日志与计数，不影响后续处理器，也不影响命令结果；
//! - 纯进程内调用，对外投递由 Outbox 处理器负责。
//!
use async_trait::async_trait;
use dashmap::DashMap;
use relay_domain::eventing::{NoopMetrics, PipelineMetrics};
use relay_domain::persist::SerializedEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

const ALL: &str = "*";

#[derive(Clone, Debug)]
pub enum HandledEventType {
    One(String),
    Many(Vec<String>),
    All,
}

/// 事件处理器：处理某一类型的事件
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于日志与计数）
    fn handler_name(&self) -> &str;
    /// 返回该处理器支持的事件类型
    fn handled_event_type(&self) -> HandledEventType;
    /// 处理事件
    async fn handle(&self, event: &SerializedEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct EventDispatcher {
    // 事件类型 -> (注册序号, 处理器)
    handlers: DashMap<String, Vec<(u64, Arc<dyn EventHandler>)>>,
    sequence: AtomicU64,
    metrics: Arc<dyn PipelineMetrics>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }
}

impl EventDispatcher {
    pub fn new(metrics: Arc<dyn PipelineMetrics>) -> Self {
        Self {
            handlers: DashMap::new(),
            sequence: AtomicU64::new(0),
            metrics,
        }
    }

    /// 为指定事件类型注册处理器
    pub fn register(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push((seq, handler));
    }

    /// 按处理器声明的事件类型注册
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        match handler.handled_event_type() {
            HandledEventType::All => self.register(ALL, handler),
            HandledEventType::One(t) => self.register(t, handler),
            HandledEventType::Many(ts) => {
                for t in ts {
                    self.register(t, handler.clone());
                }
            }
        }
    }

    fn matching(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut merged: Vec<(u64, Arc<dyn EventHandler>)> = Vec::new();
        for key in [event_type, ALL] {
            if let Some(list) = self.handlers.get(key) {
                merged.extend(list.iter().cloned());
            }
        }
        merged.sort_by_key(|(seq, _)| *seq);
        merged.into_iter().map(|(_, h)| h).collect()
    }

    /// 分发一组事件；处理器错误被吞掉并计数
    pub async fn dispatch(&self, events: &[SerializedEvent]) -> DispatchReport {
        let mut report = DispatchReport::default();

        for event in events {
            // 先取出快照，避免跨 await 持有 DashMap 读锁
            let handlers = self.matching(event.event_type());
            for handler in handlers {
                match handler.handle(event).await {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => {
                        warn!(
                            handler = %handler.handler_name(),
                            event_type = %event.event_type(),
                            aggregate_id = %event.aggregate_id(),
                            error = %e,
                            "event handler failed"
                        );
                        self.metrics.handler_failed(handler.handler_name());
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_domain::eventing::CountingMetrics;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        kind: HandledEventType,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn handler_name(&self) -> &str {
            &self.name
        }

        fn handled_event_type(&self) -> HandledEventType {
            self.kind.clone()
        }

        async fn handle(&self, _event: &SerializedEvent) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(())
        }
    }

    fn recorder(
        name: &str,
        kind: HandledEventType,
        fail: bool,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn EventHandler> {
        Arc::new(Recorder {
            name: name.into(),
            kind,
            fail,
            log: log.clone(),
        })
    }

    fn event(event_type: &str) -> SerializedEvent {
        SerializedEvent::builder()
            .event_id("e-1".to_string())
            .event_type(event_type.to_string())
            .event_version(1)
            .aggregate_id("u1".to_string())
            .aggregate_type("user".to_string())
            .occurred_at(Utc::now())
            .payload(json!({"type": event_type}))
            .build()
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order_and_failures_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let metrics = Arc::new(CountingMetrics::new());
        let dispatcher = EventDispatcher::new(metrics.clone());

        dispatcher.register_handler(recorder(
            "first",
            HandledEventType::One("UserCreated".into()),
            false,
            &log,
        ));
        dispatcher.register_handler(recorder("audit", HandledEventType::All, true, &log));
        dispatcher.register_handler(recorder(
            "last",
            HandledEventType::Many(vec!["UserCreated".into(), "UserRenamed".into()]),
            false,
            &log,
        ));

        let report = dispatcher.dispatch(&[event("UserCreated")]).await;
        assert_eq!(report, DispatchReport { succeeded: 2, failed: 1 });
        assert_eq!(*log.lock().unwrap(), vec!["first", "audit", "last"]);
        assert_eq!(metrics.snapshot().handler_failures, 1);

        log.lock().unwrap().clear();
        dispatcher.dispatch(&[event("RoleAssigned")]).await;
        assert_eq!(*log.lock().unwrap(), vec!["audit"]);
    }
}
