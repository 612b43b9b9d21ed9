//! 管道指标端口
//!
//! 处理器与订阅循环通过该端口上报计数；默认全部为空操作，
//! 由上层接入具体的指标系统。
//!

use std::sync::atomic::{AtomicU64, Ordering};

pub trait PipelineMetrics: Send + Sync {
    fn entry_published(&self, _topic: &str) {}
    fn retry_scheduled(&self, _event_type: &str) {}
    /// 条目达到最大重试次数进入 DEAD，需要人工介入
    fn poison_event(&self, _event_type: &str) {}
    fn poison_message(&self, _topic: &str) {}
    fn duplicate_message(&self, _topic: &str) {}
    fn handler_failed(&self, _handler: &str) {}
    fn tick_failed(&self) {}
    fn leases_reclaimed(&self, _count: usize) {}
    fn entries_compacted(&self, _count: usize) {}
    /// 聚合因 DEAD 前驱而无法继续投递
    fn aggregate_blocked(&self, _aggregate_id: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl PipelineMetrics for NoopMetrics {}

/// 原子计数实现，便于测试与本地观察
#[derive(Debug, Default)]
pub struct CountingMetrics {
    published: AtomicU64,
    retries: AtomicU64,
    poison_events: AtomicU64,
    poison_messages: AtomicU64,
    duplicates: AtomicU64,
    handler_failures: AtomicU64,
    tick_failures: AtomicU64,
    reclaimed: AtomicU64,
    compacted: AtomicU64,
    blocked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub retries: u64,
    pub poison_events: u64,
    pub poison_messages: u64,
    pub duplicates: u64,
    pub handler_failures: u64,
    pub tick_failures: u64,
    pub reclaimed: u64,
    pub compacted: u64,
    pub blocked: u64,
}

impl CountingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            poison_events: self.poison_events.load(Ordering::Relaxed),
            poison_messages: self.poison_messages.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            tick_failures: self.tick_failures.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            compacted: self.compacted.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}

impl PipelineMetrics for CountingMetrics {
    fn entry_published(&self, _topic: &str) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn retry_scheduled(&self, _event_type: &str) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn poison_event(&self, _event_type: &str) {
        self.poison_events.fetch_add(1, Ordering::Relaxed);
    }

    fn poison_message(&self, _topic: &str) {
        self.poison_messages.fetch_add(1, Ordering::Relaxed);
    }

    fn duplicate_message(&self, _topic: &str) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    fn handler_failed(&self, _handler: &str) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn tick_failed(&self) {
        self.tick_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn leases_reclaimed(&self, count: usize) {
        self.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn entries_compacted(&self, count: usize) {
        self.compacted.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn aggregate_blocked(&self, _aggregate_id: &str) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }
}
