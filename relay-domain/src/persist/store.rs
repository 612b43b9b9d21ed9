//! 存储协议
//!
//! 所有存储协议共享 [`TransactionManager`] 的事务类型 `Tx`，因此同一个后端可以让
//! 聚合状态、Outbox 条目、幂等回执与已处理事件标记在同一事务中提交。
//! 认领、标记与回收等 Outbox 操作各自原子，不参与命令事务。
//!
use crate::error::DomainResult as Result;
use crate::persist::{OutboxEntry, OutboxStatus, SerializedAggregate};
use crate::value_object::Version;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

#[async_trait]
pub trait TransactionManager: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx>;

    /// 原子提交；失败时事务内的任何写入都不可见
    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    /// 可达性探测（启动期使用）
    async fn ping(&self) -> Result<()>;
}

/// 聚合状态存储（行存储），按 `version` 做乐观并发控制
#[async_trait]
pub trait AggregateStore: TransactionManager {
    async fn load(
        &self,
        tx: &mut Self::Tx,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<SerializedAggregate>>;

    /// 写入聚合状态；若已提交版本不等于 `expected` 则返回 `ConcurrentModification`
    /// （可能在写入时或提交时检测到）
    async fn save(
        &self,
        tx: &mut Self::Tx,
        aggregate: SerializedAggregate,
        expected: Version,
    ) -> Result<()>;
}

/// Outbox 存储：持久、按聚合有序、幂等
#[async_trait]
pub trait OutboxStore: TransactionManager {
    /// 在调用方事务内追加条目；`(aggregate_id, event_version)` 唯一
    async fn append_within(&self, tx: &mut Self::Tx, entries: Vec<OutboxEntry>) -> Result<()>;

    /// 原子地将至多 `max` 条可投递条目置为 IN_FLIGHT 并写入租约。
    ///
    /// 选择顺序为 `(aggregate_id, event_version)` 升序，其次 `created_at`；
    /// 同一聚合只返回版本连续的前缀：仅当更低版本均已 PUBLISHED 时，条目才可被认领。
    async fn claim_batch(
        &self,
        processor_id: &str,
        max: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>>;

    /// 以下迁移仅在条目仍由 `owner` 持有时生效，否则返回 `LeaseLost`
    async fn mark_published(&self, id: &str, owner: &str, published_at: DateTime<Utc>)
    -> Result<()>;

    /// IN_FLIGHT → FAILED，`retry_count += 1`
    async fn mark_failed(
        &self,
        id: &str,
        owner: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()>;

    /// IN_FLIGHT | FAILED → DEAD
    async fn mark_dead(&self, id: &str, owner: &str, error: &str) -> Result<()>;

    /// IN_FLIGHT → PENDING，不计入重试
    async fn release(&self, id: &str, owner: &str) -> Result<()>;

    /// 租约已过期的 IN_FLIGHT 条目转为 FAILED（`next_attempt_at = now`），返回数量
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<usize>;

    /// 删除 `published_at` 早于给定时间的 PUBLISHED 条目，返回数量；DEAD 永不自动删除
    async fn compact(&self, published_before: DateTime<Utc>) -> Result<usize>;

    async fn get(&self, id: &str) -> Result<Option<OutboxEntry>>;

    async fn status_counts(&self) -> Result<StatusCounts>;
}

/// 命令幂等回执：`(aggregate_type, idempotency_key)` 唯一
#[async_trait]
pub trait IdempotencyStore: TransactionManager {
    async fn find_receipt(
        &self,
        tx: &mut Self::Tx,
        aggregate_type: &str,
        key: &str,
    ) -> Result<Option<Value>>;

    /// 重复键在写入或提交时返回 `Duplicate`
    async fn save_receipt(
        &self,
        tx: &mut Self::Tx,
        aggregate_type: &str,
        key: &str,
        receipt: Value,
    ) -> Result<()>;
}

/// 订阅端已处理事件集合：`(consumer, event_key)` 唯一，与副作用同事务写入
#[async_trait]
pub trait ProcessedEventStore: TransactionManager {
    async fn is_processed(&self, tx: &mut Self::Tx, consumer: &str, event_key: &str)
    -> Result<bool>;

    /// 重复键在写入或提交时返回 `Duplicate`
    async fn mark_processed(&self, tx: &mut Self::Tx, consumer: &str, event_key: &str)
    -> Result<()>;
}

/// 命令执行器所需的全部存储能力
pub trait RelayStore: AggregateStore + OutboxStore + IdempotencyStore + ProcessedEventStore {}

impl<T> RelayStore for T where
    T: AggregateStore + OutboxStore + IdempotencyStore + ProcessedEventStore
{
}

/// 各状态条目数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub published: usize,
    pub failed: usize,
    pub dead: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: OutboxStatus, n: usize) {
        match status {
            OutboxStatus::Pending => self.pending += n,
            OutboxStatus::InFlight => self.in_flight += n,
            OutboxStatus::Published => self.published += n,
            OutboxStatus::Failed => self.failed += n,
            OutboxStatus::Dead => self.dead += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.published + self.failed + self.dead
    }

    /// 尚未到达终态的条目数
    pub fn outstanding(&self) -> usize {
        self.pending + self.in_flight + self.failed
    }
}
