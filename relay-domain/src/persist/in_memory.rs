//! 内存版存储（InMemoryStore）
//!
//! 满足全部存储协议的事务性内存实现：
//! - 事务内写入先暂存，提交时在同一把锁下整体校验并落地（全有或全无）；
//! - 提交时校验聚合版本、`(aggregate_id, event_version)`、幂等键与已处理事件的唯一性；
//! - 认领在锁内完成，因此同一条目最多被一个处理器持有；
//! - 提供故障注入（不可用、下一次提交失败、提交汇合），便于测试原子性、退避与并发冲突。
//!
//! 典型用途：测试环境、示例与本地开发。
//!
use crate::error::{DomainError, DomainResult as Result};
use crate::persist::{
    AggregateStore, IdempotencyStore, OutboxEntry, OutboxStatus, OutboxStore,
    ProcessedEventStore, SerializedAggregate, StatusCounts, TransactionManager,
};
use crate::value_object::Version;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{self, Arc};
use std::time::Duration;
use tokio::sync::{Barrier, Mutex};

type AggregateKey = (String, String);
type OutboxKey = (String, usize);

#[derive(Default)]
struct State {
    aggregates: HashMap<AggregateKey, SerializedAggregate>,
    // (aggregate_id, event_version) 有序，天然满足认领顺序
    outbox: BTreeMap<OutboxKey, OutboxEntry>,
    outbox_ids: HashMap<String, OutboxKey>,
    receipts: HashMap<AggregateKey, Value>,
    processed: HashSet<(String, String)>,
}

impl State {
    fn entry_mut(&mut self, id: &str) -> Result<&mut OutboxEntry> {
        let key = self
            .outbox_ids
            .get(id)
            .ok_or_else(|| DomainError::not_found(format!("outbox entry {id}")))?;
        self.outbox
            .get_mut(key)
            .ok_or_else(|| DomainError::not_found(format!("outbox entry {id}")))
    }
}

/// 内存事务：暂存写集，提交时一次性落地
#[derive(Default)]
pub struct InMemoryTx {
    aggregates: Vec<(SerializedAggregate, Version)>,
    outbox: Vec<OutboxEntry>,
    receipts: Vec<(AggregateKey, Value)>,
    processed: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
    fail_next_commit: Arc<AtomicBool>,
    commit_gate: Arc<sync::Mutex<Option<Arc<Barrier>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储整体不可达（所有操作返回 `StoreUnavailable`）
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// 让下一次提交失败（提交前的写入全部丢弃）
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// 接下来的 `parties` 个提交互相等待，全部到达后才依次校验落地。
    ///
    /// 各事务因此都在对方提交前完成读取，用来复现并发写入的冲突。
    pub fn hold_commits(&self, parties: usize) {
        if let Ok(mut gate) = self.commit_gate.lock() {
            *gate = Some(Arc::new(Barrier::new(parties)));
        }
    }

    async fn pass_commit_gate(&self) {
        let gate = self.commit_gate.lock().ok().and_then(|gate| gate.clone());
        if let Some(barrier) = gate {
            if barrier.wait().await.is_leader() {
                if let Ok(mut gate) = self.commit_gate.lock() {
                    *gate = None;
                }
            }
        }
    }

    /// 全部 Outbox 条目快照，按 `(aggregate_id, event_version)` 排序
    pub async fn entries(&self) -> Vec<OutboxEntry> {
        self.state.lock().await.outbox.values().cloned().collect()
    }

    pub async fn aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Option<SerializedAggregate> {
        self.state
            .lock()
            .await
            .aggregates
            .get(&(aggregate_type.to_string(), aggregate_id.to_string()))
            .cloned()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::store_unavailable("in-memory store offline"));
        }
        Ok(())
    }

    fn validate(state: &State, tx: &InMemoryTx) -> Result<()> {
        for (aggregate, expected) in &tx.aggregates {
            let key = (
                aggregate.aggregate_type().to_string(),
                aggregate.aggregate_id().to_string(),
            );
            let actual = state
                .aggregates
                .get(&key)
                .map(|a| a.version())
                .unwrap_or_default();
            if actual != *expected {
                return Err(DomainError::ConcurrentModification {
                    aggregate_id: aggregate.aggregate_id().to_string(),
                    expected: expected.value(),
                    actual: actual.value(),
                });
            }
        }

        let mut staged_keys = HashSet::new();
        let mut staged_ids = HashSet::new();
        for entry in &tx.outbox {
            let key = (entry.aggregate_id.clone(), entry.event_version);
            if state.outbox.contains_key(&key) || !staged_keys.insert(key) {
                return Err(DomainError::Duplicate {
                    key: format!("{}@{}", entry.aggregate_id, entry.event_version),
                });
            }
            if state.outbox_ids.contains_key(&entry.id) || !staged_ids.insert(entry.id.clone())
            {
                return Err(DomainError::Duplicate {
                    key: entry.id.clone(),
                });
            }
        }

        let mut staged_receipts = HashSet::new();
        for (key, _) in &tx.receipts {
            if state.receipts.contains_key(key) || !staged_receipts.insert(key.clone()) {
                return Err(DomainError::Duplicate {
                    key: format!("{}/{}", key.0, key.1),
                });
            }
        }

        let mut staged_processed = HashSet::new();
        for key in &tx.processed {
            if state.processed.contains(key) || !staged_processed.insert(key.clone()) {
                return Err(DomainError::Duplicate {
                    key: format!("{}/{}", key.0, key.1),
                });
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TransactionManager for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx> {
        self.check_available()?;
        Ok(InMemoryTx::default())
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        self.check_available()?;
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(DomainError::store_unavailable("injected commit failure"));
        }
        self.pass_commit_gate().await;

        let mut state = self.state.lock().await;
        Self::validate(&state, &tx)?;

        for (aggregate, _) in tx.aggregates {
            let key = (
                aggregate.aggregate_type().to_string(),
                aggregate.aggregate_id().to_string(),
            );
            state.aggregates.insert(key, aggregate);
        }
        for entry in tx.outbox {
            let key = (entry.aggregate_id.clone(), entry.event_version);
            state.outbox_ids.insert(entry.id.clone(), key.clone());
            state.outbox.insert(key, entry);
        }
        for (key, receipt) in tx.receipts {
            state.receipts.insert(key, receipt);
        }
        for key in tx.processed {
            state.processed.insert(key);
        }

        Ok(())
    }

    async fn rollback(&self, _tx: Self::Tx) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[async_trait]
impl AggregateStore for InMemoryStore {
    async fn load(
        &self,
        tx: &mut Self::Tx,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<SerializedAggregate>> {
        self.check_available()?;

        // 读己之写
        if let Some((staged, _)) = tx.aggregates.iter().rev().find(|(a, _)| {
            a.aggregate_type() == aggregate_type && a.aggregate_id() == aggregate_id
        }) {
            return Ok(Some(staged.clone()));
        }

        Ok(self.aggregate(aggregate_type, aggregate_id).await)
    }

    async fn save(
        &self,
        tx: &mut Self::Tx,
        aggregate: SerializedAggregate,
        expected: Version,
    ) -> Result<()> {
        self.check_available()?;
        tx.aggregates.push((aggregate, expected));
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn append_within(&self, tx: &mut Self::Tx, entries: Vec<OutboxEntry>) -> Result<()> {
        self.check_available()?;
        tx.outbox.extend(entries);
        Ok(())
    }

    async fn claim_batch(
        &self,
        processor_id: &str,
        max: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>> {
        self.check_available()?;
        let lease_expires_at = now
            .checked_add_signed(chrono::Duration::from_std(lease)?)
            .ok_or_else(|| DomainError::invalid_input("lease duration out of range"))?;

        let mut state = self.state.lock().await;
        let mut claimed = Vec::new();
        let mut current: Option<String> = None;
        let mut blocked = false;

        for entry in state.outbox.values_mut() {
            if claimed.len() >= max {
                break;
            }
            if current.as_deref() != Some(entry.aggregate_id.as_str()) {
                current = Some(entry.aggregate_id.clone());
                blocked = false;
            }
            if blocked || entry.status == OutboxStatus::Published {
                continue;
            }
            if entry.is_due(now) {
                entry.claim(processor_id, now, lease_expires_at)?;
                claimed.push(entry.clone());
            } else {
                // 更低版本仍在途、未到重试时间或已死亡：该聚合后续版本不可认领
                blocked = true;
            }
        }

        Ok(claimed)
    }

    async fn mark_published(
        &self,
        id: &str,
        owner: &str,
        published_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .entry_mut(id)?
            .mark_published(owner, published_at)
    }

    async fn mark_failed(
        &self,
        id: &str,
        owner: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .entry_mut(id)?
            .mark_failed(owner, error, next_attempt_at)
    }

    async fn mark_dead(&self, id: &str, owner: &str, error: &str) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.entry_mut(id)?.mark_dead(owner, error)
    }

    async fn release(&self, id: &str, owner: &str) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.entry_mut(id)?.release(owner)
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let mut reclaimed = 0;
        for entry in state.outbox.values_mut() {
            if entry.lease_expired(now) {
                entry.reclaim(now)?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn compact(&self, published_before: DateTime<Utc>) -> Result<usize> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let expired: Vec<(OutboxKey, String)> = state
            .outbox
            .iter()
            .filter(|(_, e)| {
                e.status == OutboxStatus::Published
                    && e.published_at.is_some_and(|at| at < published_before)
            })
            .map(|(k, e)| (k.clone(), e.id.clone()))
            .collect();

        for (key, id) in &expired {
            state.outbox.remove(key);
            state.outbox_ids.remove(id);
        }
        Ok(expired.len())
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxEntry>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .outbox_ids
            .get(id)
            .and_then(|key| state.outbox.get(key))
            .cloned())
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for entry in state.outbox.values() {
            counts.add(entry.status, 1);
        }
        Ok(counts)
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn find_receipt(
        &self,
        tx: &mut Self::Tx,
        aggregate_type: &str,
        key: &str,
    ) -> Result<Option<Value>> {
        self.check_available()?;
        let lookup = (aggregate_type.to_string(), key.to_string());
        if let Some((_, receipt)) = tx.receipts.iter().find(|(k, _)| *k == lookup) {
            return Ok(Some(receipt.clone()));
        }
        Ok(self.state.lock().await.receipts.get(&lookup).cloned())
    }

    async fn save_receipt(
        &self,
        tx: &mut Self::Tx,
        aggregate_type: &str,
        key: &str,
        receipt: Value,
    ) -> Result<()> {
        self.check_available()?;
        tx.receipts
            .push(((aggregate_type.to_string(), key.to_string()), receipt));
        Ok(())
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryStore {
    async fn is_processed(
        &self,
        tx: &mut Self::Tx,
        consumer: &str,
        event_key: &str,
    ) -> Result<bool> {
        self.check_available()?;
        let key = (consumer.to_string(), event_key.to_string());
        if tx.processed.contains(&key) {
            return Ok(true);
        }
        Ok(self.state.lock().await.processed.contains(&key))
    }

    async fn mark_processed(
        &self,
        tx: &mut Self::Tx,
        consumer: &str,
        event_key: &str,
    ) -> Result<()> {
        self.check_available()?;
        tx.processed
            .push((consumer.to_string(), event_key.to_string()));
        Ok(())
    }
}
