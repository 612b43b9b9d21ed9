//! Outbox 条目与投递状态机
//!
//! PENDING → IN_FLIGHT → PUBLISHED
//!                     ↘ FAILED(next_attempt_at) → IN_FLIGHT → …
//!                     ↘ DEAD
//! PUBLISHED 与 DEAD 为终态，状态只单向推进；IN_FLIGHT 期间条目由租约持有者独占。
//!
use crate::error::{DomainError, DomainResult};
use crate::persist::SerializedEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Published,
    Failed,
    Dead,
}

impl OutboxStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InFlight => "IN_FLIGHT",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
            Self::Dead => "DEAD",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Dead)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_FLIGHT" => Ok(Self::InFlight),
            "PUBLISHED" => Ok(Self::Published),
            "FAILED" => Ok(Self::Failed),
            "DEAD" => Ok(Self::Dead),
            other => Err(DomainError::TypeMismatch {
                expected: "outbox status".to_string(),
                found: other.to_string(),
            }),
        }
    }
}

/// Outbox 中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_version: usize,
    /// SerializedEvent 的规范编码
    pub payload: Vec<u8>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// 首次被处理器认领（读取）的时间
    pub read_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// 由已记录的事件创建一条 PENDING 条目
    pub fn pending(event: &SerializedEvent, created_at: DateTime<Utc>) -> DomainResult<Self> {
        if event.event_version() == 0 {
            return Err(DomainError::invalid_input("event version must be >= 1"));
        }

        Ok(Self {
            id: event.event_id().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            aggregate_type: event.aggregate_type().to_string(),
            event_type: event.event_type().to_string(),
            event_version: event.event_version(),
            payload: event.to_bytes()?,
            occurred_at: event.occurred_at(),
            created_at,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            published_at: None,
            lease_owner: None,
            lease_expires_at: None,
            read_at: None,
        })
    }

    /// 可被认领：PENDING，或 FAILED 且已到重试时间
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => self.next_attempt_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::InFlight && self.lease_expires_at.is_some_and(|at| at < now)
    }

    pub fn claim(
        &mut self,
        owner: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure(
            matches!(self.status, OutboxStatus::Pending | OutboxStatus::Failed),
            OutboxStatus::InFlight,
        )?;
        self.status = OutboxStatus::InFlight;
        self.read_at.get_or_insert(now);
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(lease_expires_at);
        Ok(())
    }

    pub fn mark_published(
        &mut self,
        owner: &str,
        published_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_leased_by(owner, OutboxStatus::Published)?;
        self.status = OutboxStatus::Published;
        self.published_at = Some(published_at);
        self.next_attempt_at = None;
        self.clear_lease();
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        owner: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_leased_by(owner, OutboxStatus::Failed)?;
        self.status = OutboxStatus::Failed;
        self.retry_count += 1;
        self.last_error = Some(error.to_string());
        self.next_attempt_at = Some(next_attempt_at);
        self.clear_lease();
        Ok(())
    }

    /// IN_FLIGHT（须由 `owner` 持有）或 FAILED → DEAD
    pub fn mark_dead(&mut self, owner: &str, error: &str) -> DomainResult<()> {
        if self.status != OutboxStatus::Failed {
            self.ensure_leased_by(owner, OutboxStatus::Dead)?;
        }
        self.status = OutboxStatus::Dead;
        self.last_error = Some(error.to_string());
        self.next_attempt_at = None;
        self.clear_lease();
        Ok(())
    }

    /// 归还认领：IN_FLIGHT → PENDING，不计入重试次数
    pub fn release(&mut self, owner: &str) -> DomainResult<()> {
        self.ensure_leased_by(owner, OutboxStatus::Pending)?;
        self.status = OutboxStatus::Pending;
        self.clear_lease();
        Ok(())
    }

    /// 租约过期回收：IN_FLIGHT → FAILED，立即可重试
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure(self.status == OutboxStatus::InFlight, OutboxStatus::Failed)?;
        self.status = OutboxStatus::Failed;
        self.last_error = Some(format!(
            "lease of {} expired",
            self.lease_owner.as_deref().unwrap_or("unknown")
        ));
        self.next_attempt_at = Some(now);
        self.clear_lease();
        Ok(())
    }

    fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    /// 只有当前租约持有者才能推进 IN_FLIGHT 条目
    fn ensure_leased_by(&self, owner: &str, to: OutboxStatus) -> DomainResult<()> {
        self.ensure(self.status == OutboxStatus::InFlight, to)?;
        if self.lease_owner.as_deref() != Some(owner) {
            return Err(DomainError::LeaseLost {
                entry_id: self.id.clone(),
                owner: owner.to_string(),
            });
        }
        Ok(())
    }

    fn ensure(&self, allowed: bool, to: OutboxStatus) -> DomainResult<()> {
        if allowed {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                entry_id: self.id.clone(),
                from: self.status.as_str(),
                to: to.as_str(),
            })
        }
    }
}
