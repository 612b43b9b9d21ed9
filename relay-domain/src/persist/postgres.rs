//! PostgreSQL 存储（PgStore）
//!
//! 与 [`InMemoryStore`](super::InMemoryStore) 实现相同的存储协议，表结构见 `migrations/`。
//! 认领使用 `FOR UPDATE SKIP LOCKED`，多个处理器并发认领时互不阻塞、互不重叠；
//! 仅当同一聚合的更低版本均已 PUBLISHED 时条目才会被选中。
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
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::time::Duration;

const CLAIM_SQL: &str = r#"
WITH candidates AS (
    SELECT o.id
    FROM outbox o
    WHERE (o.status = 'PENDING'
           OR (o.status = 'FAILED' AND (o.next_attempt_at IS NULL OR o.next_attempt_at <= $1)))
      AND NOT EXISTS (
          SELECT 1 FROM outbox p
          WHERE p.aggregate_id = o.aggregate_id
            AND p.event_version < o.event_version
            AND p.status <> 'PUBLISHED')
    ORDER BY o.aggregate_id, o.event_version, o.created_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE outbox
SET status = 'IN_FLIGHT', lease_owner = $3, lease_expires_at = $4,
    read_at = COALESCE(outbox.read_at, $1)
FROM candidates
WHERE outbox.id = candidates.id
RETURNING outbox.*
"#;

#[derive(FromRow)]
struct OutboxRow {
    id: String,
    aggregate_id: String,
    aggregate_type: String,
    event_type: String,
    event_version: i64,
    payload: Vec<u8>,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = DomainError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        Ok(Self {
            event_version: usize::try_from(row.event_version)
                .map_err(|_| DomainError::invalid_input("negative event_version"))?,
            retry_count: u32::try_from(row.retry_count)
                .map_err(|_| DomainError::invalid_input("negative retry_count"))?,
            status: row.status.parse()?,
            id: row.id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
            created_at: row.created_at,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            published_at: row.published_at,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            read_at: row.read_at,
        })
    }
}

fn to_i64(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| DomainError::invalid_input("version out of range"))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// 执行内置迁移
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DomainError::store_unavailable(e.to_string()))
    }

    /// 条件更新未命中时区分“不存在”、“租约已易主”与“非法迁移”
    async fn transition_error(&self, id: &str, owner: &str, to: OutboxStatus) -> DomainError {
        match self.get(id).await {
            Ok(Some(entry))
                if entry.status == OutboxStatus::InFlight
                    && entry.lease_owner.as_deref() != Some(owner) =>
            {
                DomainError::LeaseLost {
                    entry_id: id.to_string(),
                    owner: owner.to_string(),
                }
            }
            Ok(Some(entry)) => DomainError::InvalidTransition {
                entry_id: id.to_string(),
                from: entry.status.as_str(),
                to: to.as_str(),
            },
            Ok(None) => DomainError::not_found(format!("outbox entry {id}")),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TransactionManager for PgStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        Ok(tx.rollback().await?)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for PgStore {
    async fn load(
        &self,
        tx: &mut Self::Tx,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<SerializedAggregate>> {
        let row: Option<(i64, Value)> = sqlx::query_as(
            "SELECT version, state FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2",
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|(version, state)| -> Result<SerializedAggregate> {
            let version = usize::try_from(version)
                .map_err(|_| DomainError::invalid_input("negative aggregate version"))?;
            Ok(SerializedAggregate::builder()
                .aggregate_id(aggregate_id.to_string())
                .aggregate_type(aggregate_type.to_string())
                .version(Version::from_value(version))
                .state(state)
                .build())
        })
        .transpose()
    }

    async fn save(
        &self,
        tx: &mut Self::Tx,
        aggregate: SerializedAggregate,
        expected: Version,
    ) -> Result<()> {
        let result = if expected.is_new() {
            sqlx::query(
                r#"
                INSERT INTO aggregates (aggregate_type, aggregate_id, version, state)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (aggregate_type, aggregate_id) DO NOTHING
                "#,
            )
            .bind(aggregate.aggregate_type())
            .bind(aggregate.aggregate_id())
            .bind(to_i64(aggregate.version().value())?)
            .bind(aggregate.state())
            .execute(&mut **tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE aggregates SET version = $3, state = $4, updated_at = now()
                WHERE aggregate_type = $1 AND aggregate_id = $2 AND version = $5
                "#,
            )
            .bind(aggregate.aggregate_type())
            .bind(aggregate.aggregate_id())
            .bind(to_i64(aggregate.version().value())?)
            .bind(aggregate.state())
            .bind(to_i64(expected.value())?)
            .execute(&mut **tx)
            .await?
        };

        if result.rows_affected() == 0 {
            let actual: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2",
            )
            .bind(aggregate.aggregate_type())
            .bind(aggregate.aggregate_id())
            .fetch_optional(&mut **tx)
            .await?;

            return Err(DomainError::ConcurrentModification {
                aggregate_id: aggregate.aggregate_id().to_string(),
                expected: expected.value(),
                actual: actual.and_then(|v| usize::try_from(v).ok()).unwrap_or(0),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn append_within(&self, tx: &mut Self::Tx, entries: Vec<OutboxEntry>) -> Result<()> {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO outbox
                    (id, aggregate_id, aggregate_type, event_type, event_version, payload,
                     occurred_at, created_at, status, retry_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(&entry.id)
            .bind(&entry.aggregate_id)
            .bind(&entry.aggregate_type)
            .bind(&entry.event_type)
            .bind(to_i64(entry.event_version)?)
            .bind(&entry.payload)
            .bind(entry.occurred_at)
            .bind(entry.created_at)
            .bind(entry.status.as_str())
            .bind(i32::try_from(entry.retry_count).unwrap_or(i32::MAX))
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn claim_batch(
        &self,
        processor_id: &str,
        max: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>> {
        let lease_expires_at = now
            .checked_add_signed(chrono::Duration::from_std(lease)?)
            .ok_or_else(|| DomainError::invalid_input("lease duration out of range"))?;
        let rows: Vec<OutboxRow> = sqlx::query_as(CLAIM_SQL)
            .bind(now)
            .bind(to_i64(max)?)
            .bind(processor_id)
            .bind(lease_expires_at)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = rows
            .into_iter()
            .map(OutboxEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING 不保证顺序
        entries.sort_by(|a, b| {
            (&a.aggregate_id, a.event_version, a.created_at).cmp(&(
                &b.aggregate_id,
                b.event_version,
                b.created_at,
            ))
        });
        Ok(entries)
    }

    async fn mark_published(
        &self,
        id: &str,
        owner: &str,
        published_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PUBLISHED', published_at = $3, next_attempt_at = NULL,
                lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'IN_FLIGHT' AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(published_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .transition_error(id, owner, OutboxStatus::Published)
                .await);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        owner: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'FAILED', retry_count = retry_count + 1, last_error = $3,
                next_attempt_at = $4, lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'IN_FLIGHT' AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, owner, OutboxStatus::Failed).await);
        }
        Ok(())
    }

    async fn mark_dead(&self, id: &str, owner: &str, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'DEAD', last_error = $3, next_attempt_at = NULL,
                lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1
              AND ((status = 'IN_FLIGHT' AND lease_owner = $2) OR status = 'FAILED')
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, owner, OutboxStatus::Dead).await);
        }
        Ok(())
    }

    async fn release(&self, id: &str, owner: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PENDING', lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND status = 'IN_FLIGHT' AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, owner, OutboxStatus::Pending).await);
        }
        Ok(())
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'FAILED', next_attempt_at = $1,
                last_error = 'lease of ' || COALESCE(lease_owner, 'unknown') || ' expired',
                lease_owner = NULL, lease_expires_at = NULL
            WHERE status = 'IN_FLIGHT' AND lease_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn compact(&self, published_before: DateTime<Utc>) -> Result<usize> {
        let result =
            sqlx::query("DELETE FROM outbox WHERE status = 'PUBLISHED' AND published_at < $1")
                .bind(published_before)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get(&self, id: &str) -> Result<Option<OutboxEntry>> {
        let row: Option<OutboxRow> = sqlx::query_as("SELECT * FROM outbox WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutboxEntry::try_from).transpose()
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

#[async_trait]
impl IdempotencyStore for PgStore {
    async fn find_receipt(
        &self,
        tx: &mut Self::Tx,
        aggregate_type: &str,
        key: &str,
    ) -> Result<Option<Value>> {
        let receipt = sqlx::query_scalar(
            r#"
            SELECT receipt FROM command_receipts
            WHERE aggregate_type = $1 AND idempotency_key = $2
            "#,
        )
        .bind(aggregate_type)
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(receipt)
    }

    async fn save_receipt(
        &self,
        tx: &mut Self::Tx,
        aggregate_type: &str,
        key: &str,
        receipt: Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO command_receipts (aggregate_type, idempotency_key, receipt)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(aggregate_type)
        .bind(key)
        .bind(receipt)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessedEventStore for PgStore {
    async fn is_processed(
        &self,
        tx: &mut Self::Tx,
        consumer: &str,
        event_key: &str,
    ) -> Result<bool> {
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM processed_events WHERE consumer = $1 AND event_key = $2",
        )
        .bind(consumer)
        .bind(event_key)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(found.is_some())
    }

    async fn mark_processed(
        &self,
        tx: &mut Self::Tx,
        consumer: &str,
        event_key: &str,
    ) -> Result<()> {
        sqlx::query("INSERT INTO processed_events (consumer, event_key) VALUES ($1, $2)")
            .bind(consumer)
            .bind(event_key)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}
