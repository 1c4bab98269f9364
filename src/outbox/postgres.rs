//! # PostgreSQL Outbox Store
//!
//! [`OutboxStore`] over an `outbox_items` table (see `migrations/`).
//!
//! Claiming is a single statement: rows are locked with `FOR UPDATE SKIP LOCKED`
//! in the subquery and stamped in the outer `UPDATE`, so concurrent workers on
//! any number of hosts never receive the same row.
//!
//! Settlement statements carry the claim owner in their `WHERE` clause, so a
//! worker whose stale claim was taken over cannot overwrite the new owner's
//! result.
//!
//! ## Transactional writes
//!
//! [`PostgresOutboxStore::insert_in_tx`] and
//! [`PostgresOutboxStore::insert_many_in_tx`] write rows on the caller's
//! connection, so they commit or roll back together with the business change.
//!
//! ```rust,no_run
//! use courier_core::outbox::{OutboxItem, PostgresOutboxStore};
//! use courier_core::CourierError;
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool, item: OutboxItem) -> courier_core::error::Result<()> {
//! let store = PostgresOutboxStore::new(pool.clone());
//! store.migrate().await?;
//!
//! let store_error = |e: sqlx::Error| CourierError::store("order_tx", e.to_string());
//! let mut tx = pool.begin().await.map_err(store_error)?;
//! // update domain tables through `tx`, then stage the message
//! store.insert_in_tx(&mut tx, &item).await?;
//! tx.commit().await.map_err(store_error)?;
//! # Ok(())
//! # }
//! ```

use super::item::{OutboxItem, OutboxStatus, OutboxStatusCounts};
use super::store::OutboxStore;
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, instrument};
use uuid::Uuid;

const SELECT_COLUMNS: &str = "id, envelope_id, envelope_type, payload, payload_hash, created_at, \
     claimed_at, claimed_by, processed_at, abandoned_at, retry_count, max_retries, last_error, \
     properties";

/// Row still claimed by the worker bound as `$2` and not yet settled
const OWNED_BY_WORKER: &str = "claimed_by = $2 AND processed_at IS NULL AND abandoned_at IS NULL";

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    envelope_id: Uuid,
    envelope_type: String,
    payload: Vec<u8>,
    payload_hash: String,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    abandoned_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    last_error: Option<String>,
    properties: Json<HashMap<String, String>>,
}

impl From<OutboxRow> for OutboxItem {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.id,
            envelope_id: row.envelope_id,
            envelope_type: row.envelope_type,
            payload: row.payload,
            payload_hash: row.payload_hash,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            claimed_by: row.claimed_by,
            processed_at: row.processed_at,
            abandoned_at: row.abandoned_at,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            max_retries: u32::try_from(row.max_retries).unwrap_or(0),
            last_error: row.last_error,
            properties: row.properties.0,
        }
    }
}

fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> CourierError {
    move |e| {
        error!(operation = operation, error = %e, "Outbox store query failed");
        CourierError::store(operation, e.to_string())
    }
}

fn to_i32(field: &str, value: u32) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| {
            CourierError::store("insert", format!("{field} {value} does not fit in INTEGER"))
        })
}

fn to_interval_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Outbox store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CourierError::store("migrate", e.to_string()))
    }

    /// Insert one row on the caller's connection or transaction
    pub async fn insert_in_tx(&self, conn: &mut PgConnection, item: &OutboxItem) -> Result<()> {
        insert_rows(conn, std::slice::from_ref(item)).await
    }

    /// Insert rows on the caller's connection or transaction
    ///
    /// Nothing becomes visible to workers until the caller commits.
    pub async fn insert_many_in_tx(
        &self,
        conn: &mut PgConnection,
        items: &[OutboxItem],
    ) -> Result<()> {
        insert_rows(conn, items).await
    }

    async fn update_owned(
        &self,
        operation: &'static str,
        query: &str,
        id: Uuid,
        worker_id: &str,
    ) -> Result<()> {
        let result = sqlx::query(query)
            .bind(id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_error(operation))?;

        if result.rows_affected() == 0 {
            return Err(self.settlement_miss(operation, id, worker_id).await);
        }
        Ok(())
    }

    /// Explain why a settlement matched no row
    async fn settlement_miss(
        &self,
        operation: &'static str,
        id: Uuid,
        worker_id: &str,
    ) -> CourierError {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM outbox_items WHERE id = $1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await;

        match exists {
            Ok(true) => CourierError::claim_lost(id, worker_id),
            Ok(false) => CourierError::not_found(id),
            Err(e) => db_error(operation)(e),
        }
    }
}

async fn insert_rows<'e, E>(executor: E, items: &[OutboxItem]) -> Result<()>
where
    E: PgExecutor<'e>,
{
    if items.is_empty() {
        return Ok(());
    }

    let mut rows = Vec::with_capacity(items.len());
    for item in items {
        rows.push((
            item,
            to_i32("retry_count", item.retry_count)?,
            to_i32("max_retries", item.max_retries)?,
        ));
    }

    let mut builder =
        QueryBuilder::<Postgres>::new(format!("INSERT INTO outbox_items ({SELECT_COLUMNS}) "));
    builder.push_values(rows, |mut b, (item, retry_count, max_retries)| {
        b.push_bind(item.id)
            .push_bind(item.envelope_id)
            .push_bind(item.envelope_type.clone())
            .push_bind(item.payload.clone())
            .push_bind(item.payload_hash.clone())
            .push_bind(item.created_at)
            .push_bind(item.claimed_at)
            .push_bind(item.claimed_by.clone())
            .push_bind(item.processed_at)
            .push_bind(item.abandoned_at)
            .push_bind(retry_count)
            .push_bind(max_retries)
            .push_bind(item.last_error.clone())
            .push_bind(Json(item.properties.clone()));
    });

    // One statement, so the batch lands atomically
    builder
        .build()
        .execute(executor)
        .await
        .map_err(db_error("insert_many"))?;
    Ok(())
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, item), fields(item_id = %item.id))]
    async fn insert(&self, item: OutboxItem) -> Result<()> {
        self.insert_many(vec![item]).await
    }

    #[instrument(skip(self, items), fields(count = items.len()))]
    async fn insert_many(&self, items: Vec<OutboxItem>) -> Result<()> {
        insert_rows(&self.pool, &items).await
    }

    #[instrument(skip(self))]
    async fn claim_batch(
        &self,
        max: usize,
        worker_id: &str,
        claim_timeout: Duration,
    ) -> Result<Vec<OutboxItem>> {
        let query = format!(
            r#"
            UPDATE outbox_items
            SET claimed_at = now(), claimed_by = $1
            WHERE id IN (
                SELECT id FROM outbox_items
                WHERE processed_at IS NULL
                  AND abandoned_at IS NULL
                  AND (claimed_at IS NULL
                       OR claimed_at < now() - ($2::BIGINT * INTERVAL '1 millisecond'))
                ORDER BY created_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {SELECT_COLUMNS}
            "#
        );

        let rows = sqlx::query_as::<_, OutboxRow>(&query)
            .bind(worker_id)
            .bind(to_interval_ms(claim_timeout))
            .bind(i64::try_from(max).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("claim_batch"))?;

        // RETURNING does not preserve the subquery order
        let mut items: Vec<OutboxItem> = rows.into_iter().map(OutboxItem::from).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        debug!(claimed = items.len(), worker_id = %worker_id, "Claimed outbox batch");
        Ok(items)
    }

    async fn mark_processed(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let query = format!(
            "UPDATE outbox_items SET processed_at = now(), claimed_at = NULL, claimed_by = NULL \
             WHERE id = $1 AND {OWNED_BY_WORKER}"
        );
        self.update_owned("mark_processed", &query, id, worker_id).await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        reason: &str,
    ) -> Result<OutboxStatus> {
        let query = format!(
            r#"
            UPDATE outbox_items
            SET retry_count = retry_count + 1,
                last_error = $3,
                claimed_at = NULL,
                claimed_by = NULL,
                abandoned_at = CASE
                    WHEN retry_count + 1 > max_retries THEN now()
                    ELSE abandoned_at
                END
            WHERE id = $1 AND {OWNED_BY_WORKER}
            RETURNING abandoned_at IS NOT NULL
            "#
        );
        let row: Option<(bool,)> = sqlx::query_as(&query)
            .bind(id)
            .bind(worker_id)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("mark_failed"))?;

        match row {
            Some((true,)) => Ok(OutboxStatus::Abandoned),
            Some((false,)) => Ok(OutboxStatus::Pending),
            None => Err(self.settlement_miss("mark_failed", id, worker_id).await),
        }
    }

    async fn mark_abandoned(&self, id: Uuid, worker_id: &str, reason: &str) -> Result<()> {
        let query = format!(
            "UPDATE outbox_items SET abandoned_at = now(), last_error = $3, \
             claimed_at = NULL, claimed_by = NULL WHERE id = $1 AND {OWNED_BY_WORKER}"
        );
        let result = sqlx::query(&query)
            .bind(id)
            .bind(worker_id)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(db_error("mark_abandoned"))?;

        if result.rows_affected() == 0 {
            return Err(self.settlement_miss("mark_abandoned", id, worker_id).await);
        }
        Ok(())
    }

    async fn release_claim(&self, id: Uuid, worker_id: &str) -> Result<()> {
        let query = format!(
            "UPDATE outbox_items SET claimed_at = NULL, claimed_by = NULL \
             WHERE id = $1 AND {OWNED_BY_WORKER}"
        );
        self.update_owned("release_claim", &query, id, worker_id).await
    }

    #[instrument(skip(self))]
    async fn purge(&self, only_processed: bool) -> Result<u64> {
        let query = if only_processed {
            "DELETE FROM outbox_items WHERE processed_at IS NOT NULL"
        } else {
            "DELETE FROM outbox_items"
        };

        let result = sqlx::query(query)
            .execute(&self.pool)
            .await
            .map_err(db_error("purge"))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn purge_processed_older_than(&self, age: Duration) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_items WHERE processed_at IS NOT NULL \
             AND processed_at < now() - ($1::BIGINT * INTERVAL '1 millisecond')",
        )
        .bind(to_interval_ms(age))
        .execute(&self.pool)
        .await
        .map_err(db_error("purge_processed_older_than"))?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxItem>> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM outbox_items WHERE id = $1");
        let row = sqlx::query_as::<_, OutboxRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get"))?;
        Ok(row.map(OutboxItem::from))
    }

    async fn count_by_status(&self) -> Result<OutboxStatusCounts> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE abandoned_at IS NULL AND processed_at IS NULL
                                   AND claimed_at IS NULL),
                COUNT(*) FILTER (WHERE abandoned_at IS NULL AND processed_at IS NULL
                                   AND claimed_at IS NOT NULL),
                COUNT(*) FILTER (WHERE abandoned_at IS NULL AND processed_at IS NOT NULL),
                COUNT(*) FILTER (WHERE abandoned_at IS NOT NULL)
            FROM outbox_items
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("count_by_status"))?;

        let count = |n: i64| u64::try_from(n).unwrap_or(0);
        Ok(OutboxStatusCounts {
            pending: count(row.0),
            claimed: count(row.1),
            processed: count(row.2),
            abandoned: count(row.3),
        })
    }
}
