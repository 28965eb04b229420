//! Postgres-backed event store implementation.
//!
//! Persists the `domain_events` log (see `migrations/0001_domain_events.sql`).
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `PersistenceError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | PersistenceError | Scenario |
//! |------------|----------------------|------------------|----------|
//! | Database (unique violation on primary key) | `23505` | `Duplicate` | Event id already stored |
//! | Database (unique violation on stream version) | `23505` | `Conflict` | Concurrent append to the same aggregate |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! ## Stream versions
//!
//! Appends to an aggregate take a transaction-scoped advisory lock on the
//! stream before reading `MAX(version)`, so concurrent writers to the same
//! stream serialize instead of colliding. The partial unique index on
//! `(aggregate_id, aggregate_type, version)` is the last line of defence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{Span, instrument};

use hrms_core::{AggregateId, AggregateRef, EventId};

use super::query::{
    EventQuery, EventQueryResult, EventStats, StoreHealth, TOP_USERS_LIMIT, UserActivity,
};
use super::r#trait::{EventStore, EventStoreRecord, NewEventRecord, PersistenceError};

const SCHEMA: &str = include_str!("../../migrations/0001_domain_events.sql");

const RECORD_COLUMNS: &str = "id, event_type, aggregate_id, aggregate_type, event_data, metadata, \
     occurred_at, created_at, version, correlation_id, caused_by, user_id, session_id";

/// Postgres-backed append-only event log.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; every append runs in
/// its own transaction.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `domain_events` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Append records inside one transaction with a single multi-row INSERT.
    async fn append(&self, records: Vec<NewEventRecord>) -> Result<Vec<EventId>, PersistenceError> {
        if records.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Lock streams in a fixed order so two batches touching the same
        // aggregates cannot deadlock.
        let mut streams: Vec<AggregateRef> = records.iter().filter_map(|r| r.aggregate.clone()).collect();
        streams.sort_by(|a, b| {
            (a.aggregate_type.as_str(), a.aggregate_id).cmp(&(b.aggregate_type.as_str(), b.aggregate_id))
        });
        streams.dedup();

        let mut versions: HashMap<AggregateRef, u64> = HashMap::with_capacity(streams.len());
        for stream in streams {
            lock_stream(&mut tx, &stream).await?;
            let current = current_version(&mut tx, &stream).await?;
            versions.insert(stream, current);
        }

        let now = Utc::now();
        let mut rows = Vec::with_capacity(records.len());
        for r in records {
            let version = match &r.aggregate {
                Some(a) => {
                    let v = versions.entry(a.clone()).or_insert(0);
                    *v += 1;
                    *v
                }
                None => 1,
            };
            let record = r.into_record(version, now)?;
            let metadata = serde_json::to_value(&record.metadata)?;
            rows.push((record, metadata));
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "INSERT INTO domain_events ({RECORD_COLUMNS}) "
        ));
        qb.push_values(rows.iter(), |mut b, (record, metadata)| {
            b.push_bind(*record.id.as_uuid())
                .push_bind(record.event_type.clone())
                .push_bind(record.aggregate_id.map(|id| *id.as_uuid()))
                .push_bind(record.aggregate_type.clone())
                .push_bind(record.event_data.clone())
                .push_bind(metadata.clone())
                .push_bind(record.occurred_at)
                .push_bind(record.created_at)
                .push_bind(record.version as i64)
                .push_bind(record.correlation_id.clone())
                .push_bind(record.caused_by.map(|id| id.to_string()))
                .push_bind(record.user_id.clone())
                .push_bind(record.session_id.clone());
        });

        // A primary-key clash can only be attributed to a single-record append.
        let single = match rows.as_slice() {
            [(record, _)] => Some(record.id),
            _ => None,
        };
        qb.build().execute(&mut *tx).await.map_err(|e| {
            map_insert_error(&e, single).unwrap_or_else(|| map_sqlx_error("insert_events", e))
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(rows.into_iter().map(|(r, _)| r.id).collect())
    }

    async fn count(&self, query: &EventQuery) -> Result<u64, PersistenceError> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM domain_events WHERE TRUE");
        push_filters(&mut qb, query);
        let row = qb
            .build()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_events", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| PersistenceError::Storage(format!("failed to read count: {e}")))?;
        Ok(total as u64)
    }
}

/// Serialize writers of one aggregate stream for the rest of the transaction.
async fn lock_stream(
    tx: &mut Transaction<'_, Postgres>,
    stream: &AggregateRef,
) -> Result<(), PersistenceError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("{}:{}", stream.aggregate_type, stream.aggregate_id))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stream", e))?;
    Ok(())
}

async fn current_version(
    tx: &mut Transaction<'_, Postgres>,
    stream: &AggregateRef,
) -> Result<u64, PersistenceError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(version), 0) AS current_version
        FROM domain_events
        WHERE aggregate_id = $1 AND aggregate_type = $2
        "#,
    )
    .bind(stream.aggregate_id.as_uuid())
    .bind(&stream.aggregate_type)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("current_version", e))?;

    let current: i64 = row
        .try_get("current_version")
        .map_err(|e| PersistenceError::Storage(format!("failed to read version: {e}")))?;
    Ok(current as u64)
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &EventQuery) {
    if !query.event_types.is_empty() {
        qb.push(" AND event_type = ANY(")
            .push_bind(query.event_types.clone())
            .push(")");
    }
    if !query.aggregate_ids.is_empty() {
        let ids: Vec<uuid::Uuid> = query.aggregate_ids.iter().map(|id| *id.as_uuid()).collect();
        qb.push(" AND aggregate_id = ANY(").push_bind(ids).push(")");
    }
    if let Some(kind) = &query.aggregate_type {
        qb.push(" AND aggregate_type = ").push_bind(kind.clone());
    }
    if let Some(from) = query.from {
        qb.push(" AND occurred_at >= ").push_bind(from);
    }
    if let Some(to) = query.to {
        qb.push(" AND occurred_at <= ").push_bind(to);
    }
    if let Some(user) = &query.user_id {
        qb.push(" AND user_id = ").push_bind(user.clone());
    }
    if let Some(correlation) = &query.correlation_id {
        qb.push(" AND correlation_id = ").push_bind(correlation.clone());
    }
    if let Some(priority) = query.priority {
        qb.push(" AND metadata->>'priority' = ").push_bind(priority.as_str());
    }
    if let Some(category) = query.category {
        qb.push(" AND metadata->>'category' = ").push_bind(category.as_str());
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::Database(db_err) => {
            PersistenceError::Storage(format!("database error in {operation}: {db_err}"))
        }
        sqlx::Error::PoolClosed => {
            PersistenceError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => PersistenceError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Unique violations become `Duplicate` (primary key) or `Conflict` (stream version).
fn map_insert_error(err: &sqlx::Error, event_id: Option<EventId>) -> Option<PersistenceError> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    if db_err.code().as_deref() != Some("23505") {
        return None;
    }
    match (db_err.constraint(), event_id) {
        (Some("domain_events_pkey"), Some(id)) => Some(PersistenceError::Duplicate(id)),
        _ => Some(PersistenceError::Conflict(db_err.message().to_string())),
    }
}

fn date_range_clause(qb: &mut QueryBuilder<'_, Postgres>, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) {
    if let Some(from) = from {
        qb.push(" AND occurred_at >= ").push_bind(from);
    }
    if let Some(to) = to {
        qb.push(" AND occurred_at <= ").push_bind(to);
    }
}

// SQLx row types
#[derive(Debug)]
struct EventRecordRow {
    id: uuid::Uuid,
    event_type: String,
    aggregate_id: Option<uuid::Uuid>,
    aggregate_type: Option<String>,
    event_data: JsonValue,
    metadata: JsonValue,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    version: i64,
    correlation_id: Option<String>,
    caused_by: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EventRecordRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRecordRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            event_data: row.try_get("event_data")?,
            metadata: row.try_get("metadata")?,
            occurred_at: row.try_get("occurred_at")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
            correlation_id: row.try_get("correlation_id")?,
            caused_by: row.try_get("caused_by")?,
            user_id: row.try_get("user_id")?,
            session_id: row.try_get("session_id")?,
        })
    }
}

impl TryFrom<EventRecordRow> for EventStoreRecord {
    type Error = PersistenceError;

    fn try_from(row: EventRecordRow) -> Result<Self, Self::Error> {
        let caused_by = row
            .caused_by
            .as_deref()
            .map(str::parse::<EventId>)
            .transpose()
            .map_err(|e| PersistenceError::Serialization(format!("bad caused_by on {}: {e}", row.id)))?;
        Ok(EventStoreRecord {
            id: EventId::from_uuid(row.id),
            event_type: row.event_type,
            aggregate_id: row.aggregate_id.map(AggregateId::from_uuid),
            aggregate_type: row.aggregate_type,
            event_data: row.event_data,
            metadata: serde_json::from_value(row.metadata)?,
            occurred_at: row.occurred_at,
            created_at: row.created_at,
            version: row.version as u64,
            correlation_id: row.correlation_id,
            caused_by,
            user_id: row.user_id,
            session_id: row.session_id,
        })
    }
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<EventStoreRecord>, PersistenceError> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let raw = EventRecordRow::from_row(&row)
            .map_err(|e| PersistenceError::Storage(format!("failed to deserialize event row: {e}")))?;
        records.push(raw.try_into()?);
    }
    Ok(records)
}

fn count_pairs<K>(
    rows: Vec<sqlx::postgres::PgRow>,
    key: &str,
) -> Result<Vec<(K, u64)>, PersistenceError>
where
    K: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    rows.into_iter()
        .map(|row| {
            let k: K = row
                .try_get(key)
                .map_err(|e| PersistenceError::Storage(format!("failed to read {key}: {e}")))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| PersistenceError::Storage(format!("failed to read count: {e}")))?;
            Ok((k, n as u64))
        })
        .collect()
}

#[async_trait::async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, record),
        fields(event_id = %record.event.id(), event_type = record.event.event_type()),
        err
    )]
    async fn save_event(&self, record: NewEventRecord) -> Result<EventId, PersistenceError> {
        self.append(vec![record])
            .await?
            .pop()
            .ok_or_else(|| PersistenceError::Storage("append returned no id".to_string()))
    }

    #[instrument(skip(self, records), fields(event_count = records.len()), err)]
    async fn save_events(&self, records: Vec<NewEventRecord>) -> Result<Vec<EventId>, PersistenceError> {
        self.append(records).await
    }

    #[instrument(skip(self, query), fields(result_count = tracing::field::Empty), err)]
    async fn query_events(&self, query: &EventQuery) -> Result<EventQueryResult, PersistenceError> {
        let total = self.count(query).await?;

        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {RECORD_COLUMNS} FROM domain_events WHERE TRUE"));
        push_filters(&mut qb, query);
        // Column and direction come from closed enums, never from input text.
        qb.push(format!(
            " ORDER BY {col} {dir}, id {dir}",
            col = query.sort_by.column(),
            dir = query.direction.keyword()
        ));
        qb.push(" LIMIT ")
            .push_bind(i64::from(query.pagination.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(query.pagination.offset));

        let rows = qb
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_events", e))?;
        let events = decode_rows(rows)?;

        Span::current().record("result_count", events.len());
        Ok(EventQueryResult::page(events, total, query.pagination))
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get_event_by_id(&self, id: EventId) -> Result<Option<EventStoreRecord>, PersistenceError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM domain_events WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_event_by_id", e))?;

        Ok(decode_rows(row.into_iter().collect())?.pop())
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn get_aggregate_events(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: Option<&str>,
        from_version: Option<u64>,
    ) -> Result<Vec<EventStoreRecord>, PersistenceError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM domain_events
            WHERE aggregate_id = $1
                AND ($2::text IS NULL OR aggregate_type = $2)
                AND ($3::bigint IS NULL OR version >= $3)
            ORDER BY version ASC, created_at ASC
            "#
        ))
        .bind(aggregate_id.as_uuid())
        .bind(aggregate_type)
        .bind(from_version.map(|v| v as i64))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_aggregate_events", e))?;

        decode_rows(rows)
    }

    #[instrument(skip(self), err)]
    async fn get_event_stats(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<EventStats, PersistenceError> {
        let grouped = |select: &str, group: &str| {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("SELECT {select}, COUNT(*) AS n FROM domain_events WHERE TRUE"));
            date_range_clause(&mut qb, from, to);
            qb.push(format!(" GROUP BY {group}"));
            qb
        };

        let mut by_type = grouped("event_type", "event_type");
        let by_type = by_type
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats_by_type", e))?;

        let mut by_category = grouped("metadata->>'category' AS category", "metadata->>'category'");
        let by_category = by_category
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats_by_category", e))?;

        let mut by_date = grouped("(occurred_at AT TIME ZONE 'UTC')::date AS day", "day");
        let by_date = by_date
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats_by_date", e))?;

        let mut users: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT user_id, COUNT(*) AS n FROM domain_events WHERE user_id IS NOT NULL",
        );
        date_range_clause(&mut users, from, to);
        users
            .push(" GROUP BY user_id ORDER BY n DESC, user_id ASC LIMIT ")
            .push_bind(TOP_USERS_LIMIT as i64);
        let users = users
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats_top_users", e))?;

        let events_by_type: Vec<(String, u64)> = count_pairs(by_type, "event_type")?;
        let events_by_category: Vec<(String, u64)> = count_pairs(by_category, "category")?;
        let events_by_date: Vec<(NaiveDate, u64)> = count_pairs(by_date, "day")?;
        let top_users: Vec<(String, u64)> = count_pairs(users, "user_id")?;

        Ok(EventStats {
            total_events: events_by_type.iter().map(|(_, n)| n).sum(),
            events_by_type: events_by_type.into_iter().collect(),
            events_by_category: events_by_category.into_iter().collect(),
            events_by_date: events_by_date.into_iter().collect(),
            top_users: top_users
                .into_iter()
                .map(|(user_id, event_count)| UserActivity {
                    user_id,
                    event_count,
                })
                .collect(),
        })
    }

    #[instrument(skip(self), fields(deleted = tracing::field::Empty), err)]
    async fn cleanup_expired_events(&self, older_than_days: u32) -> Result<u64, PersistenceError> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(older_than_days));
        let result = sqlx::query("DELETE FROM domain_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("cleanup_expired_events", e))?;

        Span::current().record("deleted", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StoreHealth {
        let row = sqlx::query("SELECT COUNT(*) AS total, MAX(created_at) AS last_event FROM domain_events")
            .fetch_one(&*self.pool)
            .await;

        let row = match row {
            Ok(row) => row,
            Err(e) => return StoreHealth::unhealthy(map_sqlx_error("health_check", e).to_string()),
        };
        let total: Result<i64, _> = row.try_get("total");
        let last: Result<Option<DateTime<Utc>>, _> = row.try_get("last_event");
        match (total, last) {
            (Ok(total), Ok(last_event_time)) => StoreHealth {
                healthy: true,
                total_events: total as u64,
                last_event_time,
                error: None,
            },
            (Err(e), _) | (_, Err(e)) => StoreHealth::unhealthy(format!("failed to read health row: {e}")),
        }
    }
}
