//! Postgres-backed event store implementation (feature `postgres`).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Concurrency` (sequence number taken) |
//! | Database (check violation) | `23514` | `InvalidAppend` |
//! | Database (other) | Any other | `Unavailable` |
//! | PoolClosed / Io / other | N/A | `Unavailable` |
//!
//! ## Runtime
//!
//! The [`EventStore`] trait is synchronous, like the rest of the engine. The
//! store owns a handle to a tokio runtime and blocks on it, so trait methods
//! must be called from plain threads (scheduler workers), never from inside
//! an async task.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;

use sagaflow_core::{AggregateId, ExpectedVersion};
use sagaflow_events::EventEnvelope;

use super::r#trait::{validate_batch, EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Schema for the `events` table. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id        UUID PRIMARY KEY,
    stream_id       UUID NOT NULL,
    aggregate_type  TEXT NOT NULL,
    sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type      TEXT NOT NULL,
    schema_version  INTEGER NOT NULL,
    occurred_at     TIMESTAMPTZ NOT NULL,
    data            JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (stream_id, sequence_number)
);
CREATE INDEX IF NOT EXISTS events_aggregate_type_idx ON events (aggregate_type, stream_id);
"#;

/// Postgres-backed append-only event store.
///
/// `append()` runs in one transaction: read the current stream version, check
/// it against the expectation, insert the batch. If another transaction
/// commits in between, the unique constraint on `(stream_id, sequence_number)`
/// rejects the insert and the append surfaces as a concurrency error.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Create the `events` table if it does not exist.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    pub async fn load_stream_async(
        &self,
        stream_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                stream_id,
                aggregate_type,
                sequence_number,
                event_type,
                schema_version,
                occurred_at,
                data
            FROM events
            WHERE stream_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(stream_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows.iter()
            .map(|row| {
                StoredEventRow::from_row(row)
                    .map(StoredEvent::from)
                    .map_err(|e| map_sqlx_error("decode_event_row", e))
            })
            .collect()
    }

    #[instrument(
        skip(self, events),
        fields(
            stream_id = %stream_id,
            event_count = events.len(),
            expected_version = ?expected_version
        ),
        err
    )]
    pub async fn append_async(
        &self,
        stream_id: AggregateId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some(aggregate_type) = validate_batch(stream_id, &events)? else {
            return Ok(vec![]);
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current_version, existing_type) = check_stream_version(&mut tx, stream_id).await?;

        if let Some(existing_type) = existing_type {
            if existing_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing_type}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        if !expected_version.matches(current_version) {
            return Err(EventStoreError::Concurrency {
                stream_id,
                expected: expected_version,
                actual: current_version,
            });
        }

        let mut committed = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let sequence_number = current_version + 1 + offset as u64;

            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    stream_id,
                    aggregate_type,
                    sequence_number,
                    event_type,
                    schema_version,
                    occurred_at,
                    data
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.event_id)
            .bind(stream_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(sequence_number as i64)
            .bind(event.envelope.event_type())
            .bind(event.envelope.schema_version() as i32)
            .bind(event.occurred_at)
            .bind(event.envelope.data())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    // Another writer committed this position after our version read.
                    EventStoreError::Concurrency {
                        stream_id,
                        expected: expected_version,
                        actual: sequence_number,
                    }
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            committed.push(StoredEvent {
                event_id: event.event_id,
                stream_id,
                aggregate_type: event.aggregate_type,
                sequence_number,
                occurred_at: event.occurred_at,
                envelope: event.envelope,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(committed)
    }

    pub async fn stream_ids_async(
        &self,
        aggregate_type: &str,
    ) -> Result<Vec<AggregateId>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT stream_id
            FROM events
            WHERE aggregate_type = $1 AND sequence_number = 1
            ORDER BY stream_id ASC
            "#,
        )
        .bind(aggregate_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stream_ids", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("stream_id")
                    .map(AggregateId::from_uuid)
                    .map_err(|e| map_sqlx_error("decode_stream_id", e))
            })
            .collect()
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        stream_id: AggregateId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.runtime
            .block_on(self.append_async(stream_id, events, expected_version))
    }

    fn load_stream(&self, stream_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.runtime.block_on(self.load_stream_async(stream_id))
    }

    fn stream_ids(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError> {
        self.runtime.block_on(self.stream_ids_async(aggregate_type))
    }
}

async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) AS current_version,
            MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE stream_id = $1
        "#,
    )
    .bind(stream_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: i64 = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("read_current_version", e))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| map_sqlx_error("read_aggregate_type", e))?;

    Ok((current_version.max(0) as u64, aggregate_type))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Unavailable(msg),
            }
        }
        other => EventStoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

struct StoredEventRow {
    event_id: uuid::Uuid,
    stream_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    schema_version: i32,
    occurred_at: DateTime<Utc>,
    data: serde_json::Value,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            stream_id: row.try_get("stream_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            schema_version: row.try_get("schema_version")?,
            occurred_at: row.try_get("occurred_at")?,
            data: row.try_get("data")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            stream_id: AggregateId::from_uuid(row.stream_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number.max(0) as u64,
            occurred_at: row.occurred_at,
            envelope: EventEnvelope::new(
                row.event_type,
                row.schema_version.max(0) as u32,
                row.data,
            ),
        }
    }
}
