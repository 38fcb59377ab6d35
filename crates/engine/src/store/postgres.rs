//! Postgres-backed chunk store.
//!
//! Chunks and instances live in two tables; chunks reference their instance
//! with `ON DELETE CASCADE`. Status changes are a single conditional
//! `UPDATE ... WHERE id = $1 AND status = $2`, so the compare-and-swap is
//! enforced by the database and holds across processes.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | ChunkStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation on `(instance, step, sequence)`) | `23505` | `DuplicateSequence` |
//! | Database (unique violation on primary key) | `23505` | `DuplicateChunk` / `DuplicateInstance` |
//! | Database (foreign key violation on insert) | `23503` | `InstanceNotFound` |
//! | Anything else | * | `Storage` |
//!
//! ## Runtime
//!
//! The [`ChunkStore`] trait is synchronous. Each store owns a Tokio runtime and
//! blocks on it, so the trait methods must not be called from inside an async
//! context. Async callers use the inherent `*_async` methods directly.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tokio::runtime::Runtime;
use tracing::instrument;
use uuid::Uuid;

use batchgate_core::{
    ChunkId, JobInstanceId, NewWorkChunk, StatusChange, StepId, WorkChunk, WorkChunkStatus,
};

use super::{check_transition, ChunkCursor, ChunkStore, ChunkStoreError};
use crate::definition::JobDefinitionKey;
use crate::instance::{JobInstance, JobInstanceStatus};

/// DDL for the two tables. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batch_job_instances (
    id                 UUID PRIMARY KEY,
    definition_name    TEXT NOT NULL,
    definition_version INTEGER NOT NULL,
    status             TEXT NOT NULL,
    degraded           BOOLEAN NOT NULL DEFAULT FALSE,
    sealed_steps       TEXT[] NOT NULL DEFAULT '{}',
    created_at         TIMESTAMPTZ NOT NULL,
    updated_at         TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_work_chunks (
    id                UUID PRIMARY KEY,
    instance_id       UUID NOT NULL REFERENCES batch_job_instances (id) ON DELETE CASCADE,
    target_step_id    TEXT NOT NULL,
    step_ordinal      INTEGER NOT NULL CHECK (step_ordinal >= 0),
    sequence          INTEGER NOT NULL CHECK (sequence >= 0),
    parent_chunk_id   UUID NULL,
    status            TEXT NOT NULL,
    data              JSONB NULL,
    records_processed BIGINT NOT NULL DEFAULT 0,
    records_errored   BIGINT NOT NULL DEFAULT 0,
    error_count       INTEGER NOT NULL DEFAULT 0,
    error_message     TEXT NULL,
    created_at        TIMESTAMPTZ NOT NULL,
    started_at        TIMESTAMPTZ NULL,
    ended_at          TIMESTAMPTZ NULL,
    updated_at        TIMESTAMPTZ NOT NULL,
    CONSTRAINT batch_work_chunks_step_sequence_key UNIQUE (instance_id, target_step_id, sequence)
);

CREATE INDEX IF NOT EXISTS batch_work_chunks_order_idx
    ON batch_work_chunks (instance_id, step_ordinal, sequence, id);
"#;

const CHUNK_COLUMNS: &str = "id, instance_id, target_step_id, step_ordinal, sequence, \
     parent_chunk_id, status, records_processed, records_errored, error_count, error_message, \
     created_at, started_at, ended_at, updated_at";

/// Postgres chunk store. Cheap to clone; clones share the pool and runtime.
#[derive(Debug, Clone)]
pub struct PostgresChunkStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PostgresChunkStore {
    /// Build a runtime, connect to `database_url` and return the store.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, ChunkStoreError> {
        let runtime = Runtime::new()
            .map_err(|e| ChunkStoreError::storage(format!("failed to start runtime: {e}")))?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::from_parts(pool, Arc::new(runtime)))
    }

    pub fn from_parts(pool: PgPool, runtime: Arc<Runtime>) -> Self {
        Self { pool, runtime }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing.
    pub fn migrate(&self) -> Result<(), ChunkStoreError> {
        self.runtime.block_on(self.migrate_async())
    }

    pub async fn migrate_async(&self) -> Result<(), ChunkStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self, instance), fields(job_instance_id = %instance.id), err)]
    pub async fn create_instance_async(
        &self,
        instance: JobInstance,
    ) -> Result<JobInstanceId, ChunkStoreError> {
        let sealed: Vec<String> = instance
            .sealed_steps
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO batch_job_instances (
                id, definition_name, definition_version, status, degraded,
                sealed_steps, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(instance.id.as_uuid())
        .bind(&instance.definition.name)
        .bind(instance.definition.version as i32)
        .bind(instance.status.to_string())
        .bind(instance.degraded)
        .bind(&sealed)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match classify_sqlx_error("create_instance", e) {
            DbFailure::KeyTaken => ChunkStoreError::DuplicateInstance(instance.id),
            DbFailure::Other(err) => err,
            DbFailure::SequenceTaken | DbFailure::MissingInstance => {
                ChunkStoreError::storage("unexpected constraint violation in create_instance")
            }
        })?;
        Ok(instance.id)
    }

    #[instrument(skip(self), fields(job_instance_id = %id), err)]
    pub async fn fetch_instance_async(
        &self,
        id: JobInstanceId,
    ) -> Result<Option<JobInstance>, ChunkStoreError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT id, definition_name, definition_version, status, degraded,
                   sealed_steps, created_at, updated_at
            FROM batch_job_instances
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_instance", e))?;
        row.map(InstanceRow::into_instance).transpose()
    }

    #[instrument(skip(self, instance), fields(job_instance_id = %instance.id), err)]
    pub async fn update_instance_async(&self, instance: &JobInstance) -> Result<(), ChunkStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_job_instances
            SET status = $2, degraded = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(instance.id.as_uuid())
        .bind(instance.status.to_string())
        .bind(instance.degraded)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_instance", e))?;
        if result.rows_affected() == 0 {
            return Err(ChunkStoreError::InstanceNotFound(instance.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_instance_id = %id), err)]
    pub async fn delete_instance_async(&self, id: JobInstanceId) -> Result<usize, ChunkStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let chunks: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM batch_work_chunks WHERE instance_id = $1")
                .bind(id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_instance", e))?;

        let result = sqlx::query("DELETE FROM batch_job_instances WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_instance", e))?;
        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(ChunkStoreError::InstanceNotFound(id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(chunks as usize)
    }

    pub async fn list_active_instances_async(&self) -> Result<Vec<JobInstanceId>, ChunkStoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM batch_job_instances
            WHERE status <> 'COMPLETED'
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_active_instances", e))?;
        Ok(ids.into_iter().map(JobInstanceId::from_uuid).collect())
    }

    #[instrument(skip(self), fields(job_instance_id = %id, step = %step), err)]
    pub async fn seal_step_async(
        &self,
        id: JobInstanceId,
        step: &StepId,
    ) -> Result<bool, ChunkStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_job_instances
            SET sealed_steps = array_append(sealed_steps, $2), updated_at = NOW()
            WHERE id = $1 AND NOT ($2 = ANY (sealed_steps))
            "#,
        )
        .bind(id.as_uuid())
        .bind(step.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("seal_step", e))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.fetch_instance_async(id).await? {
            Some(_) => Ok(false),
            None => Err(ChunkStoreError::InstanceNotFound(id)),
        }
    }

    #[instrument(
        skip(self, new),
        fields(job_instance_id = %new.job_instance_id, chunk_id = %new.id, step = %new.target_step_id),
        err
    )]
    pub async fn create_chunk_async(&self, new: NewWorkChunk) -> Result<ChunkId, ChunkStoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO batch_work_chunks (
                id, instance_id, target_step_id, step_ordinal, sequence,
                parent_chunk_id, status, data, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            "#,
        )
        .bind(new.id.as_uuid())
        .bind(new.job_instance_id.as_uuid())
        .bind(new.target_step_id.as_str())
        .bind(new.step_ordinal as i32)
        .bind(new.sequence as i32)
        .bind(new.parent_chunk_id.map(|p| *p.as_uuid()))
        .bind(new.initial_status.as_str())
        .bind(&new.data)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match classify_sqlx_error("create_chunk", e) {
            DbFailure::SequenceTaken => ChunkStoreError::DuplicateSequence {
                step: new.target_step_id.clone(),
                sequence: new.sequence,
            },
            DbFailure::KeyTaken => ChunkStoreError::DuplicateChunk(new.id),
            DbFailure::MissingInstance => ChunkStoreError::InstanceNotFound(new.job_instance_id),
            DbFailure::Other(err) => err,
        })?;
        Ok(new.id)
    }

    pub async fn fetch_chunk_async(
        &self,
        id: ChunkId,
        include_data: bool,
    ) -> Result<Option<WorkChunk>, ChunkStoreError> {
        let sql = format!(
            "SELECT {CHUNK_COLUMNS}, {} AS data FROM batch_work_chunks WHERE id = $1",
            data_column(include_data)
        );
        let row = sqlx::query_as::<_, ChunkRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_chunk", e))?;
        row.map(ChunkRow::into_chunk).transpose()
    }

    /// Conditional update. Side columns are written in the same statement as
    /// the status so a losing caller changes nothing.
    #[instrument(skip(self, change), fields(chunk_id = %id, from = %expected, to = %new), err)]
    pub async fn update_chunk_status_async(
        &self,
        id: ChunkId,
        expected: WorkChunkStatus,
        new: WorkChunkStatus,
        change: &StatusChange,
    ) -> Result<usize, ChunkStoreError> {
        check_transition(expected, new)?;
        let ends = matches!(
            new,
            WorkChunkStatus::Completed | WorkChunkStatus::Errored | WorkChunkStatus::Failed
        );
        let result = sqlx::query(
            r#"
            UPDATE batch_work_chunks
            SET status = $3,
                updated_at = NOW(),
                started_at = CASE WHEN $3 = 'IN_PROGRESS' THEN NOW() ELSE started_at END,
                ended_at = CASE WHEN $4 THEN NOW() ELSE ended_at END,
                records_processed = CASE WHEN $4 AND $5::BIGINT IS NOT NULL THEN $5 ELSE records_processed END,
                records_errored = CASE WHEN $4 AND $6::BIGINT IS NOT NULL THEN $6 ELSE records_errored END,
                error_count = CASE WHEN $3 = 'ERRORED' THEN error_count + 1 ELSE error_count END,
                error_message = CASE WHEN $4 AND $7::TEXT IS NOT NULL THEN $7 ELSE error_message END
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(new.as_str())
        .bind(ends)
        .bind(change.records.map(|r| r.processed as i64))
        .bind(change.records.map(|r| r.errored as i64))
        .bind(change.error_message.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_chunk_status", e))?;
        Ok(result.rows_affected() as usize)
    }

    pub async fn fetch_chunk_page_async(
        &self,
        instance: JobInstanceId,
        include_data: bool,
        after: Option<&ChunkCursor>,
        limit: usize,
    ) -> Result<Vec<WorkChunk>, ChunkStoreError> {
        let data = data_column(include_data);
        let rows = match after {
            None => {
                let sql = format!(
                    "SELECT {CHUNK_COLUMNS}, {data} AS data FROM batch_work_chunks \
                     WHERE instance_id = $1 \
                     ORDER BY step_ordinal, sequence, id LIMIT $2"
                );
                sqlx::query_as::<_, ChunkRow>(&sql)
                    .bind(instance.as_uuid())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            Some(cursor) => {
                let sql = format!(
                    "SELECT {CHUNK_COLUMNS}, {data} AS data FROM batch_work_chunks \
                     WHERE instance_id = $1 AND (step_ordinal, sequence, id) > ($2, $3, $4) \
                     ORDER BY step_ordinal, sequence, id LIMIT $5"
                );
                sqlx::query_as::<_, ChunkRow>(&sql)
                    .bind(instance.as_uuid())
                    .bind(cursor.step_ordinal as i32)
                    .bind(cursor.sequence as i32)
                    .bind(cursor.chunk_id.as_uuid())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| map_sqlx_error("fetch_chunk_page", e))?;

        rows.into_iter().map(ChunkRow::into_chunk).collect()
    }

    pub async fn count_chunks_by_step_and_status_async(
        &self,
        instance: JobInstanceId,
        step: &StepId,
        status: WorkChunkStatus,
    ) -> Result<usize, ChunkStoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM batch_work_chunks
            WHERE instance_id = $1 AND target_step_id = $2 AND status = $3
            "#,
        )
        .bind(instance.as_uuid())
        .bind(step.as_str())
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_chunks_by_step_and_status", e))?;
        Ok(count as usize)
    }

    pub async fn max_sequence_async(
        &self,
        instance: JobInstanceId,
        step: &StepId,
    ) -> Result<Option<u32>, ChunkStoreError> {
        let max: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT MAX(sequence) FROM batch_work_chunks
            WHERE instance_id = $1 AND target_step_id = $2
            "#,
        )
        .bind(instance.as_uuid())
        .bind(step.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("max_sequence", e))?;
        Ok(max.map(|m| m as u32))
    }
}

impl ChunkStore for PostgresChunkStore {
    fn create_instance(&self, instance: JobInstance) -> Result<JobInstanceId, ChunkStoreError> {
        self.runtime.block_on(self.create_instance_async(instance))
    }

    fn fetch_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, ChunkStoreError> {
        self.runtime.block_on(self.fetch_instance_async(id))
    }

    fn update_instance(&self, instance: &JobInstance) -> Result<(), ChunkStoreError> {
        self.runtime.block_on(self.update_instance_async(instance))
    }

    fn delete_instance(&self, id: JobInstanceId) -> Result<usize, ChunkStoreError> {
        self.runtime.block_on(self.delete_instance_async(id))
    }

    fn list_active_instances(&self) -> Result<Vec<JobInstanceId>, ChunkStoreError> {
        self.runtime.block_on(self.list_active_instances_async())
    }

    fn seal_step(&self, id: JobInstanceId, step: &StepId) -> Result<bool, ChunkStoreError> {
        self.runtime.block_on(self.seal_step_async(id, step))
    }

    fn create_chunk(&self, chunk: NewWorkChunk) -> Result<ChunkId, ChunkStoreError> {
        self.runtime.block_on(self.create_chunk_async(chunk))
    }

    fn fetch_chunk(
        &self,
        id: ChunkId,
        include_data: bool,
    ) -> Result<Option<WorkChunk>, ChunkStoreError> {
        self.runtime.block_on(self.fetch_chunk_async(id, include_data))
    }

    fn update_chunk_status(
        &self,
        id: ChunkId,
        expected: WorkChunkStatus,
        new: WorkChunkStatus,
        change: &StatusChange,
    ) -> Result<usize, ChunkStoreError> {
        self.runtime
            .block_on(self.update_chunk_status_async(id, expected, new, change))
    }

    fn fetch_chunk_page(
        &self,
        instance: JobInstanceId,
        include_data: bool,
        after: Option<&ChunkCursor>,
        limit: usize,
    ) -> Result<Vec<WorkChunk>, ChunkStoreError> {
        self.runtime
            .block_on(self.fetch_chunk_page_async(instance, include_data, after, limit))
    }

    fn count_chunks_by_step_and_status(
        &self,
        instance: JobInstanceId,
        step: &StepId,
        status: WorkChunkStatus,
    ) -> Result<usize, ChunkStoreError> {
        self.runtime
            .block_on(self.count_chunks_by_step_and_status_async(instance, step, status))
    }

    fn max_sequence(
        &self,
        instance: JobInstanceId,
        step: &StepId,
    ) -> Result<Option<u32>, ChunkStoreError> {
        self.runtime.block_on(self.max_sequence_async(instance, step))
    }
}

fn data_column(include_data: bool) -> &'static str {
    if include_data { "data" } else { "NULL::JSONB" }
}

#[derive(Debug, FromRow)]
struct InstanceRow {
    id: Uuid,
    definition_name: String,
    definition_version: i32,
    status: String,
    degraded: bool,
    sealed_steps: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InstanceRow {
    fn into_instance(self) -> Result<JobInstance, ChunkStoreError> {
        let status = match self.status.as_str() {
            "CREATED" => JobInstanceStatus::Created,
            "RUNNING" => JobInstanceStatus::Running,
            "COMPLETED" => JobInstanceStatus::Completed,
            other => {
                return Err(ChunkStoreError::storage(format!(
                    "unknown job instance status in row: {other}"
                )));
            }
        };
        let sealed_steps = self
            .sealed_steps
            .into_iter()
            .map(StepId::parse)
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(|e| ChunkStoreError::storage(format!("invalid sealed step in row: {e}")))?;
        Ok(JobInstance {
            id: JobInstanceId::from_uuid(self.id),
            definition: JobDefinitionKey::new(self.definition_name, self.definition_version as u32),
            status,
            degraded: self.degraded,
            sealed_steps,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ChunkRow {
    id: Uuid,
    instance_id: Uuid,
    target_step_id: String,
    step_ordinal: i32,
    sequence: i32,
    parent_chunk_id: Option<Uuid>,
    status: String,
    data: Option<serde_json::Value>,
    records_processed: i64,
    records_errored: i64,
    error_count: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl ChunkRow {
    fn into_chunk(self) -> Result<WorkChunk, ChunkStoreError> {
        let status = self
            .status
            .parse::<WorkChunkStatus>()
            .map_err(|e| ChunkStoreError::storage(format!("failed to deserialize chunk row: {e}")))?;
        let target_step_id = StepId::parse(self.target_step_id)
            .map_err(|e| ChunkStoreError::storage(format!("failed to deserialize chunk row: {e}")))?;
        Ok(WorkChunk {
            id: ChunkId::from_uuid(self.id),
            job_instance_id: JobInstanceId::from_uuid(self.instance_id),
            target_step_id,
            step_ordinal: self.step_ordinal as u32,
            sequence: self.sequence as u32,
            parent_chunk_id: self.parent_chunk_id.map(ChunkId::from_uuid),
            status,
            data: self.data,
            records_processed: self.records_processed as u64,
            records_errored: self.records_errored as u64,
            error_count: self.error_count as u32,
            error_message: self.error_message,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            updated_at: self.updated_at,
        })
    }
}

/// Integrity failures reported by the database, before the caller attaches
/// the identities it knows about.
enum DbFailure {
    SequenceTaken,
    KeyTaken,
    MissingInstance,
    Other(ChunkStoreError),
}

fn classify_sqlx_error(operation: &str, err: sqlx::Error) -> DbFailure {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") if db_err.constraint() == Some("batch_work_chunks_step_sequence_key") => {
                return DbFailure::SequenceTaken;
            }
            Some("23505") => return DbFailure::KeyTaken,
            Some("23503") => return DbFailure::MissingInstance,
            _ => {}
        }
    }
    DbFailure::Other(map_sqlx_error(operation, err))
}

/// Map SQLx errors to ChunkStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ChunkStoreError {
    match err {
        sqlx::Error::Database(db_err) => ChunkStoreError::storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            ChunkStoreError::storage(format!("connection pool closed in {}", operation))
        }
        _ => ChunkStoreError::storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
