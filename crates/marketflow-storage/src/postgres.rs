//! PostgreSQL adapter for the entity store.
//!
//! Plain reads and writes are single statements. A guarded write runs inside
//! one short adapter-level transaction that first takes a transaction-scoped
//! advisory lock per guard key, then evaluates the guards, then writes. Each
//! statement sees a fresh snapshot under READ COMMITTED, so a second writer
//! blocked on the same lock observes the first writer's committed rows.
//! Partial unique indexes back the two cardinality invariants
//! (one accepted bid, one pending transaction per job).

use crate::filter::{Clause, Field, FieldValue, Filter, Guard, Patch};
use crate::model::{
    BidRecord, BidStatus, Collection, JobRecord, JobStatus, Row, TransactionRecord,
    TransactionStatus,
};
use crate::traits::EntityStore;
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{QueryBuilder, Row as _};
use std::collections::BTreeSet;
use tracing::debug;

const JOB_COLUMNS: &str = "id, customer_id, title, status, created_at, updated_at";
const BID_COLUMNS: &str = "id, job_id, provider_id, price_minor, status, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, job_id, bid_id, amount_minor, commission_minor, \
     commission_rate_bps, status, created_at, updated_at";

/// PostgreSQL-backed entity store.
#[derive(Clone)]
pub struct PostgresEntityStore {
    pool: PgPool,
}

impl PostgresEntityStore {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS marketflow_jobs (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN
                    ('open', 'assigned', 'payment_pending', 'completed', 'cancelled')),
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS marketflow_bids (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES marketflow_jobs (id) ON DELETE CASCADE,
                provider_id TEXT NOT NULL,
                price_minor BIGINT NOT NULL CHECK (price_minor > 0),
                status TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'rejected')),
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS marketflow_transactions (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES marketflow_jobs (id) ON DELETE CASCADE,
                bid_id TEXT NULL,
                amount_minor BIGINT NOT NULL CHECK (amount_minor >= 0),
                commission_minor BIGINT NOT NULL CHECK (commission_minor >= 0),
                commission_rate_bps INTEGER NOT NULL,
                status TEXT NOT NULL CHECK (status IN
                    ('pending', 'refunded', 'cancelled', 'completed')),
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_marketflow_bids_job_id ON marketflow_bids (job_id)",
            "CREATE INDEX IF NOT EXISTS idx_marketflow_transactions_job_id ON marketflow_transactions (job_id)",
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_marketflow_bids_one_accepted \
                ON marketflow_bids (job_id) WHERE status = 'accepted'",
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_marketflow_transactions_one_pending \
                ON marketflow_transactions (job_id) WHERE status = 'pending'",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }

    async fn lock_guards(conn: &mut PgConnection, guards: &[Guard]) -> StorageResult<()> {
        let keys = guards.iter().map(Guard::lock_key).collect::<BTreeSet<_>>();
        for key in keys {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(&key)
                .execute(&mut *conn)
                .await
                .map_err(|e| StorageError::Backend(format!("advisory lock failed: {e}")))?;
        }
        Ok(())
    }

    async fn guards_hold(conn: &mut PgConnection, guards: &[Guard]) -> StorageResult<bool> {
        for guard in guards {
            let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM ");
            qb.push(table_name(guard.collection));
            push_where(&mut qb, guard.collection, &guard.filter);
            let count: i64 = qb
                .build()
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?
                .try_get(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let matching = usize::try_from(count).unwrap_or(usize::MAX);
            if !guard.holds(matching) {
                debug!(guard = %guard, matching, "guard rejected write");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn insert_row(conn: &mut PgConnection, row: &Row) -> StorageResult<()> {
        let query = match row {
            Row::Job(job) => sqlx::query(
                r#"
                INSERT INTO marketflow_jobs (id, customer_id, title, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(job.id.clone())
            .bind(job.customer_id.clone())
            .bind(job.title.clone())
            .bind(job.status.as_str())
            .bind(job.created_at)
            .bind(job.updated_at),
            Row::Bid(bid) => sqlx::query(
                r#"
                INSERT INTO marketflow_bids
                    (id, job_id, provider_id, price_minor, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(bid.id.clone())
            .bind(bid.job_id.clone())
            .bind(bid.provider_id.clone())
            .bind(bid.price_minor)
            .bind(bid.status.as_str())
            .bind(bid.created_at)
            .bind(bid.updated_at),
            Row::Transaction(tx) => sqlx::query(
                r#"
                INSERT INTO marketflow_transactions
                    (id, job_id, bid_id, amount_minor, commission_minor, commission_rate_bps,
                     status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(tx.id.clone())
            .bind(tx.job_id.clone())
            .bind(tx.bid_id.clone())
            .bind(tx.amount_minor)
            .bind(tx.commission_minor)
            .bind(i32::try_from(tx.commission_rate_bps).map_err(|_| {
                StorageError::ConstraintViolation("commission rate out of range".to_string())
            })?)
            .bind(tx.status.as_str())
            .bind(tx.created_at)
            .bind(tx.updated_at),
        };

        query.execute(&mut *conn).await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn update_rows(
        conn: &mut PgConnection,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> StorageResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE ");
        qb.push(table_name(collection));
        qb.push(" SET ");
        for (field, value) in patch.sets() {
            check_writable(collection, *field, value)?;
            qb.push(field.column());
            qb.push(" = ");
            push_value(&mut qb, value);
            qb.push(", ");
        }
        qb.push("updated_at = ");
        qb.push_bind(Utc::now());
        push_where(&mut qb, collection, filter);

        let result = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EntityStore for PostgresEntityStore {
    async fn get_by_id(&self, collection: Collection, id: &str) -> StorageResult<Option<Row>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = $1",
            select_columns(collection),
            table_name(collection)
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.map(|row| decode_row(collection, &row)).transpose()
    }

    async fn get_by_filter(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> StorageResult<Vec<Row>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT ");
        qb.push(select_columns(collection));
        qb.push(" FROM ");
        qb.push(table_name(collection));
        push_where(&mut qb, collection, filter);
        qb.push(" ORDER BY created_at ASC, id ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.iter().map(|row| decode_row(collection, row)).collect()
    }

    async fn insert(&self, row: Row, guards: &[Guard]) -> StorageResult<Row> {
        row.validate()?;

        if guards.is_empty() {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Self::insert_row(&mut conn, &row).await?;
            return Ok(row);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::lock_guards(&mut tx, guards).await?;
        if !Self::guards_hold(&mut tx, guards).await? {
            let rendered = guards
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StorageError::Conflict(format!(
                "insert guard rejected: {rendered}"
            )));
        }
        Self::insert_row(&mut tx, &row).await?;
        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(row)
    }

    async fn update(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
        guards: &[Guard],
    ) -> StorageResult<u64> {
        if patch.is_empty() {
            return Err(StorageError::InvalidInput("empty patch".to_string()));
        }

        if guards.is_empty() {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            return Self::update_rows(&mut conn, collection, filter, patch).await;
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::lock_guards(&mut tx, guards).await?;
        if !Self::guards_hold(&mut tx, guards).await? {
            return Ok(0);
        }
        let matched = Self::update_rows(&mut tx, collection, filter, patch).await?;
        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(matched)
    }

    async fn delete(&self, collection: Collection, filter: &Filter) -> StorageResult<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM ");
        qb.push(table_name(collection));
        push_where(&mut qb, collection, filter);
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

fn table_name(collection: Collection) -> &'static str {
    match collection {
        Collection::Jobs => "marketflow_jobs",
        Collection::Bids => "marketflow_bids",
        Collection::Transactions => "marketflow_transactions",
    }
}

fn select_columns(collection: Collection) -> &'static str {
    match collection {
        Collection::Jobs => JOB_COLUMNS,
        Collection::Bids => BID_COLUMNS,
        Collection::Transactions => TRANSACTION_COLUMNS,
    }
}

fn has_column(collection: Collection, field: Field) -> bool {
    matches!(
        (collection, field),
        (_, Field::Id)
            | (Collection::Jobs, Field::CustomerId | Field::Status)
            | (
                Collection::Bids,
                Field::JobId | Field::ProviderId | Field::Status | Field::Price
            )
            | (Collection::Transactions, Field::JobId | Field::Status)
    )
}

fn check_writable(collection: Collection, field: Field, value: &FieldValue) -> StorageResult<()> {
    match (collection, field, value) {
        (Collection::Jobs, Field::Status, FieldValue::Text(raw)) => {
            JobStatus::parse(raw).map(|_| ())
        }
        (Collection::Bids, Field::Status, FieldValue::Text(raw)) => {
            BidStatus::parse(raw).map(|_| ())
        }
        (Collection::Transactions, Field::Status, FieldValue::Text(raw)) => {
            TransactionStatus::parse(raw).map(|_| ())
        }
        (Collection::Bids, Field::Price, FieldValue::Int(price)) if *price > 0 => Ok(()),
        (Collection::Bids, Field::Price, FieldValue::Int(price)) => Err(
            StorageError::ConstraintViolation(format!("bid price must be positive, got {price}")),
        ),
        _ => Err(StorageError::ConstraintViolation(format!(
            "field '{}' is not writable on {}",
            field.column(),
            collection
        ))),
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &FieldValue) {
    match value {
        FieldValue::Text(text) => {
            qb.push_bind(text.clone());
        }
        FieldValue::Int(int) => {
            qb.push_bind(*int);
        }
    }
}

fn push_where(qb: &mut QueryBuilder<'_, Postgres>, collection: Collection, filter: &Filter) {
    if filter.clauses().is_empty() {
        return;
    }
    qb.push(" WHERE ");
    for (idx, clause) in filter.clauses().iter().enumerate() {
        if idx > 0 {
            qb.push(" AND ");
        }
        let field = match clause {
            Clause::Eq(field, _) | Clause::Ne(field, _) | Clause::In(field, _) => *field,
        };
        // Mirror the in-memory semantics: a clause on a missing column matches nothing.
        if !has_column(collection, field) {
            qb.push("FALSE");
            continue;
        }
        match clause {
            Clause::Eq(field, value) => {
                qb.push(field.column());
                qb.push(" = ");
                push_value(qb, value);
            }
            Clause::Ne(field, value) => {
                qb.push(field.column());
                qb.push(" <> ");
                push_value(qb, value);
            }
            Clause::In(_, values) if values.is_empty() => {
                qb.push("FALSE");
            }
            Clause::In(field, values) => {
                qb.push(field.column());
                qb.push(" IN (");
                for (value_idx, value) in values.iter().enumerate() {
                    if value_idx > 0 {
                        qb.push(", ");
                    }
                    push_value(qb, value);
                }
                qb.push(")");
            }
        }
    }
}

fn decode_row(collection: Collection, row: &PgRow) -> StorageResult<Row> {
    let decoded = match collection {
        Collection::Jobs => Row::Job(JobRecord {
            id: column(row, "id")?,
            customer_id: column(row, "customer_id")?,
            title: column(row, "title")?,
            status: JobStatus::parse(&column::<String>(row, "status")?)?,
            created_at: column(row, "created_at")?,
            updated_at: column(row, "updated_at")?,
        }),
        Collection::Bids => Row::Bid(BidRecord {
            id: column(row, "id")?,
            job_id: column(row, "job_id")?,
            provider_id: column(row, "provider_id")?,
            price_minor: column(row, "price_minor")?,
            status: BidStatus::parse(&column::<String>(row, "status")?)?,
            created_at: column(row, "created_at")?,
            updated_at: column(row, "updated_at")?,
        }),
        Collection::Transactions => {
            let rate: i32 = column(row, "commission_rate_bps")?;
            Row::Transaction(TransactionRecord {
                id: column(row, "id")?,
                job_id: column(row, "job_id")?,
                bid_id: column(row, "bid_id")?,
                amount_minor: column(row, "amount_minor")?,
                commission_minor: column(row, "commission_minor")?,
                commission_rate_bps: u32::try_from(rate).map_err(|_| {
                    StorageError::Serialization(format!("negative commission rate {rate}"))
                })?,
                status: TransactionStatus::parse(&column::<String>(row, "status")?)?,
                created_at: column(row, "created_at")?,
                updated_at: column(row, "updated_at")?,
            })
        }
    };
    Ok(decoded)
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> StorageResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StorageError::Serialization(format!("postgres decode {name} failed: {e}")))
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") => return StorageError::Conflict(db_err.message().to_string()),
            Some("23503") | Some("23514") => {
                return StorageError::ConstraintViolation(db_err.message().to_string())
            }
            _ => {}
        }
    }
    StorageError::Backend(err.to_string())
}
