//! SQLite-backed job-scoped KV client.
//!
//! Rows of every job share one table keyed by `(job_id, meta_key)`. The
//! client owns no connection of its own; it borrows from the shared
//! `SqlitePool` per call, and a transaction holds one pooled connection for
//! the duration of its commit.
//!
//! Features:
//! - WAL mode and a busy timeout for concurrent writers
//! - Upsert via `ON CONFLICT DO UPDATE`
//! - Range, prefix and from-key scans over `BLOB` keys (byte order)

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqliteConnection;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::epoch::{create_epoch_table, SqlEpochClient};
use crate::error::{MetaError, Result};
use crate::op::{
    display_key, DeleteResponse, GetResponse, KeyValue, Op, OpKind, OpOption, PutResponse,
    ResponseOp, TxnResponse, MAX_KEY_LENGTH,
};
use crate::store::{validate_table_name, JobId, KvClient, Txn};
use crate::txn::{TxnBuffer, TxnStatus};

/// Table used when no table scope is given.
pub const DEFAULT_KV_TABLE: &str = "meta_kv";

/// Opens every write transaction.
///
/// Takes the write lock up front, so concurrent read-then-write
/// transactions queue on the busy timeout instead of failing the
/// lock upgrade with `SQLITE_BUSY`.
pub(crate) const BEGIN_IMMEDIATE: &str = "BEGIN IMMEDIATE";

/// Timeout for the initialization run by [`SqlKvClient::connect`].
const INIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Current Unix timestamp in seconds.
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Open or create a SQLite database file and return a pool for it.
pub async fn open_pool(
    path: impl AsRef<Path>,
    max_connections: u32,
    busy_timeout: Duration,
) -> Result<SqlitePool> {
    let path = path.as_ref();
    info!("Opening SQLite meta store at {:?}", path);

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .map_err(|e| MetaError::ParamsInvalid(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create a pool over a private in-memory database (for testing).
///
/// The pool keeps exactly one connection alive for its whole lifetime,
/// since every SQLite in-memory connection is its own database.
pub async fn memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| MetaError::ParamsInvalid(e.to_string()))?;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// SQL statements specialised for one table.
#[derive(Debug)]
struct Statements {
    table: String,
    create: String,
    upsert: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                job_id TEXT NOT NULL,
                meta_key BLOB NOT NULL,
                meta_value BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (job_id, meta_key),
                CHECK (length(meta_key) <= {MAX_KEY_LENGTH})
            )
            "#
        );
        let upsert = format!(
            r#"
            INSERT INTO {table} (job_id, meta_key, meta_value, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(job_id, meta_key) DO UPDATE SET
                meta_value = excluded.meta_value,
                updated_at = excluded.updated_at
            "#
        );
        Self {
            table: table.to_string(),
            create,
            upsert,
        }
    }

    fn select(&self, clause: &str) -> String {
        format!(
            "SELECT meta_key, meta_value FROM {} WHERE job_id = ? AND {} ORDER BY meta_key",
            self.table, clause
        )
    }

    fn delete(&self, clause: &str) -> String {
        format!("DELETE FROM {} WHERE job_id = ? AND {}", self.table, clause)
    }
}

/// Job-scoped KV client over a shared SQLite pool.
#[derive(Debug, Clone)]
pub struct SqlKvClient {
    pool: SqlitePool,
    job_id: JobId,
    statements: std::sync::Arc<Statements>,
    epoch: SqlEpochClient,
}

impl SqlKvClient {
    /// Create a client for `job_id` over `table`.
    ///
    /// An empty `table` selects [`DEFAULT_KV_TABLE`]. [`KvClient::initialize`]
    /// must run before the first operation; see [`SqlKvClient::connect`].
    pub fn new(pool: &SqlitePool, table: &str, job_id: impl Into<JobId>) -> Result<Self> {
        if pool.is_closed() {
            return Err(MetaError::ParamsInvalid("input db is closed".to_string()));
        }
        let table = if table.is_empty() {
            DEFAULT_KV_TABLE
        } else {
            table
        };
        validate_table_name(table)?;

        let job_id = job_id.into();
        Ok(Self {
            pool: pool.clone(),
            statements: std::sync::Arc::new(Statements::new(table)),
            epoch: SqlEpochClient::new(pool.clone(), job_id.clone()),
            job_id,
        })
    }

    /// Create and initialize a client, bounded by a short timeout.
    pub async fn connect(pool: &SqlitePool, table: &str, job_id: impl Into<JobId>) -> Result<Self> {
        let client = Self::new(pool, table, job_id)?;
        let ctx = Context::background().with_timeout(INIT_TIMEOUT);
        client.initialize(&ctx).await?;
        Ok(client)
    }

    /// Table this client reads and writes.
    pub fn table(&self) -> &str {
        &self.statements.table
    }

    async fn do_put(&self, conn: &mut SqliteConnection, op: &Op) -> Result<PutResponse> {
        op.check_valid()?;
        let now = now_unix();
        sqlx::query(&self.statements.upsert)
            .bind(&self.job_id)
            .bind(op.key())
            .bind(op.value())
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        Ok(PutResponse::default())
    }

    async fn do_get(&self, conn: &mut SqliteConnection, op: &Op) -> Result<GetResponse> {
        let range = op.key_range()?;
        let predicate = range.predicate();
        let sql = self.statements.select(predicate.clause);

        let mut query = sqlx::query_as::<_, (Vec<u8>, Vec<u8>)>(&sql).bind(&self.job_id);
        for arg in predicate.args {
            query = query.bind(arg);
        }

        let rows = query.fetch_all(&mut *conn).await?;
        if range.is_exact() && rows.is_empty() {
            return Err(MetaError::NotFound(display_key(op.key())));
        }

        Ok(GetResponse {
            kvs: rows
                .into_iter()
                .map(|(key, value)| KeyValue { key, value })
                .collect(),
        })
    }

    async fn do_delete(&self, conn: &mut SqliteConnection, op: &Op) -> Result<DeleteResponse> {
        let predicate = op.key_range()?.predicate();
        let sql = self.statements.delete(predicate.clause);

        let mut query = sqlx::query(&sql).bind(&self.job_id);
        for arg in predicate.args {
            query = query.bind(arg);
        }

        let result = query.execute(&mut *conn).await?;
        Ok(DeleteResponse {
            deleted: result.rows_affected(),
        })
    }
}

#[async_trait]
impl KvClient for SqlKvClient {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    async fn initialize(&self, ctx: &Context) -> Result<()> {
        ctx.run(async {
            let mut conn = self.pool.acquire().await?;
            create_epoch_table(&mut conn).await?;
            sqlx::query(&self.statements.create)
                .execute(&mut *conn)
                .await?;
            debug!(table = %self.statements.table, "meta kv table initialized");
            Ok::<_, MetaError>(())
        })
        .await
    }

    async fn put(&self, ctx: &Context, key: &[u8], value: &[u8]) -> Result<PutResponse> {
        let op = Op::put(key, value);
        ctx.run(async {
            let mut conn = self.pool.acquire().await?;
            self.do_put(&mut conn, &op).await
        })
        .await
    }

    async fn get(&self, ctx: &Context, key: &[u8], opts: &[OpOption]) -> Result<GetResponse> {
        let op = Op::get(key, opts);
        op.check_valid()?;
        ctx.run(async {
            let mut conn = self.pool.acquire().await?;
            self.do_get(&mut conn, &op).await
        })
        .await
    }

    async fn delete(
        &self,
        ctx: &Context,
        key: &[u8],
        opts: &[OpOption],
    ) -> Result<DeleteResponse> {
        let op = Op::delete(key, opts);
        op.check_valid()?;
        ctx.run(async {
            let mut conn = self.pool.acquire().await?;
            self.do_delete(&mut conn, &op).await
        })
        .await
    }

    async fn gen_epoch(&self, ctx: &Context) -> Result<i64> {
        self.epoch.gen_epoch(ctx).await
    }

    fn txn(&self, ctx: &Context) -> Box<dyn Txn> {
        Box::new(SqlTxn {
            client: self.clone(),
            ctx: ctx.clone(),
            buffer: TxnBuffer::new(),
        })
    }

    async fn close(&self) -> Result<()> {
        // the pool is shared with other clients and owned by the caller
        Ok(())
    }
}

/// Transaction over a [`SqlKvClient`].
///
/// Ops are only buffered until commit; the SQL transaction lives for the
/// duration of [`Txn::commit`].
pub struct SqlTxn {
    client: SqlKvClient,
    ctx: Context,
    buffer: TxnBuffer,
}

impl SqlTxn {
    async fn replay(&self, conn: &mut SqliteConnection, ops: &[Op]) -> Result<TxnResponse> {
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let rsp = match op.kind() {
                OpKind::Get => ResponseOp::Get(self.client.do_get(&mut *conn, op).await?),
                OpKind::Put => ResponseOp::Put(self.client.do_put(&mut *conn, op).await?),
                OpKind::Delete => {
                    ResponseOp::Delete(self.client.do_delete(&mut *conn, op).await?)
                }
                OpKind::Txn => return Err(MetaError::NestedTxn),
            };
            responses.push(rsp);
        }
        Ok(TxnResponse { responses })
    }
}

#[async_trait]
impl Txn for SqlTxn {
    fn do_ops(&self, ops: Vec<Op>) -> Result<()> {
        self.buffer.push(ops)
    }

    async fn commit(&self) -> Result<TxnResponse> {
        let ops = self.buffer.begin_commit()?;
        for op in &ops {
            op.check_valid()?;
        }

        // Dropping `tx` on any early return rolls the whole batch back.
        let mut tx = self
            .ctx
            .run(async {
                Ok::<_, MetaError>(self.client.pool.begin_with(BEGIN_IMMEDIATE).await?)
            })
            .await?;

        let replayed = self.ctx.run(self.replay(&mut tx, &ops)).await;
        let rsp = match replayed {
            Ok(rsp) => rsp,
            Err(err) => {
                warn!(job_id = %self.client.job_id, error = %err, "meta txn rolled back");
                return Err(err);
            }
        };

        self.ctx.check()?;
        tx.commit().await?;
        Ok(rsp)
    }

    fn status(&self) -> TxnStatus {
        self.buffer.status()
    }
}
