//! Fencing epoch generator backed by a SQL counter table.
//!
//! One row per job in `logic_epoches`. Each call increments and returns the
//! counter inside its own transaction, so concurrent callers in any process
//! sharing the database get distinct, strictly increasing values.

use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::context::Context;
use crate::error::{MetaError, Result};
use crate::sqlite::BEGIN_IMMEDIATE;
use crate::store::JobId;

/// Table holding the per-job epoch counters.
pub const EPOCH_TABLE: &str = "logic_epoches";

/// First epoch handed out for a job.
pub const MIN_EPOCH: i64 = 1;

const CREATE_EPOCH_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS logic_epoches (
        job_id TEXT PRIMARY KEY NOT NULL,
        epoch INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
"#;

const NEXT_EPOCH: &str = r#"
    INSERT INTO logic_epoches (job_id, epoch, created_at, updated_at)
    VALUES (?, ?, ?, ?)
    ON CONFLICT(job_id) DO UPDATE SET
        epoch = epoch + 1,
        updated_at = excluded.updated_at
    RETURNING epoch
"#;

/// Create the epoch table if it does not exist.
///
/// Must run before any KV table is created for the same database.
pub async fn initialize_epoch_model(ctx: &Context, pool: &SqlitePool) -> Result<()> {
    ctx.run(async {
        let mut conn = pool.acquire().await?;
        create_epoch_table(&mut conn).await
    })
    .await
}

pub(crate) async fn create_epoch_table(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(CREATE_EPOCH_TABLE).execute(&mut *conn).await?;
    debug!("epoch table initialized");
    Ok(())
}

/// Generates fencing epochs for one job.
#[derive(Debug, Clone)]
pub struct SqlEpochClient {
    pool: SqlitePool,
    job_id: JobId,
}

impl SqlEpochClient {
    /// Create an epoch client for `job_id`.
    ///
    /// The epoch table must already exist, see [`initialize_epoch_model`].
    pub fn new(pool: SqlitePool, job_id: impl Into<JobId>) -> Self {
        Self {
            pool,
            job_id: job_id.into(),
        }
    }

    /// Increment and return the job's epoch.
    pub async fn gen_epoch(&self, ctx: &Context) -> Result<i64> {
        let mut tx = ctx
            .run(async { Ok::<_, MetaError>(self.pool.begin_with(BEGIN_IMMEDIATE).await?) })
            .await?;

        let now = crate::sqlite::now_unix();
        let epoch: i64 = ctx
            .run(async {
                Ok::<_, MetaError>(sqlx::query_scalar::<_, i64>(NEXT_EPOCH)
                    .bind(&self.job_id)
                    .bind(MIN_EPOCH)
                    .bind(now)
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await?)
            })
            .await
            .map_err(into_op_fail)?;

        ctx.check()?;
        tx.commit().await.map_err(|e| into_op_fail(e.into()))?;

        debug!(job_id = %self.job_id, epoch, "generated epoch");
        Ok(epoch)
    }
}

/// Epoch failures are always reported as `OpFail`, except cancellation.
fn into_op_fail(err: MetaError) -> MetaError {
    match err {
        MetaError::Cancelled | MetaError::DeadlineExceeded | MetaError::OpFail { .. } => err,
        other => MetaError::OpFail {
            message: format!("advance epoch: {}", other),
            source: None,
        },
    }
}
