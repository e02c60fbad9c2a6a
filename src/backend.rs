//! Backend registry keyed by [`StoreType`].

use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tracing::info;

use crate::config::{StoreConfig, StoreType, MEMORY_ENDPOINT};
use crate::context::Context;
use crate::epoch::initialize_epoch_model;
use crate::error::{MetaError, Result};
use crate::memory::{MemoryBackend, MemoryKvClient};
use crate::sqlite::{memory_pool, open_pool, SqlKvClient};
use crate::store::{JobId, KvClient};

/// An opened metastore, shared by every job-scoped client created from it.
#[derive(Debug, Clone)]
pub enum Backend {
    /// SQLite pool and the KV table its clients use.
    Sql { pool: SqlitePool, table: String },
    /// Shared in-process maps and the KV table its clients use.
    Memory { backend: Arc<MemoryBackend>, table: String },
}

impl Backend {
    /// Open the store described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let table = config.table().to_string();

        let backend = match config.store_type {
            StoreType::Sql => {
                let endpoint = config.endpoints.first().ok_or_else(|| {
                    MetaError::InvalidConfig("sql store needs an endpoint".to_string())
                })?;
                let ctx = Context::background().with_timeout(config.connect_timeout());
                let pool = if endpoint == MEMORY_ENDPOINT {
                    ctx.run(memory_pool()).await?
                } else {
                    ctx.run(open_pool(
                        endpoint,
                        config.max_connections,
                        config.busy_timeout(),
                    ))
                    .await?
                };
                Backend::Sql { pool, table }
            }
            StoreType::Memory => Backend::Memory {
                backend: MemoryBackend::new(),
                table,
            },
        };

        info!(
            store_id = %config.store_id,
            store_type = %config.store_type,
            "opened metastore"
        );
        Ok(backend)
    }

    /// Backend kind this store was opened with.
    pub fn store_type(&self) -> StoreType {
        match self {
            Backend::Sql { .. } => StoreType::Sql,
            Backend::Memory { .. } => StoreType::Memory,
        }
    }

    /// Create the epoch structure shared by all jobs of this store.
    pub async fn initialize(&self, ctx: &Context) -> Result<()> {
        match self {
            Backend::Sql { pool, .. } => initialize_epoch_model(ctx, pool).await,
            Backend::Memory { .. } => ctx.check(),
        }
    }

    /// Create an initialized client bound to `job_id`.
    pub async fn client(
        &self,
        ctx: &Context,
        job_id: impl Into<JobId>,
    ) -> Result<Box<dyn KvClient>> {
        let client: Box<dyn KvClient> = match self {
            Backend::Sql { pool, table } => Box::new(SqlKvClient::new(pool, table, job_id)?),
            Backend::Memory { backend, table } => {
                Box::new(MemoryKvClient::new(Arc::clone(backend), table, job_id)?)
            }
        };
        client.initialize(ctx).await?;
        Ok(client)
    }

    /// Close the underlying pool. Clients created earlier fail afterwards.
    pub async fn close(&self) {
        match self {
            Backend::Sql { pool, .. } => pool.close().await,
            Backend::Memory { backend, .. } => backend.clear(),
        }
    }
}
