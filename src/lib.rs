//! # metakv
//!
//! Job-scoped transactional metadata store.
//!
//! Every client is bound to one job. Keys and values are opaque bytes, and
//! two jobs writing the same key never observe each other. On top of plain
//! key-value access the store provides:
//!
//! - **Query modifiers**: exact, half-open range, prefix and from-key reads and deletes
//! - **Transactions**: buffered ops applied all-or-nothing, committed at most once
//! - **Fencing epochs**: a per-job counter that only moves forward, even across processes
//! - **Cancellation**: every operation takes a [`Context`] with an optional deadline
//!
//! ## Backends
//!
//! - [`SqlKvClient`]: SQLite through an `sqlx` pool (durable, multi-process)
//! - [`MemoryKvClient`]: In-memory maps (testing and development)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use metakv::{Context, KvClient, SqlKvClient};
//!
//! #[tokio::main]
//! async fn main() -> metakv::Result<()> {
//!     let pool = metakv::sqlite::open_pool("meta.db", 8, std::time::Duration::from_secs(5)).await?;
//!     let client = SqlKvClient::connect(&pool, "", "job-1").await?;
//!     let ctx = Context::background();
//!
//!     client.put(&ctx, b"/tasks/t1", b"running").await?;
//!     let rsp = client.get(&ctx, b"/tasks/t1", &[]).await?;
//!     println!("{:?}", String::from_utf8_lossy(&rsp.kvs[0].value));
//!
//!     let epoch = client.gen_epoch(&ctx).await?;
//!     println!("epoch: {}", epoch);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Transactions
//!
//! ```rust,no_run
//! use metakv::{Backend, Context, Op, OpOption, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> metakv::Result<()> {
//!     let backend = Backend::open(&StoreConfig::default()).await?;
//!     let ctx = Context::background();
//!     let client = backend.client(&ctx, "job-1").await?;
//!
//!     let txn = client.txn(&ctx);
//!     txn.do_ops(vec![
//!         Op::delete("/workers/", &[OpOption::WithPrefix]),
//!         Op::put("/workers/w1", "online"),
//!         Op::put("/stage", "running"),
//!     ])?;
//!     let rsp = txn.commit().await?;
//!     assert_eq!(rsp.responses.len(), 3);
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod epoch;
pub mod error;
pub mod memory;
pub mod op;
pub mod range;
pub mod sqlite;
pub mod store;
pub mod txn;

// Re-export main types
pub use backend::Backend;
pub use config::{StoreConfig, StoreType};
pub use context::{CancelHandle, Context};
pub use epoch::{initialize_epoch_model, SqlEpochClient, MIN_EPOCH};
pub use error::{MetaError, Result};
pub use memory::{MemoryBackend, MemoryKvClient, MemoryTxn};
pub use op::{
    DeleteResponse, GetResponse, KeyValue, Op, OpKind, OpOption, PutResponse, ResponseOp,
    TxnResponse, MAX_KEY_LENGTH,
};
pub use sqlite::{SqlKvClient, SqlTxn};
pub use store::{JobId, KvClient, KvClientExt, Txn};
pub use txn::TxnStatus;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::Backend;
    pub use crate::context::Context;
    pub use crate::error::{MetaError, Result};
    pub use crate::op::{Op, OpOption};
    pub use crate::store::{KvClient, KvClientExt, Txn};
}
