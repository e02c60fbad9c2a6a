//! In-memory job-scoped KV backend.
//!
//! Tables are ordered maps held behind one `RwLock`, partitioned by job.
//! This implementation is NOT durable - data and epochs are lost on process
//! exit. Use for testing and development only.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::Context;
use crate::epoch::MIN_EPOCH;
use crate::error::{MetaError, Result};
use crate::op::{
    display_key, DeleteResponse, GetResponse, KeyValue, Op, OpKind, OpOption, PutResponse,
    ResponseOp, TxnResponse, MAX_KEY_LENGTH,
};
use crate::sqlite::DEFAULT_KV_TABLE;
use crate::store::{validate_table_name, JobId, KvClient, Txn};
use crate::txn::{TxnBuffer, TxnStatus};

type Rows = BTreeMap<Vec<u8>, Vec<u8>>;

/// Shared in-process storage for every [`MemoryKvClient`].
///
/// Uses a BTreeMap per job for ordered key iteration and an RwLock for
/// concurrency.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, HashMap<JobId, Rows>>>,
    epochs: Mutex<HashMap<JobId, i64>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create `table` if it does not exist.
    pub fn create_table(&self, table: &str) {
        self.tables.write().entry(table.to_string()).or_default();
    }

    /// Number of rows stored for `job_id` in `table`.
    pub fn len(&self, table: &str, job_id: &str) -> usize {
        self.tables
            .read()
            .get(table)
            .and_then(|jobs| jobs.get(job_id))
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Whether `job_id` has no rows in `table`.
    pub fn is_empty(&self, table: &str, job_id: &str) -> bool {
        self.len(table, job_id) == 0
    }

    /// Drop every table and epoch.
    pub fn clear(&self) {
        self.tables.write().clear();
        self.epochs.lock().clear();
    }

    fn read<R>(&self, table: &str, job_id: &str, f: impl FnOnce(&Rows) -> Result<R>) -> Result<R> {
        let tables = self.tables.read();
        let jobs = tables.get(table).ok_or_else(|| missing_table(table))?;
        match jobs.get(job_id) {
            Some(rows) => f(rows),
            None => f(&Rows::new()),
        }
    }

    fn write<R>(
        &self,
        table: &str,
        job_id: &str,
        f: impl FnOnce(&mut Rows) -> Result<R>,
    ) -> Result<R> {
        let mut tables = self.tables.write();
        let jobs = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        f(jobs.entry(job_id.to_string()).or_default())
    }

    fn next_epoch(&self, job_id: &str) -> i64 {
        let mut epochs = self.epochs.lock();
        let epoch = epochs.entry(job_id.to_string()).or_insert(MIN_EPOCH - 1);
        *epoch += 1;
        *epoch
    }
}

fn missing_table(table: &str) -> MetaError {
    MetaError::op_fail(format!("no such table: {}", table))
}

fn apply_put(rows: &mut Rows, op: &Op) -> Result<PutResponse> {
    op.check_valid()?;
    if op.key().len() > MAX_KEY_LENGTH {
        return Err(MetaError::op_fail(format!(
            "key length {} exceeds {} bytes",
            op.key().len(),
            MAX_KEY_LENGTH
        )));
    }
    rows.insert(op.key().to_vec(), op.value().to_vec());
    Ok(PutResponse::default())
}

fn apply_get(rows: &Rows, op: &Op) -> Result<GetResponse> {
    let range = op.key_range()?;
    if range.is_exact() {
        return match rows.get(op.key()) {
            Some(value) => Ok(GetResponse {
                kvs: vec![KeyValue::new(op.key(), value.as_slice())],
            }),
            None => Err(MetaError::NotFound(display_key(op.key()))),
        };
    }

    let kvs = rows
        .range::<[u8], _>((Bound::Included(range.start()), Bound::Unbounded))
        .take_while(|(key, _)| range.below_end(key))
        .map(|(key, value)| KeyValue::new(key.as_slice(), value.as_slice()))
        .collect();
    Ok(GetResponse { kvs })
}

fn apply_delete(rows: &mut Rows, op: &Op) -> Result<DeleteResponse> {
    let range = op.key_range()?;
    let doomed: Vec<Vec<u8>> = rows
        .range::<[u8], _>((Bound::Included(range.start()), Bound::Unbounded))
        .take_while(|(key, _)| range.below_end(key))
        .map(|(key, _)| key.clone())
        .collect();
    for key in &doomed {
        rows.remove(key);
    }
    Ok(DeleteResponse {
        deleted: doomed.len() as u64,
    })
}

/// Job-scoped KV client over a shared [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryKvClient {
    backend: Arc<MemoryBackend>,
    table: String,
    job_id: JobId,
}

impl MemoryKvClient {
    /// Create a client for `job_id` over `table`.
    ///
    /// An empty `table` selects [`DEFAULT_KV_TABLE`].
    pub fn new(backend: Arc<MemoryBackend>, table: &str, job_id: impl Into<JobId>) -> Result<Self> {
        let table = if table.is_empty() {
            DEFAULT_KV_TABLE
        } else {
            table
        };
        validate_table_name(table)?;
        Ok(Self {
            backend,
            table: table.to_string(),
            job_id: job_id.into(),
        })
    }

    /// Table this client reads and writes.
    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl KvClient for MemoryKvClient {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    async fn initialize(&self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        self.backend.create_table(&self.table);
        debug!(table = %self.table, "memory kv table initialized");
        Ok(())
    }

    async fn put(&self, ctx: &Context, key: &[u8], value: &[u8]) -> Result<PutResponse> {
        let op = Op::put(key, value);
        op.check_valid()?;
        ctx.check()?;
        self.backend
            .write(&self.table, &self.job_id, |rows| apply_put(rows, &op))
    }

    async fn get(&self, ctx: &Context, key: &[u8], opts: &[OpOption]) -> Result<GetResponse> {
        let op = Op::get(key, opts);
        op.check_valid()?;
        ctx.check()?;
        self.backend
            .read(&self.table, &self.job_id, |rows| apply_get(rows, &op))
    }

    async fn delete(
        &self,
        ctx: &Context,
        key: &[u8],
        opts: &[OpOption],
    ) -> Result<DeleteResponse> {
        let op = Op::delete(key, opts);
        op.check_valid()?;
        ctx.check()?;
        self.backend
            .write(&self.table, &self.job_id, |rows| apply_delete(rows, &op))
    }

    async fn gen_epoch(&self, ctx: &Context) -> Result<i64> {
        ctx.check()?;
        let epoch = self.backend.next_epoch(&self.job_id);
        debug!(job_id = %self.job_id, epoch, "generated epoch");
        Ok(epoch)
    }

    fn txn(&self, ctx: &Context) -> Box<dyn Txn> {
        Box::new(MemoryTxn {
            client: self.clone(),
            ctx: ctx.clone(),
            buffer: TxnBuffer::new(),
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Transaction over a [`MemoryKvClient`].
///
/// Commit replays the ops against a copy of the job's rows and swaps the copy
/// in only when every op succeeded.
pub struct MemoryTxn {
    client: MemoryKvClient,
    ctx: Context,
    buffer: TxnBuffer,
}

#[async_trait]
impl Txn for MemoryTxn {
    fn do_ops(&self, ops: Vec<Op>) -> Result<()> {
        self.buffer.push(ops)
    }

    async fn commit(&self) -> Result<TxnResponse> {
        let ops = self.buffer.begin_commit()?;
        for op in &ops {
            op.check_valid()?;
        }
        self.ctx.check()?;

        let client = &self.client;
        let committed = client.backend.write(&client.table, &client.job_id, |rows| {
            let mut staged = rows.clone();
            let mut responses = Vec::with_capacity(ops.len());
            for op in &ops {
                let rsp = match op.kind() {
                    OpKind::Get => ResponseOp::Get(apply_get(&staged, op)?),
                    OpKind::Put => ResponseOp::Put(apply_put(&mut staged, op)?),
                    OpKind::Delete => ResponseOp::Delete(apply_delete(&mut staged, op)?),
                    OpKind::Txn => return Err(MetaError::NestedTxn),
                };
                responses.push(rsp);
            }
            *rows = staged;
            Ok(TxnResponse { responses })
        });

        if let Err(err) = &committed {
            warn!(job_id = %client.job_id, error = %err, "meta txn rolled back");
        }
        committed
    }

    fn status(&self) -> TxnStatus {
        self.buffer.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn client(backend: &Arc<MemoryBackend>, job_id: &str) -> MemoryKvClient {
        let client = MemoryKvClient::new(Arc::clone(backend), "", job_id).unwrap();
        client.initialize(&Context::background()).await.unwrap();
        client
    }

    fn keys(rsp: &GetResponse) -> Vec<&[u8]> {
        rsp.kvs.iter().map(|kv| kv.key.as_slice()).collect()
    }

    #[tokio::test]
    async fn test_memory_put_get_overwrite() {
        let backend = MemoryBackend::new();
        let client = client(&backend, "job-1").await;
        let ctx = Context::background();

        client.put(&ctx, b"k", b"v1").await.unwrap();
        client.put(&ctx, b"k", b"v2").await.unwrap();

        let rsp = client.get(&ctx, b"k", &[]).await.unwrap();
        assert_eq!(rsp.kvs, vec![KeyValue::new("k", "v2")]);
        assert_eq!(backend.len(DEFAULT_KV_TABLE, "job-1"), 1);
    }

    #[tokio::test]
    async fn test_memory_not_found() {
        let backend = MemoryBackend::new();
        let client = client(&backend, "job-1").await;
        let ctx = Context::background();

        assert!(client.get(&ctx, b"nope", &[]).await.unwrap_err().is_not_found());
        let rsp = client
            .get(&ctx, b"nope", &[OpOption::WithFromKey])
            .await
            .unwrap();
        assert!(rsp.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_memory_uninitialized_table() {
        let backend = MemoryBackend::new();
        let client = MemoryKvClient::new(backend, "", "job-1").unwrap();
        let err = client
            .put(&Context::background(), b"k", b"v")
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::OpFail { .. }));
    }

    #[tokio::test]
    async fn test_memory_range_prefix_from_key() {
        let backend = MemoryBackend::new();
        let client = client(&backend, "job-1").await;
        let ctx = Context::background();
        for key in ["c", "ab", "a", "b"] {
            client.put(&ctx, key.as_bytes(), b"v").await.unwrap();
        }

        let rsp = client
            .get(&ctx, b"a", &[OpOption::WithRange(b"b".to_vec())])
            .await
            .unwrap();
        assert_eq!(keys(&rsp), vec![&b"a"[..], &b"ab"[..]]);

        let rsp = client.get(&ctx, b"a", &[OpOption::WithPrefix]).await.unwrap();
        assert_eq!(keys(&rsp), vec![&b"a"[..], &b"ab"[..]]);

        let rsp = client
            .get(&ctx, b"b", &[OpOption::WithFromKey])
            .await
            .unwrap();
        assert_eq!(keys(&rsp), vec![&b"b"[..], &b"c"[..]]);

        // an inverted range is empty rather than a panic
        let rsp = client
            .get(&ctx, b"c", &[OpOption::WithRange(b"a".to_vec())])
            .await
            .unwrap();
        assert!(rsp.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_memory_delete_counts() {
        let backend = MemoryBackend::new();
        let client = client(&backend, "job-1").await;
        let ctx = Context::background();
        for key in ["a", "ab", "b", "c"] {
            client.put(&ctx, key.as_bytes(), b"v").await.unwrap();
        }

        assert_eq!(client.delete(&ctx, b"zz", &[]).await.unwrap().deleted, 0);
        let rsp = client
            .delete(&ctx, b"a", &[OpOption::WithRange(b"b".to_vec())])
            .await
            .unwrap();
        assert_eq!(rsp.deleted, 2);
        assert_eq!(backend.len(DEFAULT_KV_TABLE, "job-1"), 2);
    }

    #[tokio::test]
    async fn test_memory_tenant_isolation() {
        let backend = MemoryBackend::new();
        let a = client(&backend, "job-a").await;
        let b = client(&backend, "job-b").await;
        let ctx = Context::background();

        a.put(&ctx, b"stage", b"running").await.unwrap();
        assert!(b.get(&ctx, b"stage", &[]).await.is_err());

        b.put(&ctx, b"stage", b"paused").await.unwrap();
        b.delete(&ctx, b"", &[OpOption::WithFromKey]).await.unwrap();
        assert_eq!(a.get(&ctx, b"stage", &[]).await.unwrap().kvs[0].value, b"running");
    }

    #[tokio::test]
    async fn test_memory_invalid_options() {
        let backend = MemoryBackend::new();
        let client = client(&backend, "job-1").await;
        let err = client
            .get(
                &Context::background(),
                b"a",
                &[OpOption::WithPrefix, OpOption::WithRange(b"z".to_vec())],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::OptionInvalid(_)));
    }

    #[tokio::test]
    async fn test_memory_transaction_atomicity() {
        let backend = MemoryBackend::new();
        let client = client(&backend, "job-1").await;
        let ctx = Context::background();
        client.put(&ctx, b"k1", b"old").await.unwrap();

        let txn = client.txn(&ctx);
        txn.do_ops(vec![
            Op::put("k1", "new"),
            Op::delete("k1", &[OpOption::WithPrefix]),
            Op::put(vec![b'k'; MAX_KEY_LENGTH + 1], "too long"),
        ])
        .unwrap();
        let err = txn.commit().await.unwrap_err();
        assert!(matches!(err, MetaError::OpFail { .. }));
        assert_eq!(txn.status(), TxnStatus::Committed);

        let rsp = client.get(&ctx, b"k1", &[]).await.unwrap();
        assert_eq!(rsp.kvs[0].value, b"old");
    }

    #[tokio::test]
    async fn test_memory_transaction_responses() {
        let backend = MemoryBackend::new();
        let client = client(&backend, "job-1").await;
        let ctx = Context::background();

        let txn = client.txn(&ctx);
        txn.do_ops(vec![Op::put("a", "1"), Op::put("b", "2")]).unwrap();
        txn.do_ops(vec![Op::get("a", &[OpOption::WithPrefix]), Op::delete("b", &[])])
            .unwrap();
        let rsp = txn.commit().await.unwrap();

        assert_eq!(rsp.responses.len(), 4);
        assert_eq!(rsp.responses[2].as_get().unwrap().kvs.len(), 1);
        assert!(matches!(
            rsp.responses[3],
            ResponseOp::Delete(DeleteResponse { deleted: 1 })
        ));
        assert!(matches!(txn.commit().await, Err(MetaError::CommittedTxn)));
    }

    #[tokio::test]
    async fn test_memory_cancelled_commit() {
        let backend = MemoryBackend::new();
        let client = client(&backend, "job-1").await;
        let (ctx, handle) = Context::with_cancel();

        let txn = client.txn(&ctx);
        txn.do_ops(vec![Op::put("a", "1")]).unwrap();
        handle.cancel();

        assert!(matches!(txn.commit().await, Err(MetaError::Cancelled)));
        assert!(backend.is_empty(DEFAULT_KV_TABLE, "job-1"));
    }

    #[tokio::test]
    async fn test_memory_concurrent_epochs() {
        let backend = MemoryBackend::new();
        let client = Arc::new(client(&backend, "job-1").await);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.gen_epoch(&Context::background()).await })
            })
            .collect();

        let mut epochs = Vec::new();
        for handle in handles {
            epochs.push(handle.await.unwrap().unwrap());
        }
        epochs.sort_unstable();
        assert_eq!(epochs, (1..=32).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_memory_epochs_per_job() {
        let backend = MemoryBackend::new();
        let a = client(&backend, "job-a").await;
        let b = client(&backend, "job-b").await;
        let ctx = Context::background();

        assert_eq!(a.gen_epoch(&ctx).await.unwrap(), MIN_EPOCH);
        assert_eq!(a.gen_epoch(&ctx).await.unwrap(), MIN_EPOCH + 1);
        assert_eq!(b.gen_epoch(&ctx).await.unwrap(), MIN_EPOCH);
    }
}
