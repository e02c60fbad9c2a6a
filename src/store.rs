//! Client and transaction traits - the contract every backend implements.
//!
//! A [`KvClient`] is bound to one job. Every read, write and delete it
//! issues is implicitly filtered to that job's rows, so two jobs using the
//! same key never observe each other.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::context::Context;
use crate::error::{MetaError, Result};
use crate::op::{DeleteResponse, GetResponse, Op, OpOption, PutResponse, TxnResponse};
use crate::txn::TxnStatus;

/// Identifier of the job that scopes a client.
pub type JobId = String;

/// A job-scoped key-value store with transactions and fencing epochs.
///
/// Implementations are `Send + Sync` and may be shared by concurrent
/// callers without external locking.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// The job this client is bound to.
    fn job_id(&self) -> &str;

    /// Create the backing structures. Idempotent.
    ///
    /// The epoch structure is always created before the KV table.
    async fn initialize(&self, ctx: &Context) -> Result<()>;

    /// Upsert `key -> value`.
    async fn put(&self, ctx: &Context, key: &[u8], value: &[u8]) -> Result<PutResponse>;

    /// Read one key, or a range/prefix/from-key scan in ascending key order.
    ///
    /// An exact get on an absent key returns [`MetaError::NotFound`].
    async fn get(&self, ctx: &Context, key: &[u8], opts: &[OpOption]) -> Result<GetResponse>;

    /// Remove the targeted rows. Removing nothing is not an error.
    async fn delete(&self, ctx: &Context, key: &[u8], opts: &[OpOption])
        -> Result<DeleteResponse>;

    /// Next fencing epoch for this job, strictly greater than any returned before.
    async fn gen_epoch(&self, ctx: &Context) -> Result<i64>;

    /// Open an empty transaction bound to this client and `ctx`.
    fn txn(&self, ctx: &Context) -> Box<dyn Txn>;

    /// Release client-held resources. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// A batch of ops applied atomically on commit.
#[async_trait]
pub trait Txn: Send + Sync {
    /// Append ops to the batch.
    ///
    /// Fails with [`MetaError::CommittedTxn`] after commit, or with the
    /// stored error once the transaction has errored. Nothing is executed.
    fn do_ops(&self, ops: Vec<Op>) -> Result<()>;

    /// Apply every accumulated op in one backend transaction.
    ///
    /// Either all ops take effect and one response per op is returned in
    /// order, or none do and the first failure is returned.
    async fn commit(&self) -> Result<TxnResponse>;

    /// Current state of the transaction.
    fn status(&self) -> TxnStatus;
}

/// JSON helpers available on every client.
#[async_trait]
pub trait KvClientExt: KvClient {
    /// Get a key and deserialize it as JSON. Absent keys yield `None`.
    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        ctx: &Context,
        key: &[u8],
    ) -> Result<Option<T>> {
        match self.get(ctx, key, &[]).await {
            Ok(rsp) => match rsp.kvs.first() {
                Some(kv) => Ok(Some(serde_json::from_slice(&kv.value)?)),
                None => Ok(None),
            },
            Err(MetaError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Put a JSON-encoded value.
    async fn put_json<T: Serialize + Send + Sync>(
        &self,
        ctx: &Context,
        key: &[u8],
        value: &T,
    ) -> Result<PutResponse> {
        let bytes = serde_json::to_vec(value)?;
        self.put(ctx, key, &bytes).await
    }
}

impl<C: KvClient + ?Sized> KvClientExt for C {}

/// Validate a table name before it is interpolated into SQL.
pub fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MetaError::ParamsInvalid(format!(
            "table name {:?} is not a plain identifier",
            table
        )));
    }
    if table.len() > 64 {
        return Err(MetaError::ParamsInvalid(format!(
            "table name {:?} exceeds 64 characters",
            table
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_table_name_valid() {
        assert!(validate_table_name("meta_kv").is_ok());
        assert!(validate_table_name("_project1_kv").is_ok());
        assert!(validate_table_name("T").is_ok());
    }

    #[test]
    fn test_validate_table_name_invalid() {
        for table in ["", "1kv", "meta-kv", "kv; DROP TABLE x", "kv name"] {
            let err = validate_table_name(table).unwrap_err();
            assert!(matches!(err, MetaError::ParamsInvalid(_)), "{table}");
        }
        let long = "t".repeat(65);
        assert!(validate_table_name(&long).is_err());
    }
}
