//! Operation and response model.
//!
//! An [`Op`] describes one request: its kind, target key, optional modifier
//! and, for puts, the value. Ops are executed directly by a client or
//! accumulated into a transaction.

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};
use crate::range::KeyRange;

/// Maximum key length in bytes accepted by the row store.
pub const MAX_KEY_LENGTH: usize = 1024;

/// A stored key and its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Opaque key bytes.
    pub key: Vec<u8>,
    /// Opaque value bytes.
    pub value: Vec<u8>,
}

impl KeyValue {
    /// Create a key-value pair.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Kind of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Get,
    Put,
    Delete,
    Txn,
}

/// Query-shape modifier for get and delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOption {
    /// Half-open range `[key, end)`.
    WithRange(Vec<u8>),
    /// All keys starting with the op key.
    WithPrefix,
    /// All keys `>= key`.
    WithFromKey,
}

/// A single request against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    kind: OpKind,
    key: Vec<u8>,
    value: Vec<u8>,
    end: Option<Vec<u8>>,
    prefix: bool,
    from_key: bool,
    ops: Vec<Op>,
}

impl Op {
    fn new(kind: OpKind, key: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            key: key.into(),
            value: Vec::new(),
            end: None,
            prefix: false,
            from_key: false,
            ops: Vec::new(),
        }
    }

    /// A get, optionally shaped by `opts`.
    pub fn get(key: impl Into<Vec<u8>>, opts: &[OpOption]) -> Self {
        Self::new(OpKind::Get, key).with_options(opts)
    }

    /// A single-key upsert.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        let mut op = Self::new(OpKind::Put, key);
        op.value = value.into();
        op
    }

    /// A delete, optionally shaped by `opts`.
    pub fn delete(key: impl Into<Vec<u8>>, opts: &[OpOption]) -> Self {
        Self::new(OpKind::Delete, key).with_options(opts)
    }

    /// A transaction op wrapping `ops`.
    ///
    /// Transactions do not nest; committing a transaction that contains
    /// one fails with [`MetaError::NestedTxn`].
    pub fn txn(ops: Vec<Op>) -> Self {
        let mut op = Self::new(OpKind::Txn, Vec::<u8>::new());
        op.ops = ops;
        op
    }

    /// Apply modifiers. Conflicts are reported later by [`Op::check_valid`].
    pub fn with_options(mut self, opts: &[OpOption]) -> Self {
        for opt in opts {
            match opt {
                OpOption::WithRange(end) => self.end = Some(end.clone()),
                OpOption::WithPrefix => self.prefix = true,
                OpOption::WithFromKey => self.from_key = true,
            }
        }
        self
    }

    /// Kind of the op.
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Target key, or the start key of a range.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Value of a put; empty for other kinds.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Range end for `WithRange`.
    pub fn range_end(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    /// Nested ops of a `Txn` op.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Whether `WithRange` was applied.
    pub fn is_opts_with_range(&self) -> bool {
        self.end.is_some()
    }

    /// Whether `WithPrefix` was applied.
    pub fn is_opts_with_prefix(&self) -> bool {
        self.prefix
    }

    /// Whether `WithFromKey` was applied.
    pub fn is_opts_with_from_key(&self) -> bool {
        self.from_key
    }

    fn modifier_count(&self) -> usize {
        [self.end.is_some(), self.prefix, self.from_key]
            .iter()
            .filter(|set| **set)
            .count()
    }

    /// Validate the option combination for this op kind.
    pub fn check_valid(&self) -> Result<()> {
        match self.kind {
            OpKind::Put if self.modifier_count() > 0 => Err(MetaError::OptionInvalid(
                "put does not accept range, prefix or from-key options".to_string(),
            )),
            OpKind::Get | OpKind::Delete if self.modifier_count() > 1 => {
                Err(MetaError::OptionInvalid(
                    "range, prefix and from-key options are mutually exclusive".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Validate and resolve the rows this op targets.
    pub fn key_range(&self) -> Result<KeyRange> {
        self.check_valid()?;
        let key = self.key.clone();
        Ok(match (&self.end, self.prefix, self.from_key) {
            (Some(end), _, _) => KeyRange::Range {
                start: key,
                end: end.clone(),
            },
            (None, true, _) => KeyRange::Prefix(key),
            (None, false, true) => KeyRange::FromKey(key),
            (None, false, false) => KeyRange::Exact(key),
        })
    }
}

/// Result of a get.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResponse {
    /// Matching pairs in ascending key order.
    pub kvs: Vec<KeyValue>,
}

/// Result of a put.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutResponse {}

/// Result of a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResponse {
    /// Number of rows removed.
    pub deleted: u64,
}

/// Per-op result inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOp {
    Get(GetResponse),
    Put(PutResponse),
    Delete(DeleteResponse),
}

impl ResponseOp {
    /// Kind of the op that produced this response.
    pub fn kind(&self) -> OpKind {
        match self {
            ResponseOp::Get(_) => OpKind::Get,
            ResponseOp::Put(_) => OpKind::Put,
            ResponseOp::Delete(_) => OpKind::Delete,
        }
    }

    /// The get payload, if this is a get response.
    pub fn as_get(&self) -> Option<&GetResponse> {
        match self {
            ResponseOp::Get(rsp) => Some(rsp),
            _ => None,
        }
    }
}

/// Result of a committed transaction, one response per op in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnResponse {
    pub responses: Vec<ResponseOp>,
}

/// Printable form of a key for errors and logs.
pub(crate) fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_creation() {
        let op = Op::put("/jobs/a", b"1".to_vec());
        assert_eq!(op.kind(), OpKind::Put);
        assert_eq!(op.key(), b"/jobs/a");
        assert_eq!(op.value(), b"1");

        let op = Op::get("/jobs/", &[OpOption::WithPrefix]);
        assert!(op.is_opts_with_prefix());
        assert!(!op.is_opts_with_range());

        let op = Op::delete("a", &[OpOption::WithRange(b"b".to_vec())]);
        assert_eq!(op.range_end(), Some(&b"b"[..]));

        let op = Op::txn(vec![Op::put("k", "v")]);
        assert_eq!(op.kind(), OpKind::Txn);
        assert_eq!(op.ops().len(), 1);
    }

    #[test]
    fn test_single_modifier_is_valid() {
        assert!(Op::get("a", &[]).check_valid().is_ok());
        assert!(Op::get("a", &[OpOption::WithFromKey]).check_valid().is_ok());
        assert!(Op::delete("a", &[OpOption::WithPrefix]).check_valid().is_ok());
        assert!(Op::put("a", "v").check_valid().is_ok());
    }

    #[test]
    fn test_conflicting_modifiers_rejected() {
        let op = Op::get("a", &[OpOption::WithPrefix, OpOption::WithFromKey]);
        assert!(matches!(op.check_valid(), Err(MetaError::OptionInvalid(_))));

        let op = Op::delete(
            "a",
            &[OpOption::WithRange(b"z".to_vec()), OpOption::WithPrefix],
        );
        assert!(matches!(op.key_range(), Err(MetaError::OptionInvalid(_))));
    }

    #[test]
    fn test_put_with_modifier_rejected() {
        let op = Op::put("a", "v").with_options(&[OpOption::WithPrefix]);
        assert!(matches!(op.check_valid(), Err(MetaError::OptionInvalid(_))));
    }

    #[test]
    fn test_key_range_resolution() {
        assert_eq!(
            Op::get("a", &[]).key_range().unwrap(),
            KeyRange::Exact(b"a".to_vec())
        );
        assert_eq!(
            Op::get("a", &[OpOption::WithRange(b"b".to_vec())])
                .key_range()
                .unwrap(),
            KeyRange::Range {
                start: b"a".to_vec(),
                end: b"b".to_vec()
            }
        );
        assert_eq!(
            Op::get("a", &[OpOption::WithPrefix]).key_range().unwrap(),
            KeyRange::Prefix(b"a".to_vec())
        );
        assert_eq!(
            Op::get("a", &[OpOption::WithFromKey]).key_range().unwrap(),
            KeyRange::FromKey(b"a".to_vec())
        );
    }

    #[test]
    fn test_response_op_kind() {
        assert_eq!(ResponseOp::Get(GetResponse::default()).kind(), OpKind::Get);
        assert_eq!(ResponseOp::Put(PutResponse::default()).kind(), OpKind::Put);
        let rsp = ResponseOp::Delete(DeleteResponse { deleted: 2 });
        assert_eq!(rsp.kind(), OpKind::Delete);
        assert!(rsp.as_get().is_none());
    }
}
