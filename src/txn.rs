//! Transaction accumulator shared by every backend.
//!
//! A transaction is `Open` until its first commit attempt, which moves it to
//! `Committed` whatever the outcome. A nested transaction op pushed while
//! open moves it to `Errored`. Both are terminal.

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{MetaError, Result};
use crate::op::{Op, OpKind};

/// Observable state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Open,
    Committed,
    Errored,
}

#[derive(Debug)]
enum TxnState {
    Open(Vec<Op>),
    Committed,
    Errored(MetaError),
}

/// Pending ops of one transaction behind a single lock.
#[derive(Debug)]
pub(crate) struct TxnBuffer {
    state: Mutex<TxnState>,
}

impl TxnBuffer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TxnState::Open(Vec::with_capacity(2))),
        }
    }

    pub(crate) fn status(&self) -> TxnStatus {
        match &*self.state.lock() {
            TxnState::Open(_) => TxnStatus::Open,
            TxnState::Committed => TxnStatus::Committed,
            TxnState::Errored(_) => TxnStatus::Errored,
        }
    }

    /// Append ops while open; otherwise report why the transaction is closed.
    pub(crate) fn push(&self, ops: Vec<Op>) -> Result<()> {
        let nested = ops.iter().any(|op| op.kind() == OpKind::Txn);
        let mut state = self.state.lock();
        match &mut *state {
            TxnState::Open(pending) if !nested => {
                pending.extend(ops);
                Ok(())
            }
            TxnState::Open(_) => {
                *state = TxnState::Errored(MetaError::NestedTxn);
                Err(MetaError::NestedTxn)
            }
            TxnState::Committed => Err(MetaError::CommittedTxn),
            TxnState::Errored(err) => Err(err.clone()),
        }
    }

    /// Flip to `Committed` and hand back the pending ops.
    ///
    /// Only the first caller gets the ops; everyone after sees
    /// `CommittedTxn` or the stored error.
    pub(crate) fn begin_commit(&self) -> Result<Vec<Op>> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, TxnState::Committed) {
            TxnState::Open(pending) => {
                debug!(ops = pending.len(), "committing meta txn");
                Ok(pending)
            }
            TxnState::Committed => Err(MetaError::CommittedTxn),
            TxnState::Errored(err) => {
                let returned = err.clone();
                *state = TxnState::Errored(err);
                Err(returned)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_then_commit() {
        let buffer = TxnBuffer::new();
        buffer.push(vec![Op::put("a", "1")]).unwrap();
        buffer.push(vec![Op::put("b", "2"), Op::get("a", &[])]).unwrap();
        assert_eq!(buffer.status(), TxnStatus::Open);

        let ops = buffer.begin_commit().unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].key(), b"a");
        assert_eq!(ops[2].kind(), OpKind::Get);
        assert_eq!(buffer.status(), TxnStatus::Committed);
    }

    #[test]
    fn test_commit_once() {
        let buffer = TxnBuffer::new();
        buffer.push(vec![Op::put("a", "1")]).unwrap();
        buffer.begin_commit().unwrap();

        assert!(matches!(buffer.begin_commit(), Err(MetaError::CommittedTxn)));
        assert!(matches!(
            buffer.push(vec![Op::put("b", "2")]),
            Err(MetaError::CommittedTxn)
        ));
    }

    #[test]
    fn test_nested_txn_errors_buffer() {
        let buffer = TxnBuffer::new();
        buffer.push(vec![Op::put("a", "1")]).unwrap();

        let result = buffer.push(vec![Op::txn(vec![Op::put("b", "2")])]);
        assert!(matches!(result, Err(MetaError::NestedTxn)));
        assert_eq!(buffer.status(), TxnStatus::Errored);

        // stored error is returned again and nothing is released for execution
        assert!(matches!(
            buffer.push(vec![Op::put("c", "3")]),
            Err(MetaError::NestedTxn)
        ));
        assert!(matches!(buffer.begin_commit(), Err(MetaError::NestedTxn)));
        assert_eq!(buffer.status(), TxnStatus::Errored);
    }

    #[test]
    fn test_concurrent_commit_only_one_wins() {
        let buffer = Arc::new(TxnBuffer::new());
        buffer.push(vec![Op::put("a", "1")]).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || buffer.begin_commit().is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_push_keeps_all_ops() {
        let buffer = Arc::new(TxnBuffer::new());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        buffer
                            .push(vec![Op::put(format!("{t}-{i}"), "v")])
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(buffer.begin_commit().unwrap().len(), 100);
    }
}
