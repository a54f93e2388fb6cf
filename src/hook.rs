//! Synchronous change-data-capture hooks.

use crate::{Entry, SeqNo};
use bytes::Bytes;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// One operation of a committed batch as seen by a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOp {
    pub key: Bytes,
    /// Empty for deletes.
    pub value: Bytes,
    /// Absolute expiration in Unix seconds.
    pub ttl: Option<u64>,
    pub delete: bool,
}

impl From<&Entry> for CommitOp {
    fn from(e: &Entry) -> Self {
        CommitOp {
            key: e.key.clone(),
            value: e.value.clone(),
            ttl: (e.ttl != 0).then_some(e.ttl),
            delete: e.is_tombstone(),
        }
    }
}

/// Called once per commit that touches the column family, inside the
/// commit critical section, with the ordered operations and the commit
/// sequence. A non-zero return is logged; the commit stands regardless.
pub trait CommitHook: Send + Sync {
    fn on_commit(&self, ops: &[CommitOp], commit_seq: SeqNo) -> i32;
}

impl<F> CommitHook for F
where
    F: Fn(&[CommitOp], SeqNo) -> i32 + Send + Sync,
{
    fn on_commit(&self, ops: &[CommitOp], commit_seq: SeqNo) -> i32 {
        self(ops, commit_seq)
    }
}

/// Run `hook` over `batch`. Returns false when the hook failed or panicked.
pub fn dispatch(hook: &dyn CommitHook, cf: &str, batch: &[Entry], commit_seq: SeqNo) -> bool {
    let ops: Vec<CommitOp> = batch.iter().map(CommitOp::from).collect();
    match catch_unwind(AssertUnwindSafe(|| hook.on_commit(&ops, commit_seq))) {
        Ok(0) => true,
        Ok(rc) => {
            warn!(cf, seq = commit_seq, rc, "commit hook returned an error");
            false
        }
        Err(_) => {
            warn!(cf, seq = commit_seq, "commit hook panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_closure_hook_receives_ops() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let hook = move |ops: &[CommitOp], seq: SeqNo| {
            assert_eq!(seq, 7);
            assert!(ops[1].delete);
            assert_eq!(ops[0].ttl, Some(99));
            s.fetch_add(ops.len(), Ordering::SeqCst);
            0
        };
        let batch = vec![
            Entry::put(&b"a"[..], &b"1"[..], 7, 99),
            Entry::delete(&b"b"[..], 7),
        ];
        assert!(dispatch(&hook, "cf", &batch, 7));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_and_panicking_hooks_are_contained() {
        let batch = vec![Entry::put(&b"a"[..], &b"1"[..], 1, 0)];
        let failing = |_: &[CommitOp], _: SeqNo| -1;
        assert!(!dispatch(&failing, "cf", &batch, 1));
        let panicking = |_: &[CommitOp], _: SeqNo| -> i32 { panic!("boom") };
        assert!(!dispatch(&panicking, "cf", &batch, 1));
    }
}
