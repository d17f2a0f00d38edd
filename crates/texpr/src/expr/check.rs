//! Idempotent whole-DAG validation.

use std::collections::HashSet;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::dtype::ElemType;
use crate::error::ShapeError;

use super::{build, Expr, ExprNode, ExprRef};

/// Process-wide memo of already-checked expressions, keyed by structural
/// fingerprint. Append-only; the mutex keeps it safe when builders are
/// shared across threads.
static CHECKED_EXPRS: Lazy<Mutex<HashSet<u64>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn memo_contains(fingerprint: u64) -> bool {
    CHECKED_EXPRS
        .lock()
        .map(|memo| memo.contains(&fingerprint))
        .unwrap_or(false)
}

fn memo_insert(fingerprint: u64) {
    if let Ok(mut memo) = CHECKED_EXPRS.lock() {
        memo.insert(fingerprint);
    }
}

/// Re-derives the shape of every node and compares it against the stored
/// one. Constructors already enforce this, so a failure after construction
/// points at an invalid rewrite.
pub(crate) fn check_node(root: &ExprRef) -> Result<(), ShapeError> {
    let mut visited: HashSet<*const ExprNode> = HashSet::new();
    check_rec(root, &mut visited)
}

fn check_rec(
    node: &ExprRef,
    visited: &mut HashSet<*const ExprNode>,
) -> Result<(), ShapeError> {
    let ptr = ExprRef::as_ptr(node);
    if !visited.insert(ptr) {
        return Ok(());
    }
    if memo_contains(node.fingerprint()) {
        return Ok(());
    }
    for child in node.children() {
        check_rec(child, visited)?;
    }
    let (shape, dtype) = build::infer(node.kind())?;
    if shape != *node.shape() || dtype != *node.dtype() {
        return Err(ShapeError::shape_mismatch(
            format!("stored shape of {} node is stale", node.op_name()),
            node.shape(),
            shape,
        ));
    }
    memo_insert(node.fingerprint());
    Ok(())
}

impl<T: ElemType> Expr<T> {
    /// Walks the DAG once and validates every per-op invariant, with results
    /// memoized process-wide. Idempotent.
    pub fn check(&self) -> Result<(), ShapeError> {
        check_node(self.node())
    }
}
