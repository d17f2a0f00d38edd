//! Rewrites over expression DAGs: symbolic size substitution, structural
//! replacement, and variable extraction.
//!
//! All rewrites rebuild bottom-up through the same inference path the
//! constructors use, so derived shapes stay the single source of truth. The
//! integer expressions embedded in dynamic range starts are rewritten
//! exactly like any other child.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::dtype::ElemType;
use crate::error::ShapeError;
use crate::size::SymSizeEnv;
use crate::var::VarSpec;

use super::{
    BinaryOp, Expr, ExprKind, ExprNode, ExprRef, SimpleRange, SimpleRangeSpec, UnaryOp,
};

type RewriteMemo = HashMap<*const ExprNode, ExprRef>;

fn subst_range_spec(
    spec: &SimpleRangeSpec,
    env: &SymSizeEnv,
    memo: &mut RewriteMemo,
) -> Result<SimpleRangeSpec, ShapeError> {
    spec.iter()
        .map(|range| {
            Ok(match range {
                SimpleRange::SymStartSymEnd { start, end } => SimpleRange::SymStartSymEnd {
                    start: start.subst(env),
                    end: end.as_ref().map(|end| end.subst(env)),
                },
                SimpleRange::DynStartSymSize { start, size } => SimpleRange::DynStartSymSize {
                    start: subst_node(start, env, memo)?,
                    size: size.subst(env),
                },
            })
        })
        .collect()
}

fn subst_node(
    node: &ExprRef,
    env: &SymSizeEnv,
    memo: &mut RewriteMemo,
) -> Result<ExprRef, ShapeError> {
    let ptr = ExprRef::as_ptr(node);
    if let Some(done) = memo.get(&ptr) {
        return Ok(Arc::clone(done));
    }
    let kind = match node.kind() {
        ExprKind::Identity { size, dtype } => ExprKind::Identity {
            size: size.subst(env),
            dtype: dtype.clone(),
        },
        ExprKind::Zeros { shape, dtype } => ExprKind::Zeros {
            shape: shape.subst(env),
            dtype: dtype.clone(),
        },
        ExprKind::ScalarConst(lit) => ExprKind::ScalarConst(*lit),
        ExprKind::SizeValue(size) => ExprKind::SizeValue(size.subst(env)),
        ExprKind::Var(spec) => ExprKind::Var(spec.subst(env)),
        ExprKind::Unary { op, arg } => {
            let arg = subst_node(arg, env, memo)?;
            let op = match op {
                UnaryOp::Reshape(shape) => UnaryOp::Reshape(shape.subst(env)),
                UnaryOp::DoBroadcast(shape) => UnaryOp::DoBroadcast(shape.subst(env)),
                UnaryOp::Subtensor(spec) => {
                    UnaryOp::Subtensor(subst_range_spec(spec, env, memo)?)
                }
                UnaryOp::StoreToVar(var) => UnaryOp::StoreToVar(var.subst(env)),
                other => other.clone(),
            };
            ExprKind::Unary { op, arg }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let lhs = subst_node(lhs, env, memo)?;
            let rhs = subst_node(rhs, env, memo)?;
            let op = match op {
                BinaryOp::SetSubtensor(spec) => {
                    BinaryOp::SetSubtensor(subst_range_spec(spec, env, memo)?)
                }
                other => other.clone(),
            };
            ExprKind::Binary { op, lhs, rhs }
        }
        ExprKind::Nary { op, args } => {
            let args = args
                .iter()
                .map(|arg| subst_node(arg, env, memo))
                .collect::<Result<Vec<_>, _>>()?;
            ExprKind::Nary {
                op: op.clone(),
                args,
            }
        }
    };
    let rebuilt = ExprNode::make(kind)?;
    memo.insert(ptr, Arc::clone(&rebuilt));
    Ok(rebuilt)
}

fn replace_node(
    node: &ExprRef,
    part: &ExprRef,
    replacement: &ExprRef,
    memo: &mut RewriteMemo,
) -> Result<ExprRef, ShapeError> {
    if node == part {
        return Ok(Arc::clone(replacement));
    }
    let ptr = ExprRef::as_ptr(node);
    if let Some(done) = memo.get(&ptr) {
        return Ok(Arc::clone(done));
    }
    let replace_spec = |spec: &SimpleRangeSpec,
                        memo: &mut RewriteMemo|
     -> Result<SimpleRangeSpec, ShapeError> {
        spec.iter()
            .map(|range| {
                Ok(match range {
                    SimpleRange::DynStartSymSize { start, size } => {
                        SimpleRange::DynStartSymSize {
                            start: replace_node(start, part, replacement, memo)?,
                            size: size.clone(),
                        }
                    }
                    other => other.clone(),
                })
            })
            .collect()
    };
    let kind = match node.kind() {
        leaf @ (ExprKind::Identity { .. }
        | ExprKind::Zeros { .. }
        | ExprKind::ScalarConst(_)
        | ExprKind::SizeValue(_)
        | ExprKind::Var(_)) => leaf.clone(),
        ExprKind::Unary { op, arg } => {
            let arg = replace_node(arg, part, replacement, memo)?;
            let op = match op {
                UnaryOp::Subtensor(spec) => UnaryOp::Subtensor(replace_spec(spec, memo)?),
                other => other.clone(),
            };
            ExprKind::Unary { op, arg }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let lhs = replace_node(lhs, part, replacement, memo)?;
            let rhs = replace_node(rhs, part, replacement, memo)?;
            let op = match op {
                BinaryOp::SetSubtensor(spec) => {
                    BinaryOp::SetSubtensor(replace_spec(spec, memo)?)
                }
                other => other.clone(),
            };
            ExprKind::Binary { op, lhs, rhs }
        }
        ExprKind::Nary { op, args } => {
            let args = args
                .iter()
                .map(|arg| replace_node(arg, part, replacement, memo))
                .collect::<Result<Vec<_>, _>>()?;
            ExprKind::Nary {
                op: op.clone(),
                args,
            }
        }
    };
    let rebuilt = ExprNode::make(kind)?;
    memo.insert(ptr, Arc::clone(&rebuilt));
    Ok(rebuilt)
}

fn walk<'a>(node: &'a ExprRef, visited: &mut HashSet<*const ExprNode>, f: &mut impl FnMut(&'a ExprNode)) {
    if !visited.insert(ExprRef::as_ptr(node)) {
        return;
    }
    f(node);
    for child in node.children() {
        walk(child, visited, f);
    }
}

impl<T: ElemType> Expr<T> {
    /// Rewrites every embedded shape, size and range under `env`, returning
    /// a new DAG with freshly derived shapes.
    pub fn subst_sym_sizes(&self, env: &SymSizeEnv) -> Result<Expr<T>, ShapeError> {
        let mut memo = RewriteMemo::new();
        Ok(Self::wrap(subst_node(self.node(), env, &mut memo)?))
    }

    /// True iff every shape in the DAG (including range extents) evaluates
    /// to concrete numbers.
    pub fn can_eval_all_sym_sizes(&self) -> bool {
        let mut visited = HashSet::new();
        let mut ok = true;
        walk(self.node(), &mut visited, &mut |node| {
            if !node.shape().can_eval() {
                ok = false;
            }
            if let ExprKind::Unary {
                op: UnaryOp::Subtensor(spec),
                ..
            }
            | ExprKind::Binary {
                op: BinaryOp::SetSubtensor(spec),
                ..
            } = node.kind()
            {
                for range in spec {
                    let evaluable = match range {
                        SimpleRange::SymStartSymEnd { start, end } => {
                            start.can_eval()
                                && end.as_ref().map(|e| e.can_eval()).unwrap_or(true)
                        }
                        SimpleRange::DynStartSymSize { size, .. } => size.can_eval(),
                    };
                    if !evaluable {
                        ok = false;
                    }
                }
            }
        });
        ok
    }

    /// Rewrites all subtrees structurally equal to `part` with
    /// `replacement`, re-deriving shapes on the way up.
    pub fn subst(&self, part: &Expr<T>, replacement: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        let mut memo = RewriteMemo::new();
        Ok(Self::wrap(replace_node(
            self.node(),
            part.node(),
            replacement.node(),
            &mut memo,
        )?))
    }

    /// All variables referenced anywhere in the DAG, including targets
    /// written through `StoreToVar`.
    pub fn extract_vars(&self) -> BTreeSet<VarSpec> {
        let mut visited = HashSet::new();
        let mut vars = BTreeSet::new();
        walk(self.node(), &mut visited, &mut |node| match node.kind() {
            ExprKind::Var(spec) => {
                vars.insert(spec.clone());
            }
            ExprKind::Unary {
                op: UnaryOp::StoreToVar(spec),
                ..
            } => {
                vars.insert(spec.clone());
            }
            _ => {}
        });
        vars
    }
}
