//! Symbolic tensor expression DAGs.
//!
//! Expressions are immutable trees of [`ExprNode`] behind [`Arc`]; sharing is
//! structural, so equal subtrees may or may not be the same allocation and
//! equality is always decided structurally. Every node stores the shape and
//! element type derived from its subtree at construction time, which makes
//! [`Expr::shape`] total on valid expressions.
//!
//! The typed surface is [`Expr<T>`], a phantom-typed handle whose
//! constructors run shape inference (and auto-broadcasting for elementwise
//! binaries) at every composition step. The backend consumes the type-erased
//! mirror produced by [`crate::uexpr`].

mod build;
mod check;
mod extension;
mod slicing;
mod subst;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dtype::{ConstLit, ElemType, TypeName};
use crate::error::ShapeError;
use crate::hashing::FingerprintHasher;
use crate::shape::Shape;
use crate::size::SizeExpr;
use crate::var::VarSpec;

pub use extension::{ExtensionLowering, ExtensionOp};
pub use slicing::Range;

/// Shared reference to an expression node.
pub type ExprRef = Arc<ExprNode>;

/// Pure elementwise unary functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapUnaryOp {
    Negate,
    Abs,
    Sign,
    Log,
    Log10,
    Exp,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Sqrt,
    Ceiling,
    Floor,
    Round,
    Truncate,
}

impl MapUnaryOp {
    /// Functor name used when instantiating the elementwise kernel template.
    pub fn functor(self) -> &'static str {
        match self {
            MapUnaryOp::Negate => "OpNegate",
            MapUnaryOp::Abs => "OpAbs",
            MapUnaryOp::Sign => "OpSign",
            MapUnaryOp::Log => "OpLog",
            MapUnaryOp::Log10 => "OpLog10",
            MapUnaryOp::Exp => "OpExp",
            MapUnaryOp::Sin => "OpSin",
            MapUnaryOp::Cos => "OpCos",
            MapUnaryOp::Tan => "OpTan",
            MapUnaryOp::Asin => "OpAsin",
            MapUnaryOp::Acos => "OpAcos",
            MapUnaryOp::Atan => "OpAtan",
            MapUnaryOp::Sinh => "OpSinh",
            MapUnaryOp::Cosh => "OpCosh",
            MapUnaryOp::Tanh => "OpTanh",
            MapUnaryOp::Sqrt => "OpSqrt",
            MapUnaryOp::Ceiling => "OpCeiling",
            MapUnaryOp::Floor => "OpFloor",
            MapUnaryOp::Round => "OpRound",
            MapUnaryOp::Truncate => "OpTruncate",
        }
    }
}

/// Pure elementwise binary functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapBinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
}

impl MapBinaryOp {
    pub fn functor(self) -> &'static str {
        match self {
            MapBinaryOp::Add => "OpAdd",
            MapBinaryOp::Subtract => "OpSubtract",
            MapBinaryOp::Multiply => "OpMultiply",
            MapBinaryOp::Divide => "OpDivide",
            MapBinaryOp::Modulo => "OpModulo",
            MapBinaryOp::Power => "OpPower",
        }
    }

    pub fn supports_in_place(self) -> bool {
        true
    }
}

/// One axis of a simple range specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SimpleRange {
    /// Inclusive symbolic span; an open end runs to the last element.
    SymStartSymEnd {
        start: SizeExpr,
        end: Option<SizeExpr>,
    },
    /// Runtime integer start with a symbolic extent. The start is an
    /// integer-typed expression evaluated when the recipe runs.
    DynStartSymSize { start: ExprRef, size: SizeExpr },
}

/// Per-axis simple range specification; axes beyond its length pass through
/// whole.
pub type SimpleRangeSpec = Vec<SimpleRange>;

/// Structural unary operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Map(MapUnaryOp),
    Sum,
    SumAxis(usize),
    Reshape(Shape),
    DoBroadcast(Shape),
    SwapDim(usize, usize),
    Subtensor(SimpleRangeSpec),
    StoreToVar(VarSpec),
    Annotated(String),
}

/// Binary operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Map(MapBinaryOp),
    Dot,
    TensorProduct,
    SetSubtensor(SimpleRangeSpec),
}

/// N-ary operations.
#[derive(Debug, Clone)]
pub enum NaryOp {
    /// Evaluates every argument for its side effects and discards results.
    Discard,
    /// User-supplied operation with a declared arity.
    Extension(Arc<dyn ExtensionOp>),
}

impl PartialEq for NaryOp {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NaryOp::Discard, NaryOp::Discard) => true,
            (NaryOp::Extension(a), NaryOp::Extension(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for NaryOp {}

impl Hash for NaryOp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            NaryOp::Discard => state.write_u8(0),
            NaryOp::Extension(op) => {
                state.write_u8(1);
                op.name().hash(state);
            }
        }
    }
}

/// Tagged variant forming the expression DAG.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprKind {
    /// Square identity matrix of the given extent.
    Identity { size: SizeExpr, dtype: TypeName },
    Zeros { shape: Shape, dtype: TypeName },
    ScalarConst(ConstLit),
    /// A size expression materialized as a scalar integer value.
    SizeValue(SizeExpr),
    Var(VarSpec),
    Unary { op: UnaryOp, arg: ExprRef },
    Binary {
        op: BinaryOp,
        lhs: ExprRef,
        rhs: ExprRef,
    },
    Nary { op: NaryOp, args: Vec<ExprRef> },
}

/// A single immutable node: the operation plus its derived shape and dtype.
#[derive(Debug)]
pub struct ExprNode {
    kind: ExprKind,
    shape: Shape,
    dtype: TypeName,
    fingerprint: u64,
}

impl ExprNode {
    /// Builds a node, running the per-op shape inference rule.
    pub(crate) fn make(kind: ExprKind) -> Result<ExprRef, ShapeError> {
        let (shape, dtype) = build::infer(&kind)?;
        let mut hasher = FingerprintHasher::new();
        hasher.write(&kind);
        hasher.write(&shape);
        hasher.write(&dtype);
        let fingerprint = hasher.finish();
        Ok(Arc::new(ExprNode {
            kind,
            shape,
            dtype,
            fingerprint,
        }))
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> &TypeName {
        &self.dtype
    }

    /// Structural fingerprint; equal nodes have equal fingerprints.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// All expression children, including the dynamic-start index
    /// expressions embedded in range specifications.
    pub fn children(&self) -> Vec<&ExprRef> {
        let mut children = Vec::new();
        match &self.kind {
            ExprKind::Identity { .. }
            | ExprKind::Zeros { .. }
            | ExprKind::ScalarConst(_)
            | ExprKind::SizeValue(_)
            | ExprKind::Var(_) => {}
            ExprKind::Unary { op, arg } => {
                children.push(arg);
                if let UnaryOp::Subtensor(spec) = op {
                    collect_range_children(spec, &mut children);
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                children.push(lhs);
                children.push(rhs);
                if let BinaryOp::SetSubtensor(spec) = op {
                    collect_range_children(spec, &mut children);
                }
            }
            ExprKind::Nary { args, .. } => {
                children.extend(args.iter());
            }
        }
        children
    }

    /// Short operation name for error context.
    pub fn op_name(&self) -> &'static str {
        build::op_name(&self.kind)
    }
}

fn collect_range_children<'a>(spec: &'a SimpleRangeSpec, out: &mut Vec<&'a ExprRef>) {
    for range in spec {
        if let SimpleRange::DynStartSymSize { start, .. } = range {
            out.push(start);
        }
    }
}

impl PartialEq for ExprNode {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
            && self.dtype == other.dtype
            && self.shape == other.shape
            && self.kind == other.kind
    }
}

impl Eq for ExprNode {}

impl Hash for ExprNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fingerprint);
    }
}

/// Typed handle over a shared expression node.
///
/// `T` is the element type of every node in the subtree; it exists only at
/// the surface. Handles are cheap to clone and never mutate the DAG.
pub struct Expr<T: ElemType> {
    node: ExprRef,
    _elem: PhantomData<fn() -> T>,
}

impl<T: ElemType> Clone for Expr<T> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            _elem: PhantomData,
        }
    }
}

impl<T: ElemType> fmt::Debug for Expr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expr")
            .field("dtype", self.node.dtype())
            .field("shape", self.node.shape())
            .field("kind", self.node.kind())
            .finish()
    }
}

impl<T: ElemType> PartialEq for Expr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl<T: ElemType> Eq for Expr<T> {}

impl<T: ElemType> Expr<T> {
    pub(crate) fn wrap(node: ExprRef) -> Self {
        Self {
            node,
            _elem: PhantomData,
        }
    }

    pub fn node(&self) -> &ExprRef {
        &self.node
    }

    pub fn shape(&self) -> &Shape {
        self.node.shape()
    }

    pub fn dtype(&self) -> &TypeName {
        self.node.dtype()
    }
}
