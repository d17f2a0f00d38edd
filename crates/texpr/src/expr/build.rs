//! Constructor surface and the per-op shape inference rules.
//!
//! Every public constructor runs inference at composition time, so a handle
//! you can obtain always carries a valid derived shape. Elementwise binaries
//! auto-align their operands (pad to the same rank, then broadcast to the
//! same shape) by inserting `DoBroadcast` nodes, which keeps the backend free
//! of broadcasting concerns.

use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

use crate::dtype::{ElemType, Idx, TypeName};
use crate::error::ShapeError;
use crate::shape::Shape;
use crate::size::{SizeExpr, SymSizeEnv};
use crate::var::VarSpec;

use super::{
    BinaryOp, Expr, ExprKind, ExprNode, ExprRef, ExtensionOp, MapBinaryOp, MapUnaryOp,
    NaryOp, SimpleRange, SimpleRangeSpec, UnaryOp,
};

pub(crate) fn op_name(kind: &ExprKind) -> &'static str {
    match kind {
        ExprKind::Identity { .. } => "identity",
        ExprKind::Zeros { .. } => "zeros",
        ExprKind::ScalarConst(_) => "scalar",
        ExprKind::SizeValue(_) => "size_value",
        ExprKind::Var(_) => "var",
        ExprKind::Unary { op, .. } => match op {
            UnaryOp::Map(_) => "elementwise unary",
            UnaryOp::Sum => "sum",
            UnaryOp::SumAxis(_) => "sum_axis",
            UnaryOp::Reshape(_) => "reshape",
            UnaryOp::DoBroadcast(_) => "do_broadcast",
            UnaryOp::SwapDim(_, _) => "swap_dim",
            UnaryOp::Subtensor(_) => "subtensor",
            UnaryOp::StoreToVar(_) => "store_to_var",
            UnaryOp::Annotated(_) => "annotated",
        },
        ExprKind::Binary { op, .. } => match op {
            BinaryOp::Map(m) => map_binary_name(*m),
            BinaryOp::Dot => "dot",
            BinaryOp::TensorProduct => "tensor_product",
            BinaryOp::SetSubtensor(_) => "set_subtensor",
        },
        ExprKind::Nary { op, .. } => match op {
            NaryOp::Discard => "discard",
            NaryOp::Extension(_) => "extension",
        },
    }
}

fn map_binary_name(op: MapBinaryOp) -> &'static str {
    match op {
        MapBinaryOp::Add => "add",
        MapBinaryOp::Subtract => "subtract",
        MapBinaryOp::Multiply => "multiply",
        MapBinaryOp::Divide => "divide",
        MapBinaryOp::Modulo => "modulo",
        MapBinaryOp::Power => "power",
    }
}

/// Derives the result shape and dtype of a node from its children.
///
/// This is the single source of truth: constructors call it when building,
/// `check` calls it when re-validating, and substitution calls it when
/// rebuilding rewritten DAGs.
pub(crate) fn infer(kind: &ExprKind) -> Result<(Shape, TypeName), ShapeError> {
    match kind {
        ExprKind::Identity { size, dtype } => Ok((
            Shape::matrix(size.clone(), size.clone()),
            dtype.clone(),
        )),
        ExprKind::Zeros { shape, dtype } => Ok((shape.clone(), dtype.clone())),
        ExprKind::ScalarConst(lit) => Ok((Shape::scalar(), lit.type_name())),
        ExprKind::SizeValue(_) => Ok((Shape::scalar(), TypeName::new(Idx::NAME))),
        ExprKind::Var(spec) => Ok((spec.shape.clone(), spec.dtype.clone())),
        ExprKind::Unary { op, arg } => infer_unary(op, arg),
        ExprKind::Binary { op, lhs, rhs } => infer_binary(op, lhs, rhs),
        ExprKind::Nary { op, args } => infer_nary(op, args),
    }
}

fn infer_unary(op: &UnaryOp, arg: &ExprRef) -> Result<(Shape, TypeName), ShapeError> {
    let dtype = arg.dtype().clone();
    match op {
        UnaryOp::Map(_) | UnaryOp::Annotated(_) => Ok((arg.shape().clone(), dtype)),
        UnaryOp::Sum => Ok((Shape::scalar(), dtype)),
        UnaryOp::SumAxis(axis) => {
            if *axis >= arg.shape().rank() {
                return Err(ShapeError::rank_mismatch(
                    "sum_axis",
                    format!(
                        "axis {axis} out of range for operand shape {}",
                        arg.shape()
                    ),
                ));
            }
            let dims = arg
                .shape()
                .dims()
                .iter()
                .enumerate()
                .filter(|&(index, _)| index != *axis)
                .map(|(_, dim)| dim.clone());
            Ok((Shape::new(dims), dtype))
        }
        UnaryOp::Reshape(target) => {
            let have = arg.shape().num_elems();
            let want = target.num_elems();
            if !have.equal_under(&want, &SymSizeEnv::new()) {
                return Err(ShapeError::rank_mismatch(
                    "reshape",
                    format!(
                        "cannot reshape {} ({} elements) to {} ({} elements)",
                        arg.shape(),
                        have,
                        target,
                        want
                    ),
                ));
            }
            Ok((target.clone(), dtype))
        }
        UnaryOp::DoBroadcast(target) => {
            if target.rank() < arg.shape().rank() {
                return Err(ShapeError::rank_mismatch(
                    "do_broadcast",
                    format!(
                        "target {} has lower rank than operand {}",
                        target,
                        arg.shape()
                    ),
                ));
            }
            let padded = arg.shape().padded_left(target.rank());
            for axis in 0..target.rank() {
                let src = &padded.dims()[axis];
                let dst = &target.dims()[axis];
                if src == dst || src.is_one() {
                    continue;
                }
                return Err(ShapeError::shape_mismatch(
                    format!("do_broadcast axis {axis}"),
                    arg.shape(),
                    target,
                ));
            }
            Ok((target.clone(), dtype))
        }
        UnaryOp::SwapDim(a, b) => Ok((arg.shape().swapped(*a, *b)?, dtype)),
        UnaryOp::Subtensor(spec) => {
            check_range_spec(spec)?;
            Ok((subtensor_shape(arg.shape(), spec)?, dtype))
        }
        UnaryOp::StoreToVar(var) => {
            if !arg.shape().equal_under(&var.shape, &SymSizeEnv::new()) {
                return Err(ShapeError::shape_mismatch(
                    format!("store to variable {}", var.name),
                    arg.shape(),
                    &var.shape,
                ));
            }
            if *arg.dtype() != var.dtype {
                return Err(ShapeError::dtype_mismatch(
                    format!("store to variable {}", var.name),
                    arg.dtype(),
                    &var.dtype,
                ));
            }
            // Side-effect sentinel: the store itself has no extent.
            Ok((Shape::scalar(), dtype))
        }
    }
}

fn infer_binary(
    op: &BinaryOp,
    lhs: &ExprRef,
    rhs: &ExprRef,
) -> Result<(Shape, TypeName), ShapeError> {
    if lhs.dtype() != rhs.dtype() {
        let context = match op {
            BinaryOp::Map(m) => map_binary_name(*m),
            BinaryOp::Dot => "dot",
            BinaryOp::TensorProduct => "tensor_product",
            BinaryOp::SetSubtensor(_) => "set_subtensor",
        };
        return Err(ShapeError::dtype_mismatch(context, lhs.dtype(), rhs.dtype()));
    }
    let dtype = lhs.dtype().clone();
    match op {
        BinaryOp::Map(m) => {
            if lhs.shape() != rhs.shape() {
                return Err(ShapeError::shape_mismatch(
                    format!("elementwise {}", map_binary_name(*m)),
                    lhs.shape(),
                    rhs.shape(),
                ));
            }
            Ok((lhs.shape().clone(), dtype))
        }
        BinaryOp::Dot => infer_dot(lhs, rhs, dtype),
        BinaryOp::TensorProduct => {
            let dims = lhs
                .shape()
                .dims()
                .iter()
                .chain(rhs.shape().dims().iter())
                .cloned();
            Ok((Shape::new(dims), dtype))
        }
        BinaryOp::SetSubtensor(spec) => {
            check_range_spec(spec)?;
            let window = subtensor_shape(lhs.shape(), spec)?;
            if !rhs.shape().equal_under(&window, &SymSizeEnv::new()) {
                return Err(ShapeError::shape_mismatch(
                    "set_subtensor source",
                    rhs.shape(),
                    &window,
                ));
            }
            Ok((lhs.shape().clone(), dtype))
        }
    }
}

fn infer_dot(
    lhs: &ExprRef,
    rhs: &ExprRef,
    dtype: TypeName,
) -> Result<(Shape, TypeName), ShapeError> {
    let ls = lhs.shape();
    let rs = rhs.shape();
    let inner_mismatch = |inner_l: &SizeExpr, inner_r: &SizeExpr| {
        ShapeError::shape_mismatch(
            format!("dot inner dimensions {inner_l} and {inner_r}"),
            ls,
            rs,
        )
    };
    match (ls.rank(), rs.rank()) {
        (1, 1) => {
            let (l, r) = (&ls.dims()[0], &rs.dims()[0]);
            if !l.equal_under(r, &SymSizeEnv::new()) {
                return Err(inner_mismatch(l, r));
            }
            Ok((Shape::scalar(), dtype))
        }
        (2, 1) => {
            let (k, kr) = (&ls.dims()[1], &rs.dims()[0]);
            if !k.equal_under(kr, &SymSizeEnv::new()) {
                return Err(inner_mismatch(k, kr));
            }
            Ok((Shape::vector(ls.dims()[0].clone()), dtype))
        }
        (2, 2) => {
            let (k, kr) = (&ls.dims()[1], &rs.dims()[0]);
            if !k.equal_under(kr, &SymSizeEnv::new()) {
                return Err(inner_mismatch(k, kr));
            }
            Ok((
                Shape::matrix(ls.dims()[0].clone(), rs.dims()[1].clone()),
                dtype,
            ))
        }
        (l, r) => Err(ShapeError::rank_mismatch(
            "dot",
            format!("supported operand ranks are (1,1), (2,1) and (2,2), got ({l}, {r})"),
        )),
    }
}

fn infer_nary(op: &NaryOp, args: &[ExprRef]) -> Result<(Shape, TypeName), ShapeError> {
    match op {
        NaryOp::Discard => {
            let first = args.first().ok_or_else(|| {
                ShapeError::rank_mismatch("discard", "requires at least one argument")
            })?;
            Ok((Shape::scalar(), first.dtype().clone()))
        }
        NaryOp::Extension(ext) => {
            if args.len() != ext.arity() {
                return Err(ShapeError::UnsupportedOp {
                    name: ext.name().to_string(),
                    expected: ext.arity(),
                    actual: args.len(),
                });
            }
            let shapes: Vec<Shape> = args.iter().map(|arg| arg.shape().clone()).collect();
            let dtypes: Vec<TypeName> = args.iter().map(|arg| arg.dtype().clone()).collect();
            let shape = ext.shape_of(&shapes)?;
            let dtype = ext.result_dtype(&dtypes).ok_or_else(|| {
                ShapeError::rank_mismatch(
                    "extension",
                    format!("op '{}' did not produce a result dtype", ext.name()),
                )
            })?;
            Ok((shape, dtype))
        }
    }
}

/// Result shape of slicing `base` by a simple range spec; trailing axes the
/// spec does not mention pass through whole.
pub(crate) fn subtensor_shape(
    base: &Shape,
    spec: &SimpleRangeSpec,
) -> Result<Shape, ShapeError> {
    if spec.len() > base.rank() {
        return Err(ShapeError::rank_mismatch(
            "subtensor",
            format!(
                "range spec has {} axes but operand shape {} has rank {}",
                spec.len(),
                base,
                base.rank()
            ),
        ));
    }
    let mut dims = Vec::with_capacity(base.rank());
    for (axis, dim) in base.dims().iter().enumerate() {
        if axis >= spec.len() {
            dims.push(dim.clone());
            continue;
        }
        match &spec[axis] {
            SimpleRange::SymStartSymEnd { start, end } => {
                let len = match end {
                    Some(end) => &end.sub(start) + &SizeExpr::one(),
                    None => dim.sub(start),
                };
                dims.push(len);
            }
            SimpleRange::DynStartSymSize { size, .. } => dims.push(size.clone()),
        }
    }
    Ok(Shape::new(dims))
}

fn check_range_spec(spec: &SimpleRangeSpec) -> Result<(), ShapeError> {
    for range in spec {
        if let SimpleRange::DynStartSymSize { start, .. } = range {
            if !start.dtype().is_integer() {
                return Err(ShapeError::dtype_mismatch(
                    "dynamic range start",
                    start.dtype(),
                    TypeName::new(Idx::NAME),
                ));
            }
            if start.shape().rank() != 0 {
                return Err(ShapeError::rank_mismatch(
                    "dynamic range start",
                    format!("must be a scalar, got shape {}", start.shape()),
                ));
            }
        }
    }
    Ok(())
}

impl<T: ElemType> Expr<T> {
    fn expect_ok(result: Result<Expr<T>, ShapeError>, op: &str) -> Expr<T> {
        result.unwrap_or_else(|err| panic!("tensor expression {op} failed: {err}"))
    }

    fn unary(&self, op: UnaryOp) -> Result<Expr<T>, ShapeError> {
        Ok(Self::wrap(ExprNode::make(ExprKind::Unary {
            op,
            arg: Arc::clone(&self.node),
        })?))
    }

    fn map_unary(&self, op: MapUnaryOp) -> Expr<T> {
        Self::expect_ok(self.unary(UnaryOp::Map(op)), "elementwise map")
    }

    /// Convenience builder for a spec naming this crate's element type.
    pub fn var_spec(name: impl Into<String>, shape: Shape) -> VarSpec {
        VarSpec::new(name, shape, T::type_name())
    }

    pub fn var(spec: VarSpec) -> Result<Expr<T>, ShapeError> {
        if spec.dtype != T::type_name() {
            return Err(ShapeError::dtype_mismatch(
                format!("variable {}", spec.name),
                &spec.dtype,
                T::type_name(),
            ));
        }
        Ok(Self::wrap(ExprNode::make(ExprKind::Var(spec))?))
    }

    /// Square identity matrix of extent `size`.
    pub fn identity(size: SizeExpr) -> Expr<T> {
        let node = ExprNode::make(ExprKind::Identity {
            size,
            dtype: T::type_name(),
        })
        .expect("identity inference cannot fail");
        Self::wrap(node)
    }

    pub fn zeros(shape: Shape) -> Expr<T> {
        let node = ExprNode::make(ExprKind::Zeros {
            shape,
            dtype: T::type_name(),
        })
        .expect("zeros inference cannot fail");
        Self::wrap(node)
    }

    pub fn scalar(value: T) -> Expr<T> {
        let node = ExprNode::make(ExprKind::ScalarConst(value.lit()))
            .expect("scalar inference cannot fail");
        Self::wrap(node)
    }

    pub fn negate(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Negate)
    }

    pub fn abs(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Abs)
    }

    pub fn sign(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Sign)
    }

    pub fn log(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Log)
    }

    pub fn log10(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Log10)
    }

    pub fn exp(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Exp)
    }

    pub fn sin(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Sin)
    }

    pub fn cos(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Cos)
    }

    pub fn tan(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Tan)
    }

    pub fn asin(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Asin)
    }

    pub fn acos(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Acos)
    }

    pub fn atan(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Atan)
    }

    pub fn sinh(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Sinh)
    }

    pub fn cosh(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Cosh)
    }

    pub fn tanh(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Tanh)
    }

    pub fn sqrt(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Sqrt)
    }

    pub fn ceiling(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Ceiling)
    }

    pub fn floor(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Floor)
    }

    pub fn round(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Round)
    }

    pub fn truncate(&self) -> Expr<T> {
        self.map_unary(MapUnaryOp::Truncate)
    }

    /// Sum of all elements, yielding a scalar.
    pub fn sum(&self) -> Expr<T> {
        Self::expect_ok(self.unary(UnaryOp::Sum), "sum")
    }

    pub fn sum_axis(&self, axis: usize) -> Result<Expr<T>, ShapeError> {
        self.unary(UnaryOp::SumAxis(axis))
    }

    pub fn reshape(&self, shape: Shape) -> Result<Expr<T>, ShapeError> {
        if *self.shape() == shape {
            return Ok(self.clone());
        }
        // Reshape of a reshape collapses to one reshape of the innermost
        // operand; the element counts agree transitively.
        if let ExprKind::Unary {
            op: UnaryOp::Reshape(_),
            arg,
        } = self.node.kind()
        {
            return Self::wrap(Arc::clone(arg)).reshape(shape);
        }
        self.unary(UnaryOp::Reshape(shape))
    }

    pub fn do_broadcast(&self, shape: Shape) -> Result<Expr<T>, ShapeError> {
        if *self.shape() == shape {
            return Ok(self.clone());
        }
        self.unary(UnaryOp::DoBroadcast(shape))
    }

    pub fn swap_dim(&self, a: usize, b: usize) -> Result<Expr<T>, ShapeError> {
        self.unary(UnaryOp::SwapDim(a, b))
    }

    /// Transpose of a matrix; sugar over [`Expr::swap_dim`].
    pub fn transpose(&self) -> Result<Expr<T>, ShapeError> {
        self.swap_dim(0, 1)
    }

    pub fn subtensor(&self, spec: SimpleRangeSpec) -> Result<Expr<T>, ShapeError> {
        self.unary(UnaryOp::Subtensor(spec))
    }

    /// Marks the expression result to be written into `var` when executed.
    pub fn store_to(&self, var: VarSpec) -> Result<Expr<T>, ShapeError> {
        self.unary(UnaryOp::StoreToVar(var))
    }

    pub fn annotated(&self, text: impl Into<String>) -> Expr<T> {
        Self::expect_ok(self.unary(UnaryOp::Annotated(text.into())), "annotated")
    }

    fn binary(&self, op: BinaryOp, rhs: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        Ok(Self::wrap(ExprNode::make(ExprKind::Binary {
            op,
            lhs: Arc::clone(&self.node),
            rhs: Arc::clone(&rhs.node),
        })?))
    }

    fn map_binary(&self, op: MapBinaryOp, rhs: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        let (aligned, _) = Shape::broadcast_to_same(self.shape(), rhs.shape())?;
        let lhs = self.do_broadcast(aligned.clone())?;
        let rhs = rhs.do_broadcast(aligned)?;
        lhs.binary(BinaryOp::Map(op), &rhs)
    }

    pub fn try_add(&self, rhs: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        self.map_binary(MapBinaryOp::Add, rhs)
    }

    pub fn try_sub(&self, rhs: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        self.map_binary(MapBinaryOp::Subtract, rhs)
    }

    pub fn try_mul(&self, rhs: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        self.map_binary(MapBinaryOp::Multiply, rhs)
    }

    pub fn try_div(&self, rhs: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        self.map_binary(MapBinaryOp::Divide, rhs)
    }

    pub fn try_rem(&self, rhs: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        self.map_binary(MapBinaryOp::Modulo, rhs)
    }

    pub fn try_pow(&self, rhs: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        self.map_binary(MapBinaryOp::Power, rhs)
    }

    /// Vector/matrix product; supported operand ranks are (1,1), (2,1) and
    /// (2,2) with a matching inner dimension.
    pub fn dot(&self, rhs: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        self.binary(BinaryOp::Dot, rhs)
    }

    pub fn tensor_product(&self, rhs: &Expr<T>) -> Result<Expr<T>, ShapeError> {
        self.binary(BinaryOp::TensorProduct, rhs)
    }

    /// Replaces the sub-window selected by `spec` with `src`.
    pub fn set_subtensor(
        &self,
        spec: SimpleRangeSpec,
        src: &Expr<T>,
    ) -> Result<Expr<T>, ShapeError> {
        self.binary(BinaryOp::SetSubtensor(spec), src)
    }

    /// Evaluates every part for its side effects (stores) and discards the
    /// results.
    pub fn discard(parts: &[Expr<T>]) -> Result<Expr<T>, ShapeError> {
        let args = parts.iter().map(|part| Arc::clone(&part.node)).collect();
        Ok(Self::wrap(ExprNode::make(ExprKind::Nary {
            op: NaryOp::Discard,
            args,
        })?))
    }

    pub fn extension(
        op: Arc<dyn ExtensionOp>,
        args: &[Expr<T>],
    ) -> Result<Expr<T>, ShapeError> {
        let args = args.iter().map(|arg| Arc::clone(&arg.node)).collect();
        Ok(Self::wrap(ExprNode::make(ExprKind::Nary {
            op: NaryOp::Extension(op),
            args,
        })?))
    }
}

impl Expr<Idx> {
    /// A size expression materialized as a runtime scalar integer.
    pub fn size_value(size: SizeExpr) -> Expr<Idx> {
        let node = ExprNode::make(ExprKind::SizeValue(size))
            .expect("size_value inference cannot fail");
        Self::wrap(node)
    }
}

impl<T: ElemType> Add for &Expr<T> {
    type Output = Expr<T>;

    fn add(self, rhs: &Expr<T>) -> Expr<T> {
        Expr::expect_ok(self.try_add(rhs), "add")
    }
}

impl<T: ElemType> Sub for &Expr<T> {
    type Output = Expr<T>;

    fn sub(self, rhs: &Expr<T>) -> Expr<T> {
        Expr::expect_ok(self.try_sub(rhs), "subtract")
    }
}

impl<T: ElemType> Mul for &Expr<T> {
    type Output = Expr<T>;

    fn mul(self, rhs: &Expr<T>) -> Expr<T> {
        Expr::expect_ok(self.try_mul(rhs), "multiply")
    }
}

impl<T: ElemType> Div for &Expr<T> {
    type Output = Expr<T>;

    fn div(self, rhs: &Expr<T>) -> Expr<T> {
        Expr::expect_ok(self.try_div(rhs), "divide")
    }
}

impl<T: ElemType> Neg for &Expr<T> {
    type Output = Expr<T>;

    fn neg(self) -> Expr<T> {
        self.negate()
    }
}
