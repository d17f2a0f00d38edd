//! Ordered lists of symbolic sizes and the broadcasting rules over them.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::ShapeError;
use crate::size::{SizeExpr, SizeSymbol, SymSizeEnv};

type Dims = SmallVec<[SizeExpr; 4]>;

/// Logical tensor shape; the rank is the number of dimensions.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Shape {
    dims: Dims,
}

impl Shape {
    pub fn new(dims: impl IntoIterator<Item = SizeExpr>) -> Self {
        Self {
            dims: dims.into_iter().collect(),
        }
    }

    /// The rank-zero shape of scalars and side-effect sentinels.
    pub fn scalar() -> Self {
        Self::default()
    }

    pub fn vector(len: SizeExpr) -> Self {
        Self::new([len])
    }

    pub fn matrix(rows: SizeExpr, cols: SizeExpr) -> Self {
        Self::new([rows, cols])
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[SizeExpr] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Result<&SizeExpr, ShapeError> {
        self.dims.get(axis).ok_or_else(|| {
            ShapeError::rank_mismatch(
                "axis access",
                format!("axis {axis} out of range for rank {}", self.rank()),
            )
        })
    }

    /// Element count as a size expression (the empty product for scalars).
    pub fn num_elems(&self) -> SizeExpr {
        self.dims
            .iter()
            .fold(SizeExpr::one(), |acc, dim| &acc * dim)
    }

    pub fn swapped(&self, a: usize, b: usize) -> Result<Shape, ShapeError> {
        if a >= self.rank() || b >= self.rank() {
            return Err(ShapeError::rank_mismatch(
                "swap_dim",
                format!("axes ({a}, {b}) out of range for rank {}", self.rank()),
            ));
        }
        let mut dims = self.dims.clone();
        dims.swap(a, b);
        Ok(Shape { dims })
    }

    /// Pads to `rank` by prepending broadcast-tagged ones.
    pub fn padded_left(&self, rank: usize) -> Shape {
        let mut dims = Dims::new();
        for _ in self.rank()..rank {
            dims.push(SizeExpr::broadcast());
        }
        dims.extend(self.dims.iter().cloned());
        Shape { dims }
    }

    /// Pads to `rank` by appending broadcast-tagged ones.
    pub fn padded_right(&self, rank: usize) -> Shape {
        let mut dims = self.dims.clone();
        for _ in self.rank()..rank {
            dims.push(SizeExpr::broadcast());
        }
        Shape { dims }
    }

    /// Inserts a broadcast-tagged axis before `axis`.
    pub fn inserted_broadcast_axis(&self, axis: usize) -> Result<Shape, ShapeError> {
        if axis > self.rank() {
            return Err(ShapeError::rank_mismatch(
                "insert_broadcast_axis",
                format!("axis {axis} out of range for rank {}", self.rank()),
            ));
        }
        let mut dims = self.dims.clone();
        dims.insert(axis, SizeExpr::broadcast());
        Ok(Shape { dims })
    }

    /// Tags an axis of extent one as broadcastable.
    pub fn broadcast_enabled(&self, axis: usize) -> Result<Shape, ShapeError> {
        let dim = self.dim(axis)?;
        if !dim.is_one() {
            return Err(ShapeError::shape_mismatch(
                format!("enable broadcast on axis {axis}"),
                dim,
                SizeExpr::one(),
            ));
        }
        let mut dims = self.dims.clone();
        dims[axis] = SizeExpr::broadcast();
        Ok(Shape { dims })
    }

    /// Replaces a broadcast tag on `axis` with the plain literal one.
    pub fn broadcast_disabled(&self, axis: usize) -> Result<Shape, ShapeError> {
        let dim = self.dim(axis)?;
        if !dim.is_broadcast() {
            return Err(ShapeError::shape_mismatch(
                format!("disable broadcast on axis {axis}"),
                dim,
                SizeExpr::broadcast(),
            ));
        }
        let mut dims = self.dims.clone();
        dims[axis] = SizeExpr::one();
        Ok(Shape { dims })
    }

    /// Aligns two shapes under the broadcast rules: pad the shorter with
    /// leading broadcast axes, then per axis replace a broadcast side with
    /// the other side. Plain axes of extent one may extend as well.
    pub fn broadcast_to_same(a: &Shape, b: &Shape) -> Result<(Shape, Shape), ShapeError> {
        Self::broadcast_to_same_impl(a, b, true)
    }

    /// Like [`Shape::broadcast_to_same`] but refuses to extend an axis that
    /// is not broadcast-tagged.
    pub fn broadcast_to_same_strict(a: &Shape, b: &Shape) -> Result<(Shape, Shape), ShapeError> {
        Self::broadcast_to_same_impl(a, b, false)
    }

    fn broadcast_to_same_impl(
        a: &Shape,
        b: &Shape,
        permit_plain_ones: bool,
    ) -> Result<(Shape, Shape), ShapeError> {
        let rank = a.rank().max(b.rank());
        let mut left = a.padded_left(rank);
        let mut right = b.padded_left(rank);
        for axis in 0..rank {
            let l = left.dims[axis].clone();
            let r = right.dims[axis].clone();
            match (l.is_broadcast(), r.is_broadcast()) {
                (true, false) => left.dims[axis] = r,
                (false, true) => right.dims[axis] = l,
                (true, true) => {}
                (false, false) => {
                    if l == r {
                        continue;
                    }
                    if permit_plain_ones && l.is_one() {
                        left.dims[axis] = r;
                    } else if permit_plain_ones && r.is_one() {
                        right.dims[axis] = l;
                    } else {
                        return Err(ShapeError::shape_mismatch(
                            format!("broadcast axis {axis}"),
                            a,
                            b,
                        ));
                    }
                }
            }
        }
        Ok((left, right))
    }

    pub fn subst(&self, env: &SymSizeEnv) -> Shape {
        Shape {
            dims: self.dims.iter().map(|dim| dim.subst(env)).collect(),
        }
    }

    pub fn can_eval(&self) -> bool {
        self.dims.iter().all(SizeExpr::can_eval)
    }

    pub fn eval(&self) -> Result<Vec<u64>, ShapeError> {
        self.dims.iter().map(SizeExpr::eval).collect()
    }

    pub fn symbols(&self) -> std::collections::BTreeSet<SizeSymbol> {
        self.dims.iter().flat_map(|dim| dim.symbols()).collect()
    }

    /// Semantic equality after substituting `env`, axis by axis.
    pub fn equal_under(&self, other: &Shape, env: &SymSizeEnv) -> bool {
        self.rank() == other.rank()
            && self
                .dims
                .iter()
                .zip(other.dims.iter())
                .all(|(a, b)| a.equal_under(b, env))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, dim) in self.dims.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            dim.fmt(f)?;
        }
        f.write_str("]")
    }
}

impl FromIterator<SizeExpr> for Shape {
    fn from_iter<I: IntoIterator<Item = SizeExpr>>(iter: I) -> Self {
        Shape::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_pads_and_extends() {
        let a = Shape::matrix(SizeExpr::sym("N"), SizeExpr::sym("M"));
        let b = Shape::vector(SizeExpr::sym("M"));
        let (left, right) = Shape::broadcast_to_same(&a, &b).unwrap();
        assert_eq!(left, a);
        assert_eq!(right.rank(), 2);
        assert_eq!(right.dims()[0], SizeExpr::sym("N"));
    }

    #[test]
    fn strict_broadcast_refuses_plain_axes() {
        let a = Shape::matrix(SizeExpr::sym("N"), SizeExpr::sym("M"));
        let b = Shape::matrix(SizeExpr::one(), SizeExpr::sym("M"));
        assert!(Shape::broadcast_to_same(&a, &b).is_ok());
        assert!(Shape::broadcast_to_same_strict(&a, &b).is_err());
    }

    #[test]
    fn num_elems_is_the_dim_product() {
        let shape = Shape::matrix(SizeExpr::sym("N"), SizeExpr::fixed(4));
        let expected = &SizeExpr::sym("N") * &SizeExpr::fixed(4);
        assert_eq!(shape.num_elems(), expected);
    }

    #[test]
    fn mismatched_axes_fail() {
        let a = Shape::vector(SizeExpr::fixed(3));
        let b = Shape::vector(SizeExpr::fixed(4));
        assert!(matches!(
            Shape::broadcast_to_same(&a, &b),
            Err(ShapeError::ShapeMismatch { .. })
        ));
    }
}
