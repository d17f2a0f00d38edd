//! The indexing surface: heterogeneous per-axis range arguments compiled
//! into a simple subtensor plus a reshape.

use std::sync::Arc;

use crate::dtype::{ElemType, Idx};
use crate::error::ShapeError;
use crate::shape::Shape;
use crate::size::SizeExpr;

use super::{Expr, SimpleRange, SimpleRangeSpec};

/// One axis argument of [`Expr::slice`].
#[derive(Debug, Clone)]
pub enum Range {
    /// Inclusive span with optional open endpoints: `None` start means the
    /// first element, `None` end means the last.
    Span(Option<SizeExpr>, Option<SizeExpr>),
    /// Runtime start index with a symbolic extent.
    DynSpan { start: Expr<Idx>, size: SizeExpr },
    /// A single symbolic element; the axis is dropped from the result.
    Elem(SizeExpr),
    /// A single runtime-computed element; the axis is dropped.
    DynElem(Expr<Idx>),
    /// Inserts a broadcastable axis of extent one.
    NewAxis,
    /// Wildcard expanding to full spans over all remaining axes.
    Fill,
}

enum OutAxis {
    Keep,
    Drop,
    New,
}

fn full_span() -> SimpleRange {
    SimpleRange::SymStartSymEnd {
        start: SizeExpr::zero(),
        end: None,
    }
}

fn is_full_span(range: &SimpleRange) -> bool {
    matches!(
        range,
        SimpleRange::SymStartSymEnd { start, end: None } if *start == SizeExpr::zero()
    )
}

impl<T: ElemType> Expr<T> {
    /// Slices by a heterogeneous argument list and compiles it into
    /// `(Subtensor(simple spec), Reshape)`. Dropped element axes and
    /// inserted `NewAxis` entries are realized by the trailing reshape; a
    /// slice that needs neither lowers to the subtensor alone.
    pub fn slice(&self, ranges: &[Range]) -> Result<Expr<T>, ShapeError> {
        let rank = self.shape().rank();
        let fills = ranges
            .iter()
            .filter(|range| matches!(range, Range::Fill))
            .count();
        if fills > 1 {
            return Err(ShapeError::rank_mismatch(
                "slice",
                "at most one Fill argument is allowed",
            ));
        }
        let consumed = ranges
            .iter()
            .filter(|range| !matches!(range, Range::NewAxis | Range::Fill))
            .count();
        if consumed > rank {
            return Err(ShapeError::rank_mismatch(
                "slice",
                format!("{consumed} axis arguments but operand rank is {rank}"),
            ));
        }
        let remaining = rank - consumed;

        let mut simple: SimpleRangeSpec = Vec::new();
        let mut out_axes: Vec<OutAxis> = Vec::new();
        for range in ranges {
            match range {
                Range::Span(start, end) => {
                    simple.push(SimpleRange::SymStartSymEnd {
                        start: start.clone().unwrap_or_else(SizeExpr::zero),
                        end: end.clone(),
                    });
                    out_axes.push(OutAxis::Keep);
                }
                Range::DynSpan { start, size } => {
                    simple.push(SimpleRange::DynStartSymSize {
                        start: Arc::clone(start.node()),
                        size: size.clone(),
                    });
                    out_axes.push(OutAxis::Keep);
                }
                Range::Elem(index) => {
                    simple.push(SimpleRange::SymStartSymEnd {
                        start: index.clone(),
                        end: Some(index.clone()),
                    });
                    out_axes.push(OutAxis::Drop);
                }
                Range::DynElem(index) => {
                    simple.push(SimpleRange::DynStartSymSize {
                        start: Arc::clone(index.node()),
                        size: SizeExpr::one(),
                    });
                    out_axes.push(OutAxis::Drop);
                }
                Range::NewAxis => out_axes.push(OutAxis::New),
                Range::Fill => {
                    for _ in 0..remaining {
                        simple.push(full_span());
                        out_axes.push(OutAxis::Keep);
                    }
                }
            }
        }
        if fills == 0 {
            for _ in 0..remaining {
                simple.push(full_span());
                out_axes.push(OutAxis::Keep);
            }
        }

        while simple.last().map(is_full_span).unwrap_or(false) {
            simple.pop();
        }
        let sub = if simple.is_empty() {
            self.clone()
        } else {
            self.subtensor(simple)?
        };

        let needs_reshape = out_axes
            .iter()
            .any(|axis| !matches!(axis, OutAxis::Keep));
        if !needs_reshape {
            return Ok(sub);
        }

        let mut dims = Vec::new();
        let mut sub_dims = sub.shape().dims().iter();
        for axis in &out_axes {
            match axis {
                OutAxis::Keep => {
                    if let Some(dim) = sub_dims.next() {
                        dims.push(dim.clone());
                    }
                }
                OutAxis::Drop => {
                    let _ = sub_dims.next();
                }
                OutAxis::New => dims.push(SizeExpr::broadcast()),
            }
        }
        sub.reshape(Shape::new(dims))
    }
}
