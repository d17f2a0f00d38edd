//! Shape-polymorphic symbolic tensor expression graphs.
//!
//! This crate is the portable front half of the compiler: a typed
//! constructor surface over an immutable expression DAG with symbolic shape
//! inference, checking and substitution, plus the type-erased unified form
//! the lowering backend consumes.

pub mod dtype;
pub mod error;
pub mod expr;
pub mod hashing;
pub mod shape;
pub mod size;
pub mod uexpr;
pub mod var;

pub use dtype::{ConstLit, ElemType, Idx, TypeName};
pub use error::ShapeError;
pub use expr::{Expr, ExtensionLowering, ExtensionOp, Range};
pub use shape::Shape;
pub use size::{SizeExpr, SizeSymbol, SymSizeEnv};
pub use uexpr::{UExprGraph, UExprId, UExprNode, UOp};
pub use var::VarSpec;
