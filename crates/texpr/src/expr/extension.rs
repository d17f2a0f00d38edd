use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::TypeName;
use crate::error::ShapeError;
use crate::shape::Shape;

/// How the backend realizes an extension op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtensionLowering {
    /// Launch a device kernel template of the given name over the result
    /// elements, with the operands appended as kernel arguments.
    DeviceKernel { func_name: String },
    /// Call a host-side function template through a delegate.
    HostCall {
        func_name: String,
        delegate: String,
    },
}

/// User-supplied operation slot.
///
/// Implementations declare their arity and shape rule up front; the backend
/// lowers them through the descriptor returned by
/// [`ExtensionOp::lowering`] rather than through runtime reflection.
pub trait ExtensionOp: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn arity(&self) -> usize;

    fn shape_of(&self, args: &[Shape]) -> Result<Shape, ShapeError>;

    /// Result dtype; defaults to the first operand's. Nullary ops must
    /// override this.
    fn result_dtype(&self, args: &[TypeName]) -> Option<TypeName> {
        args.first().cloned()
    }

    fn lowering(&self) -> ExtensionLowering;
}
