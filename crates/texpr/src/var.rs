use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::TypeName;
use crate::shape::Shape;
use crate::size::SymSizeEnv;

/// Names an external tensor variable. Identity is the whole triple: two
/// specs with the same name but different shape or dtype are different
/// variables.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarSpec {
    pub name: String,
    pub shape: Shape,
    pub dtype: TypeName,
}

impl VarSpec {
    pub fn new(name: impl Into<String>, shape: Shape, dtype: TypeName) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
        }
    }

    pub fn subst(&self, env: &SymSizeEnv) -> VarSpec {
        VarSpec {
            name: self.name.clone(),
            shape: self.shape.subst(env),
            dtype: self.dtype.clone(),
        }
    }
}

impl fmt::Display for VarSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>{}", self.name, self.dtype, self.shape)
    }
}
