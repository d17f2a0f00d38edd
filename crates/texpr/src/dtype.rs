//! Element types: the opaque runtime name and the typed constructor surface.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque identifier for an element dtype (e.g. `single`, `double`, `int`).
///
/// Every expression carries exactly one of these; the typed surface produces
/// them through [`ElemType`] and the backend keys template instantiations on
/// them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeName(Arc<str>);

impl TypeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage size when the name is a known scalar type.
    pub fn size_in_bytes(&self) -> Option<usize> {
        match self.as_str() {
            "single" | "int" => Some(4),
            "double" | "int64" => Some(8),
            "bool" => Some(1),
            _ => None,
        }
    }

    /// The CUDA/C source spelling when the name is a known scalar type.
    pub fn cuda_type(&self) -> Option<&'static str> {
        match self.as_str() {
            "single" => Some("float"),
            "double" => Some("double"),
            "int" => Some("int"),
            "int64" => Some("long long"),
            "bool" => Some("unsigned char"),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.as_str(), "int" | "int64")
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TypeName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TypeName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(TypeName::new(name))
    }
}

/// Scalar constant payload carried by constant leaves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ConstLit {
    F32(f32),
    F64(f64),
    I32(i32),
    I64(i64),
    Bool(bool),
}

impl ConstLit {
    pub fn type_name(&self) -> TypeName {
        let name = match self {
            ConstLit::F32(_) => "single",
            ConstLit::F64(_) => "double",
            ConstLit::I32(_) => "int",
            ConstLit::I64(_) => "int64",
            ConstLit::Bool(_) => "bool",
        };
        TypeName::new(name)
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            ConstLit::F32(v) => f64::from(*v),
            ConstLit::F64(v) => *v,
            ConstLit::I32(v) => f64::from(*v),
            ConstLit::I64(v) => *v as f64,
            ConstLit::Bool(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// The C source spelling of the constant.
    pub fn c_literal(&self) -> String {
        match self {
            ConstLit::F32(v) => format_float(f64::from(*v), "f"),
            ConstLit::F64(v) => format_float(*v, ""),
            ConstLit::I32(v) => v.to_string(),
            ConstLit::I64(v) => format!("{v}LL"),
            ConstLit::Bool(v) => if *v { "1" } else { "0" }.to_string(),
        }
    }
}

fn format_float(value: f64, suffix: &str) -> String {
    if value.is_nan() {
        return "NAN".to_string();
    }
    if value.is_infinite() {
        return if value.is_sign_negative() {
            "-INFINITY".to_string()
        } else {
            "INFINITY".to_string()
        };
    }
    let base = value.to_string();
    let needs_decimal = !base.contains('.') && !base.contains('e') && !base.contains('E');
    if needs_decimal {
        format!("{base}.0{suffix}")
    } else {
        format!("{base}{suffix}")
    }
}

impl PartialEq for ConstLit {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConstLit::F32(a), ConstLit::F32(b)) => a.to_bits() == b.to_bits(),
            (ConstLit::F64(a), ConstLit::F64(b)) => a.to_bits() == b.to_bits(),
            (ConstLit::I32(a), ConstLit::I32(b)) => a == b,
            (ConstLit::I64(a), ConstLit::I64(b)) => a == b,
            (ConstLit::Bool(a), ConstLit::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ConstLit {}

impl Hash for ConstLit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ConstLit::F32(v) => {
                state.write_u8(0);
                state.write_u32(v.to_bits());
            }
            ConstLit::F64(v) => {
                state.write_u8(1);
                state.write_u64(v.to_bits());
            }
            ConstLit::I32(v) => {
                state.write_u8(2);
                v.hash(state);
            }
            ConstLit::I64(v) => {
                state.write_u8(3);
                v.hash(state);
            }
            ConstLit::Bool(v) => {
                state.write_u8(4);
                v.hash(state);
            }
        }
    }
}

impl fmt::Display for ConstLit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstLit::F32(v) => write!(f, "{v}"),
            ConstLit::F64(v) => write!(f, "{v}"),
            ConstLit::I32(v) => write!(f, "{v}"),
            ConstLit::I64(v) => write!(f, "{v}"),
            ConstLit::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Compile-time view of an element dtype for the typed expression surface.
pub trait ElemType: Copy + fmt::Debug + Send + Sync + 'static {
    const NAME: &'static str;

    fn type_name() -> TypeName {
        TypeName::new(Self::NAME)
    }

    fn lit(self) -> ConstLit;
}

impl ElemType for f32 {
    const NAME: &'static str = "single";

    fn lit(self) -> ConstLit {
        ConstLit::F32(self)
    }
}

impl ElemType for f64 {
    const NAME: &'static str = "double";

    fn lit(self) -> ConstLit {
        ConstLit::F64(self)
    }
}

impl ElemType for i32 {
    const NAME: &'static str = "int";

    fn lit(self) -> ConstLit {
        ConstLit::I32(self)
    }
}

impl ElemType for i64 {
    const NAME: &'static str = "int64";

    fn lit(self) -> ConstLit {
        ConstLit::I64(self)
    }
}

impl ElemType for bool {
    const NAME: &'static str = "bool";

    fn lit(self) -> ConstLit {
        ConstLit::Bool(self)
    }
}

/// Element type of dynamic (runtime-computed) indices.
pub type Idx = i64;
