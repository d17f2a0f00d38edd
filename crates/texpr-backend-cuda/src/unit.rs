//! Execution units and the primitive device operations they carry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use texpr::{ConstLit, UExprId, VarSpec};

use crate::error::PlanError;
use crate::manikin::{Manikin, MemAlloc};

/// Whether a generated wrapper lives in the kernel or the host module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelDomain {
    Device,
    Host,
}

/// Identifies one instantiation of a C++ function template. Equal tuples
/// share a generated wrapper symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateInstance {
    pub func_name: String,
    pub domain: KernelDomain,
    pub tmpl_args: Vec<String>,
    pub ret_type: String,
    pub arg_types: Vec<String>,
}

/// Argument of a kernel launch or host call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelArg {
    Buf(Manikin),
    Lit(ConstLit),
    Size(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlasOp {
    NonTranspose,
    Transpose,
}

/// A single device-level action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimOp {
    LaunchKernel {
        inst: TemplateInstance,
        work: Vec<u64>,
        args: Vec<KernelArg>,
    },
    CallCFunc {
        inst: TemplateInstance,
        delegate: String,
        args: Vec<KernelArg>,
    },
    MemcpyDtoD {
        src: Manikin,
        dst: Manikin,
    },
    MemcpyHtoD {
        src: VarSpec,
        dst: Manikin,
    },
    MemcpyDtoH {
        src: Manikin,
        dst: VarSpec,
    },
    Memset {
        value: u32,
        dst: Manikin,
    },
    BlasGemm {
        op_a: BlasOp,
        op_b: BlasOp,
        alpha: f64,
        a: Manikin,
        b: Manikin,
        beta: f64,
        c: Manikin,
    },
    Trace {
        uexpr: String,
        result: Manikin,
    },
}

pub type UnitId = usize;

/// Atomic scheduling item: primitive ops that must run together, plus the
/// dependency edges the scheduler has to honor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecUnit {
    pub id: UnitId,
    pub ops: Vec<PrimOp>,
    pub depends_on: Vec<UnitId>,
    /// Units whose previous-iteration execution must complete before this
    /// unit may run again inside a loop.
    pub rerun_after: Vec<UnitId>,
}

/// Planner output: the unit DAG, one-shot init units, owned allocations and
/// the manikin chosen for every expression node.
#[derive(Debug, Clone, Default)]
pub struct ExecPlan {
    pub units: Vec<ExecUnit>,
    pub init_units: Vec<ExecUnit>,
    pub allocs: Vec<MemAlloc>,
    pub manikins: HashMap<UExprId, Manikin>,
}

/// Checks that every dependency edge points at an earlier unit, mirroring
/// the planner's topological construction order.
pub fn validate_unit_topology(units: &[ExecUnit]) -> Result<(), PlanError> {
    for unit in units {
        for &dependency in unit.depends_on.iter().chain(unit.rerun_after.iter()) {
            if dependency >= unit.id {
                return Err(PlanError::Topology {
                    unit: unit.id,
                    dependency,
                });
            }
        }
    }
    Ok(())
}
