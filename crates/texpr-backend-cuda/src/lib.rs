//! CUDA lowering backend for symbolic tensor expressions.
//!
//! Takes a type-erased [`UExprGraph`](texpr::UExprGraph) with fully bound
//! sizes and produces a [`Recipe`]: generated kernel and host wrapper
//! source plus ordered init, exec and dispose call lists. The pipeline is
//! single-threaded and deterministic:
//!
//! ```text
//! UExprGraph
//!     |  planner: storage manikins, allocations, execution units
//!     v
//! ExecPlan
//!     |  scheduler: streams, events, rerun fences
//!     v
//! StreamSchedule
//!     |  sequencer: deterministic linearization, template instantiation
//!     v
//! Recipe
//! ```

pub mod calls;
pub mod env;
pub mod error;
pub mod instantiate;
pub mod manikin;
pub mod planner;
pub mod recipe;
pub mod scheduler;
pub mod sequencer;
pub mod unit;

use texpr::{ElemType, Expr, UExprGraph};

pub use calls::{DriverCall, EventFlags, StreamFlags};
pub use env::{CompileEnv, VarPlacement};
pub use error::{CompileError, PlanError, ScheduleError};
pub use instantiate::TemplateCache;
pub use manikin::{Manikin, ManikinStorage, MemAlloc};
pub use recipe::{Recipe, RECIPE_VERSION};
pub use scheduler::{StreamCmd, StreamSchedule};
pub use unit::{BlasOp, ExecPlan, ExecUnit, KernelArg, KernelDomain, PrimOp, TemplateInstance};

/// Compiles a checked typed expression down to a recipe.
pub fn compile<T: ElemType>(expr: &Expr<T>, env: &CompileEnv) -> Result<Recipe, CompileError> {
    expr.check()?;
    let graph = UExprGraph::lower(expr);
    compile_graph(&graph, env)
}

/// Compiles an already-lowered unified graph down to a recipe.
pub fn compile_graph(graph: &UExprGraph, env: &CompileEnv) -> Result<Recipe, CompileError> {
    let plan = planner::plan(graph, env)?;
    unit::validate_unit_topology(&plan.units)?;
    let schedule = scheduler::schedule(&plan.units);
    let mut cache = TemplateCache::new();
    let exec_calls = sequencer::sequence(&schedule, &mut cache)?;
    let init_unit_calls = sequencer::sequence_init(&plan.init_units, &mut cache);
    Ok(recipe::assemble(
        &plan,
        &schedule,
        exec_calls,
        init_unit_calls,
        &cache,
        env,
    ))
}
