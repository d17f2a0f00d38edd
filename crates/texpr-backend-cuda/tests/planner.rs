use texpr::{Expr, Idx, Range, Shape, SizeExpr, SymSizeEnv, UExprGraph};
use texpr_backend_cuda::{
    planner, CompileEnv, ExecPlan, KernelArg, ManikinStorage, PlanError, PrimOp, VarPlacement,
};

fn launch_dst(plan: &ExecPlan, unit: usize) -> ManikinStorage {
    let PrimOp::LaunchKernel { args, .. } = &plan.units[unit].ops[0] else {
        panic!("expected a kernel launch");
    };
    let KernelArg::Buf(dst) = &args[0] else {
        panic!("expected a buffer destination");
    };
    dst.storage.clone()
}

fn dev_env(expr_vars: &texpr::Expr<f32>) -> CompileEnv {
    let mut env = CompileEnv::new();
    for var in expr_vars.extract_vars() {
        env = env.place(var, VarPlacement::Dev);
    }
    env
}

#[test]
fn missing_placement_is_reported() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::vector(SizeExpr::fixed(4)),
    ))
    .unwrap();
    let graph = UExprGraph::lower(&x.tanh());
    let err = planner::plan(&graph, &CompileEnv::new()).unwrap_err();
    assert!(matches!(err, PlanError::PlacementMissing { .. }));
}

#[test]
fn unresolved_symbols_are_enumerated() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::vector(SizeExpr::sym("N")),
    ))
    .unwrap();
    let e = x.tanh();
    let graph = UExprGraph::lower(&e);
    let err = planner::plan(&graph, &dev_env(&e)).unwrap_err();
    let PlanError::UnresolvedSymbols { symbols } = err else {
        panic!("expected an unresolved-symbol failure");
    };
    assert_eq!(symbols, vec!["N".to_string()]);
}

#[test]
fn zeros_allocates_and_memsets() {
    let out = Expr::<f32>::var_spec(
        "out",
        Shape::matrix(SizeExpr::fixed(2), SizeExpr::fixed(3)),
    );
    let e = Expr::<f32>::zeros(Shape::matrix(SizeExpr::fixed(2), SizeExpr::fixed(3)))
        .store_to(out.clone())
        .unwrap();
    let env = CompileEnv::new().place(out, VarPlacement::Dev);
    let graph = UExprGraph::lower(&e);
    let plan = planner::plan(&graph, &env).unwrap();

    assert_eq!(plan.allocs.len(), 1);
    assert_eq!(plan.allocs[0].bytes, 24);
    assert_eq!(plan.units.len(), 2);
    assert!(matches!(plan.units[0].ops[0], PrimOp::Memset { value: 0, .. }));
    assert!(matches!(plan.units[1].ops[0], PrimOp::MemcpyDtoD { .. }));
    assert_eq!(plan.units[1].depends_on, vec![0]);
}

#[test]
fn pure_views_emit_no_ops() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::matrix(SizeExpr::fixed(2), SizeExpr::fixed(3)),
    ))
    .unwrap();
    let out = Expr::<f32>::var_spec(
        "out",
        Shape::matrix(SizeExpr::fixed(3), SizeExpr::fixed(2)),
    );
    let e = x.swap_dim(0, 1).unwrap().store_to(out).unwrap();
    let graph = UExprGraph::lower(&e);
    let plan = planner::plan(&graph, &dev_env(&e)).unwrap();

    assert!(plan.allocs.is_empty());
    assert_eq!(plan.units.len(), 1);
    let PrimOp::MemcpyDtoD { src, .. } = &plan.units[0].ops[0] else {
        panic!("expected the store copy");
    };
    assert_eq!(src.dims, vec![3, 2]);
    assert_eq!(src.strides, vec![1, 3]);
}

#[test]
fn elementwise_chains_run_in_place() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::vector(SizeExpr::fixed(4)),
    ))
    .unwrap();
    let out = Expr::<f32>::var_spec("out", Shape::vector(SizeExpr::fixed(4)));
    let e = x.tanh().exp().store_to(out).unwrap();
    let graph = UExprGraph::lower(&e);
    let plan = planner::plan(&graph, &dev_env(&e)).unwrap();

    // tanh allocates; exp reuses the same buffer in place.
    assert_eq!(plan.allocs.len(), 1);
    assert_eq!(launch_dst(&plan, 0), launch_dst(&plan, 1));
    // Overwriting a buffer an earlier unit touched makes that unit the
    // rerun fence.
    assert_eq!(plan.units[1].rerun_after, vec![0]);
}

#[test]
fn host_inputs_upload_during_init_and_are_never_reused_in_place() {
    let x_spec = Expr::<f32>::var_spec("x", Shape::vector(SizeExpr::fixed(4)));
    let out = Expr::<f32>::var_spec("out", Shape::vector(SizeExpr::fixed(4)));
    let x = Expr::<f32>::var(x_spec.clone()).unwrap();
    let e = x.tanh().store_to(out.clone()).unwrap();
    let env = CompileEnv::new()
        .place(x_spec, VarPlacement::Host)
        .place(out, VarPlacement::Dev);
    let graph = UExprGraph::lower(&e);
    let plan = planner::plan(&graph, &env).unwrap();

    assert_eq!(plan.init_units.len(), 1);
    assert!(matches!(
        plan.init_units[0].ops[0],
        PrimOp::MemcpyHtoD { .. }
    ));
    // The upload buffer and the tanh result stay separate: the upload runs
    // once, the kernel every pass.
    assert_eq!(plan.allocs.len(), 2);
}

#[test]
fn dynamic_subtensor_launches_a_gather_kernel() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::vector(SizeExpr::fixed(8)),
    ))
    .unwrap();
    let out = Expr::<f32>::var_spec("out", Shape::vector(SizeExpr::fixed(2)));
    let start = Expr::<Idx>::size_value(SizeExpr::fixed(3));
    let e = x
        .slice(&[Range::DynSpan {
            start,
            size: SizeExpr::fixed(2),
        }])
        .unwrap()
        .store_to(out)
        .unwrap();
    let graph = UExprGraph::lower(&e);
    let plan = planner::plan(&graph, &dev_env(&e)).unwrap();

    let gather = plan
        .units
        .iter()
        .flat_map(|unit| unit.ops.iter())
        .find_map(|op| match op {
            PrimOp::LaunchKernel { inst, args, .. }
                if inst.func_name == "subtensor_copy" =>
            {
                Some(args.clone())
            }
            _ => None,
        })
        .expect("dynamic slice must lower to a gather kernel");
    // dst, src, then the runtime start index as a scalar buffer.
    assert_eq!(gather.len(), 3);
    assert!(matches!(&gather[2], KernelArg::Buf(m) if m.dtype.as_str() == "int64"));
}

#[derive(Debug)]
struct Softsign;

impl texpr::ExtensionOp for Softsign {
    fn name(&self) -> &str {
        "softsign"
    }

    fn arity(&self) -> usize {
        1
    }

    fn shape_of(&self, args: &[Shape]) -> Result<Shape, texpr::ShapeError> {
        Ok(args[0].clone())
    }

    fn lowering(&self) -> texpr::ExtensionLowering {
        texpr::ExtensionLowering::DeviceKernel {
            func_name: "softsign".to_string(),
        }
    }
}

#[test]
fn extension_ops_lower_through_their_descriptor() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::vector(SizeExpr::fixed(4)),
    ))
    .unwrap();
    let out = Expr::<f32>::var_spec("out", Shape::vector(SizeExpr::fixed(4)));
    let applied = Expr::extension(std::sync::Arc::new(Softsign), &[x]).unwrap();
    let e = applied.store_to(out).unwrap();
    let graph = UExprGraph::lower(&e);
    let plan = planner::plan(&graph, &dev_env(&e)).unwrap();

    let launched = plan
        .units
        .iter()
        .flat_map(|unit| unit.ops.iter())
        .any(|op| matches!(op, PrimOp::LaunchKernel { inst, .. } if inst.func_name == "softsign"));
    assert!(launched);
}

#[test]
fn static_subtensor_is_a_view() {
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::vector(SizeExpr::sym("N")),
    ))
    .unwrap();
    let out = Expr::<f32>::var_spec("out", Shape::vector(SizeExpr::fixed(2)));
    let e = x
        .slice(&[Range::Span(
            Some(SizeExpr::fixed(1)),
            Some(SizeExpr::fixed(2)),
        )])
        .unwrap()
        .store_to(out)
        .unwrap();
    let e = e.subst_sym_sizes(&SymSizeEnv::new().bind("N", 8)).unwrap();
    let graph = UExprGraph::lower(&e);
    let plan = planner::plan(&graph, &dev_env(&e)).unwrap();

    assert!(plan.allocs.is_empty());
    assert_eq!(plan.units.len(), 1);
    let PrimOp::MemcpyDtoD { src, .. } = &plan.units[0].ops[0] else {
        panic!("expected the store copy");
    };
    assert_eq!(src.offset, 1);
    assert_eq!(src.dims, vec![2]);
}
