use texpr::{Expr, Shape, SizeExpr, SymSizeEnv, TypeName, VarSpec};
use texpr_backend_cuda::{
    compile, scheduler, sequencer, CompileEnv, DriverCall, ExecUnit, Manikin, ManikinStorage,
    PrimOp, Recipe, TemplateCache, VarPlacement,
};

fn place_all(expr: &Expr<f32>, host: &[&str]) -> CompileEnv {
    let mut env = CompileEnv::new();
    for var in expr.extract_vars() {
        let placement = if host.contains(&var.name.as_str()) {
            VarPlacement::Host
        } else {
            VarPlacement::Dev
        };
        env = env.place(var, placement);
    }
    env
}

fn count_calls(calls: &[DriverCall], pred: impl Fn(&DriverCall) -> bool) -> usize {
    calls.iter().filter(|call| pred(call)).count()
}

/// Every wait must see its event recorded earlier in the call list.
fn assert_event_order(calls: &[DriverCall]) {
    let mut recorded = std::collections::HashSet::new();
    for call in calls {
        match call {
            DriverCall::EventRecord { event, .. } => {
                recorded.insert(*event);
            }
            DriverCall::StreamWaitEvent { event, .. } => {
                assert!(
                    recorded.contains(event),
                    "wait on event {event} before any record"
                );
            }
            _ => {}
        }
    }
}

#[test]
fn sum_of_squared_difference_lowers_to_kernels_and_one_reduction() {
    let shape = Shape::matrix(SizeExpr::sym("N"), SizeExpr::sym("M"));
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", shape.clone())).unwrap();
    let y = Expr::<f32>::var(Expr::<f32>::var_spec("y", shape)).unwrap();
    let two = Expr::<f32>::scalar(2.0);
    let result = Expr::<f32>::var_spec("r", Shape::scalar());
    let e = (&x - &y)
        .try_pow(&two)
        .unwrap()
        .sum()
        .store_to(result)
        .unwrap();
    let e = e
        .subst_sym_sizes(&SymSizeEnv::new().bind("N", 3).bind("M", 4))
        .unwrap();
    assert!(e.can_eval_all_sym_sizes());

    let env = place_all(&e, &["r"]);
    let recipe = compile(&e, &env).unwrap();

    let reductions = count_calls(&recipe.exec_calls, |call| {
        matches!(call, DriverCall::CallCFunc { name, .. } if name.starts_with("sum"))
    });
    assert_eq!(reductions, 1);
    assert_eq!(
        count_calls(&recipe.exec_calls, |call| matches!(
            call,
            DriverCall::BlasGemm { .. }
        )),
        0
    );
    assert!(
        count_calls(&recipe.exec_calls, |call| matches!(
            call,
            DriverCall::LaunchCKernel { .. }
        )) >= 2
    );
    // Host-placed result: the last call downloads it.
    assert!(matches!(
        recipe.exec_calls.last(),
        Some(DriverCall::MemcpyDtoHAsync { host_dst, .. }) if host_dst.name == "r"
    ));
    // Device-placed inputs: nothing is uploaded during init.
    assert_eq!(
        count_calls(&recipe.init_calls, |call| matches!(
            call,
            DriverCall::MemcpyHtoDAsync { .. }
        )),
        0
    );
    assert_event_order(&recipe.exec_calls);
}

#[test]
fn affine_map_uses_one_gemm_one_stream_and_no_events() {
    let w = Expr::<f32>::var(Expr::<f32>::var_spec(
        "w",
        Shape::matrix(SizeExpr::fixed(2), SizeExpr::fixed(3)),
    ))
    .unwrap();
    let x = Expr::<f32>::var(Expr::<f32>::var_spec(
        "x",
        Shape::vector(SizeExpr::fixed(3)),
    ))
    .unwrap();
    let b = Expr::<f32>::var(Expr::<f32>::var_spec(
        "b",
        Shape::vector(SizeExpr::fixed(2)),
    ))
    .unwrap();
    let out = Expr::<f32>::var_spec("out", Shape::vector(SizeExpr::fixed(2)));
    let e = w.dot(&x).unwrap().try_add(&b).unwrap().store_to(out).unwrap();

    let recipe = compile(&e, &place_all(&e, &[])).unwrap();

    assert_eq!(
        count_calls(&recipe.exec_calls, |call| matches!(
            call,
            DriverCall::BlasGemm { .. }
        )),
        1
    );
    assert_eq!(
        count_calls(&recipe.init_calls, |call| matches!(
            call,
            DriverCall::StreamCreate { .. }
        )),
        1
    );
    assert_eq!(
        count_calls(&recipe.exec_calls, |call| matches!(
            call,
            DriverCall::EventRecord { .. } | DriverCall::StreamWaitEvent { .. }
        )),
        0
    );
}

#[test]
fn independent_branches_get_two_streams_and_one_event() {
    let shape = Shape::vector(SizeExpr::fixed(4));
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", shape.clone())).unwrap();
    let y = Expr::<f32>::var(Expr::<f32>::var_spec("y", shape.clone())).unwrap();
    let out = Expr::<f32>::var_spec("out", shape);
    let e = x.tanh().try_mul(&y.tanh()).unwrap().store_to(out).unwrap();

    let recipe = compile(&e, &place_all(&e, &[])).unwrap();

    assert_eq!(
        count_calls(&recipe.init_calls, |call| matches!(
            call,
            DriverCall::StreamCreate { .. }
        )),
        2
    );
    let records = count_calls(&recipe.exec_calls, |call| {
        matches!(call, DriverCall::EventRecord { .. })
    });
    let waits = count_calls(&recipe.exec_calls, |call| {
        matches!(call, DriverCall::StreamWaitEvent { .. })
    });
    assert_eq!(records, 1);
    assert_eq!(waits, 1);
    assert_event_order(&recipe.exec_calls);
    // The wait guards the multiply launch: it must come before the final
    // kernel on the consuming stream.
    let wait_at = recipe
        .exec_calls
        .iter()
        .position(|call| matches!(call, DriverCall::StreamWaitEvent { .. }))
        .unwrap();
    let last_launch = recipe
        .exec_calls
        .iter()
        .rposition(|call| matches!(call, DriverCall::LaunchCKernel { .. }))
        .unwrap();
    assert!(wait_at < last_launch);
}

#[test]
fn device_to_host_store_downloads_last_and_uploads_nothing() {
    let shape = Shape::vector(SizeExpr::fixed(4));
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", shape.clone())).unwrap();
    let host_out = Expr::<f32>::var_spec("host_out", shape);
    let e = x.tanh().store_to(host_out).unwrap();

    let recipe = compile(&e, &place_all(&e, &["host_out"])).unwrap();

    assert!(matches!(
        recipe.exec_calls.last(),
        Some(DriverCall::MemcpyDtoHAsync { host_dst, .. }) if host_dst.name == "host_out"
    ));
    assert_eq!(
        count_calls(&recipe.init_calls, |call| matches!(
            call,
            DriverCall::MemcpyHtoDAsync { host_src, .. } if host_src.name == "host_out"
        )),
        0
    );
}

fn marker_unit(id: usize, deps: &[usize], value: u32) -> ExecUnit {
    ExecUnit {
        id,
        ops: vec![PrimOp::Memset {
            value,
            dst: Manikin::contiguous(
                vec![1],
                TypeName::new("single"),
                ManikinStorage::Alloc(id),
            ),
        }],
        depends_on: deps.to_vec(),
        rerun_after: Vec::new(),
    }
}

#[test]
fn diamond_linearization_respects_every_dependency() {
    // A -> B, A -> C, (B, C) -> D, with the memset value marking the unit.
    let units = vec![
        marker_unit(0, &[], 0),
        marker_unit(1, &[0], 1),
        marker_unit(2, &[0], 2),
        marker_unit(3, &[1, 2], 3),
    ];
    let schedule = scheduler::schedule(&units);
    let mut cache = TemplateCache::new();
    let calls = sequencer::sequence(&schedule, &mut cache).unwrap();

    let position = |value: u32| {
        calls
            .iter()
            .position(|call| matches!(call, DriverCall::MemsetD32Async { value: v, .. } if *v == value))
            .unwrap()
    };
    assert!(position(0) < position(1));
    assert!(position(0) < position(2));
    assert!(position(1) < position(3));
    assert!(position(2) < position(3));
    assert_event_order(&calls);
}

#[test]
fn cross_stream_rerun_fences_use_prebound_events() {
    // u2 overwrites storage u1 read, and u1 lands on the other stream.
    let mut units = vec![
        marker_unit(0, &[], 0),
        marker_unit(1, &[], 1),
        marker_unit(2, &[0], 2),
    ];
    units[2].rerun_after = vec![1];
    let schedule = scheduler::schedule(&units);
    let mut cache = TemplateCache::new();
    let calls = sequencer::sequence(&schedule, &mut cache).unwrap();

    assert!(schedule.event_object_count >= 1);
    assert_eq!(
        count_calls(&calls, |call| matches!(
            call,
            DriverCall::EventRecord { .. }
        )),
        1
    );
    assert_eq!(
        count_calls(&calls, |call| matches!(
            call,
            DriverCall::StreamWaitEvent { .. }
        )),
        1
    );
    assert_event_order(&calls);
}

#[test]
fn resources_balance_between_init_and_dispose() {
    let shape = Shape::vector(SizeExpr::fixed(4));
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", shape.clone())).unwrap();
    let y = Expr::<f32>::var(Expr::<f32>::var_spec("y", shape.clone())).unwrap();
    let out = Expr::<f32>::var_spec("out", shape);
    let e = x.tanh().try_mul(&y.tanh()).unwrap().store_to(out).unwrap();
    let recipe = compile(&e, &place_all(&e, &[])).unwrap();

    let allocs: Vec<usize> = recipe
        .init_calls
        .iter()
        .filter_map(|call| match call {
            DriverCall::MemAlloc { alloc } => Some(alloc.id),
            _ => None,
        })
        .collect();
    let mut frees: Vec<usize> = recipe
        .dispose_calls
        .iter()
        .filter_map(|call| match call {
            DriverCall::MemFree { alloc } => Some(*alloc),
            _ => None,
        })
        .collect();
    frees.reverse();
    assert_eq!(allocs, frees);

    for (create, destroy) in [
        ("StreamCreate", "StreamDestroy"),
        ("EventCreate", "EventDestroy"),
    ] {
        let created = count_calls(&recipe.init_calls, |call| {
            call.to_string().starts_with(create)
        });
        let destroyed = count_calls(&recipe.dispose_calls, |call| {
            call.to_string().starts_with(destroy)
        });
        assert_eq!(created, destroyed, "{create} vs {destroy}");
    }
}

#[test]
fn identical_template_tuples_share_one_wrapper() {
    let shape = Shape::vector(SizeExpr::fixed(4));
    let mut vars = Vec::new();
    for name in ["a", "b", "c", "d"] {
        vars.push(Expr::<f32>::var(Expr::<f32>::var_spec(name, shape.clone())).unwrap());
    }
    let out = Expr::<f32>::var_spec("out", shape);
    let left = vars[0].try_add(&vars[1]).unwrap();
    let right = vars[2].try_add(&vars[3]).unwrap();
    let e = left.try_add(&right).unwrap().store_to(out).unwrap();
    let recipe = compile(&e, &place_all(&e, &[])).unwrap();

    let names: Vec<&str> = recipe
        .exec_calls
        .iter()
        .filter_map(|call| match call {
            DriverCall::LaunchCKernel { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(names.len(), 3);
    assert!(names.iter().all(|name| *name == "map_binary_0"));
    assert_eq!(recipe.kernel_code.matches("void map_binary_0").count(), 1);
}

#[test]
fn warmup_replays_exec_calls_during_init() {
    let shape = Shape::vector(SizeExpr::fixed(4));
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", shape.clone())).unwrap();
    let out = Expr::<f32>::var_spec("out", shape);
    let e = x.tanh().store_to(out).unwrap();
    let env = place_all(&e, &[]).with_warmup();
    let recipe = compile(&e, &env).unwrap();

    let tail = &recipe.init_calls[recipe.init_calls.len() - recipe.exec_calls.len()..];
    assert_eq!(tail, recipe.exec_calls.as_slice());
}

#[test]
fn debug_trace_appends_trace_calls_per_unit() {
    let shape = Shape::vector(SizeExpr::fixed(4));
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", shape.clone())).unwrap();
    let out = Expr::<f32>::var_spec("out", shape);
    let e = x.tanh().store_to(out).unwrap();
    let env = place_all(&e, &[]).with_trace();
    let recipe = compile(&e, &env).unwrap();

    let traces: Vec<&str> = recipe
        .exec_calls
        .iter()
        .filter_map(|call| match call {
            DriverCall::Trace { uexpr, .. } => Some(uexpr.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(traces, vec!["tanh"]);
}

#[test]
fn recipes_round_trip_through_json() {
    let shape = Shape::vector(SizeExpr::fixed(4));
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", shape.clone())).unwrap();
    let out = Expr::<f32>::var_spec("out", shape);
    let e = x.tanh().store_to(out).unwrap();
    let recipe = compile(&e, &place_all(&e, &[])).unwrap();

    let text = recipe.to_json_string().unwrap();
    let loaded = Recipe::from_json_str(&text).unwrap();
    assert_eq!(loaded.exec_calls, recipe.exec_calls);
    assert_eq!(loaded.kernel_code, recipe.kernel_code);

    let tampered = text.replace("texpr-recipe.v1", "texpr-recipe.v0");
    assert!(Recipe::from_json_str(&tampered).is_err());
}

#[test]
fn generated_sources_carry_the_module_preludes() {
    let shape = Shape::vector(SizeExpr::fixed(4));
    let x = Expr::<f32>::var(Expr::<f32>::var_spec("x", shape)).unwrap();
    let e = x
        .tanh()
        .sum()
        .store_to(Expr::<f32>::var_spec("s", Shape::scalar()))
        .unwrap();
    let recipe = compile(&e, &place_all(&e, &["s"])).unwrap();

    for include in ["Utils.cuh", "NDSupport.cuh", "Subtensor.cuh", "Ops.cuh"] {
        assert!(recipe.kernel_code.contains(include));
        assert!(recipe.host_code.contains(include));
    }
    for include in ["ThrustInterface.cuh", "Reduce.cuh", "stdio.h"] {
        assert!(recipe.host_code.contains(include));
    }
    assert!(recipe.kernel_code.contains("__global__"));
    assert!(recipe.host_code.contains("DLL_EXPORT"));
}

#[test]
fn store_into_read_variable_orders_after_the_read() {
    // v is both read and overwritten; the store must come after the kernel
    // that consumes the old value.
    let shape = Shape::vector(SizeExpr::fixed(4));
    let v_spec = Expr::<f32>::var_spec("v", shape.clone());
    let v = Expr::<f32>::var(v_spec.clone()).unwrap();
    let e = v.tanh().store_to(v_spec).unwrap();
    let recipe = compile(&e, &place_all(&e, &[])).unwrap();

    let launch = recipe
        .exec_calls
        .iter()
        .position(|call| matches!(call, DriverCall::LaunchCKernel { .. }))
        .unwrap();
    let copy = recipe
        .exec_calls
        .iter()
        .position(|call| matches!(call, DriverCall::MemcpyAsync { .. }))
        .unwrap();
    assert!(launch < copy);
}

#[test]
fn render_calls_lists_every_section() {
    let shape = Shape::vector(SizeExpr::fixed(2));
    let x = Expr::<f32>::var(VarSpec::new("x", shape.clone(), TypeName::new("single")))
        .unwrap();
    let out = Expr::<f32>::var_spec("out", shape);
    let e = x.exp().store_to(out).unwrap();
    let recipe = compile(&e, &place_all(&e, &[])).unwrap();
    let listing = recipe.render_calls();
    assert!(listing.contains("init:"));
    assert!(listing.contains("exec:"));
    assert!(listing.contains("dispose:"));
    assert!(listing.contains("LaunchCKernel(map_unary_0"));
}
