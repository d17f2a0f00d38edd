//! The execution-unit planner.
//!
//! Walks the unified expression graph post-order, picks a storage manikin
//! for every node (reusing an operand in place when that is provably safe),
//! emits primitive device ops grouped into execution units, and records the
//! data-dependency edges between units. Pure layout changes (reshape, swap,
//! broadcast, static subtensor) produce views instead of ops.

use std::collections::{BTreeSet, HashMap};

use texpr::uexpr::{UExprGraph, UExprNode, UOp, URange};
use texpr::{ConstLit, ExtensionLowering, TypeName, UExprId};

use crate::env::{CompileEnv, VarPlacement};
use crate::error::PlanError;
use crate::manikin::{Manikin, ManikinStorage, MemAlloc};
use crate::unit::{
    BlasOp, ExecPlan, ExecUnit, KernelArg, KernelDomain, PrimOp, TemplateInstance, UnitId,
};

pub fn plan(graph: &UExprGraph, env: &CompileEnv) -> Result<ExecPlan, PlanError> {
    let unresolved = graph.unresolved_symbols();
    if !unresolved.is_empty() {
        return Err(PlanError::UnresolvedSymbols {
            symbols: unresolved
                .iter()
                .map(|sym| sym.as_str().to_string())
                .collect(),
        });
    }

    let mut planner = Planner {
        graph,
        env,
        use_counts: graph.use_counts(),
        manikins: vec![None; graph.len()],
        producers: vec![None; graph.len()],
        units: Vec::new(),
        init_units: Vec::new(),
        allocs: Vec::new(),
        readers: HashMap::new(),
    };
    for id in graph.ids() {
        planner.plan_node(id)?;
    }
    Ok(planner.finish())
}

struct Planner<'a> {
    graph: &'a UExprGraph,
    env: &'a CompileEnv,
    use_counts: Vec<usize>,
    manikins: Vec<Option<Manikin>>,
    producers: Vec<Option<UnitId>>,
    units: Vec<ExecUnit>,
    init_units: Vec<ExecUnit>,
    allocs: Vec<MemAlloc>,
    /// Units that touched each storage so far; writers consult this for
    /// write-after-read ordering and rerun fences.
    readers: HashMap<ManikinStorage, Vec<UnitId>>,
}

fn ctype(dtype: &TypeName) -> Result<&'static str, PlanError> {
    dtype
        .cuda_type()
        .ok_or_else(|| PlanError::Unsupported(format!("dtype '{dtype}' has no device type")))
}

fn geometry(manikin: &Manikin) -> String {
    let dims = manikin
        .dims
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let strides = manikin
        .strides
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "TensorGeom<Dims<{dims}>, Strides<{strides}>, {}>",
        manikin.offset
    )
}

fn arg_types(args: &[KernelArg]) -> Result<Vec<String>, PlanError> {
    args.iter()
        .enumerate()
        .map(|(index, arg)| match arg {
            KernelArg::Buf(manikin) => {
                let c = ctype(&manikin.dtype)?;
                if index == 0 {
                    Ok(format!("{c} *"))
                } else {
                    Ok(format!("const {c} *"))
                }
            }
            KernelArg::Lit(lit) => ctype(&lit.type_name()).map(str::to_string),
            KernelArg::Size(_) => Ok("int64_t".to_string()),
        })
        .collect()
}

impl Planner<'_> {
    fn node(&self, id: UExprId) -> &UExprNode {
        self.graph.node(id)
    }

    fn dims_of(&self, id: UExprId) -> Result<Vec<u64>, PlanError> {
        Ok(self.node(id).shape.eval()?)
    }

    fn manikin_of(&self, id: UExprId) -> Result<&Manikin, PlanError> {
        self.manikins[id.index()].as_ref().ok_or_else(|| {
            PlanError::Unsupported(format!(
                "value of side-effect node {} is consumed",
                self.node(id).op.label()
            ))
        })
    }

    fn alloc(&mut self, dims: Vec<u64>, dtype: &TypeName) -> Result<Manikin, PlanError> {
        let elem_size = dtype.size_in_bytes().ok_or_else(|| {
            PlanError::Unsupported(format!("dtype '{dtype}' has no storage size"))
        })? as u64;
        let id = self.allocs.len();
        let bytes = dims.iter().product::<u64>() * elem_size;
        self.allocs.push(MemAlloc {
            id,
            bytes,
            dtype: dtype.clone(),
        });
        Ok(Manikin::contiguous(
            dims,
            dtype.clone(),
            ManikinStorage::Alloc(id),
        ))
    }

    /// Builds a kernel-launch op; the template is parameterized by dtype,
    /// functor-style extras and the layout of every buffer argument.
    fn launch(
        &self,
        func_name: &str,
        dtype: &TypeName,
        extras: Vec<String>,
        work: Vec<u64>,
        args: Vec<KernelArg>,
    ) -> Result<PrimOp, PlanError> {
        let mut tmpl_args = vec![ctype(dtype)?.to_string()];
        tmpl_args.extend(extras);
        for arg in &args {
            if let KernelArg::Buf(manikin) = arg {
                tmpl_args.push(geometry(manikin));
            }
        }
        Ok(PrimOp::LaunchKernel {
            inst: TemplateInstance {
                func_name: func_name.to_string(),
                domain: KernelDomain::Device,
                tmpl_args,
                ret_type: "void".to_string(),
                arg_types: arg_types(&args)?,
            },
            work,
            args,
        })
    }

    /// Builds a host-side templated call routed through a delegate.
    fn host_call(
        &self,
        func_name: &str,
        delegate: &str,
        dtype: &TypeName,
        args: Vec<KernelArg>,
    ) -> Result<PrimOp, PlanError> {
        let mut tmpl_args = vec![ctype(dtype)?.to_string()];
        for arg in &args {
            if let KernelArg::Buf(manikin) = arg {
                tmpl_args.push(geometry(manikin));
            }
        }
        Ok(PrimOp::CallCFunc {
            inst: TemplateInstance {
                func_name: func_name.to_string(),
                domain: KernelDomain::Host,
                tmpl_args,
                ret_type: "void".to_string(),
                arg_types: arg_types(&args)?,
            },
            delegate: delegate.to_string(),
            args,
        })
    }

    /// Appends an execution unit: dependencies are the producers of every
    /// read node plus, for each written storage, all units that previously
    /// touched it. The latter also become the unit's rerun fence.
    fn push_unit(
        &mut self,
        ops: Vec<PrimOp>,
        reads: &[UExprId],
        writes: &[ManikinStorage],
    ) -> UnitId {
        let id = self.units.len();
        let mut deps: BTreeSet<UnitId> = BTreeSet::new();
        for read in reads {
            if let Some(producer) = self.producers[read.index()] {
                deps.insert(producer);
            }
        }
        let mut rerun: BTreeSet<UnitId> = BTreeSet::new();
        for storage in writes {
            if let Some(touched) = self.readers.get(storage) {
                for &unit in touched {
                    deps.insert(unit);
                    rerun.insert(unit);
                }
            }
        }
        deps.remove(&id);
        rerun.remove(&id);
        for read in reads {
            if let Some(manikin) = &self.manikins[read.index()] {
                self.readers
                    .entry(manikin.storage.clone())
                    .or_default()
                    .push(id);
            }
        }
        for storage in writes {
            self.readers.entry(storage.clone()).or_default().push(id);
        }
        self.units.push(ExecUnit {
            id,
            ops,
            depends_on: deps.into_iter().collect(),
            rerun_after: rerun.into_iter().collect(),
        });
        id
    }

    fn push_init_unit(&mut self, ops: Vec<PrimOp>) {
        let id = self.init_units.len();
        self.init_units.push(ExecUnit {
            id,
            ops,
            depends_on: Vec::new(),
            rerun_after: Vec::new(),
        });
    }

    fn set_result(&mut self, id: UExprId, manikin: Manikin, producer: Option<UnitId>) {
        self.manikins[id.index()] = Some(manikin);
        self.producers[id.index()] = producer;
    }

    /// Finishes a compute unit for `id`: optional trace op, unit creation
    /// and result registration.
    fn finish_compute(
        &mut self,
        id: UExprId,
        mut ops: Vec<PrimOp>,
        reads: &[UExprId],
        dst: Manikin,
    ) -> Result<(), PlanError> {
        if self.env.debug_trace {
            ops.push(PrimOp::Trace {
                uexpr: self.node(id).op.label(),
                result: dst.clone(),
            });
        }
        let unit = self.push_unit(ops, reads, &[dst.storage.clone()]);
        self.set_result(id, dst, Some(unit));
        Ok(())
    }

    /// True when writing over `arg`'s storage cannot clobber any other
    /// consumer: the whole view chain from the allocation owner down to
    /// `arg` is single-use, the storage is recipe-owned and the layout is
    /// dense.
    fn in_place_ok(&self, arg: UExprId) -> bool {
        let manikin = match &self.manikins[arg.index()] {
            Some(manikin) => manikin,
            None => return false,
        };
        if !matches!(manikin.storage, ManikinStorage::Alloc(_)) || !manikin.is_contiguous() {
            return false;
        }
        // Buffers filled during init (host-variable uploads) are written
        // once; clobbering them would corrupt every later pass.
        if self.producers[arg.index()].is_none() {
            return false;
        }
        let mut cursor = arg;
        loop {
            if self.use_counts[cursor.index()] != 1 {
                return false;
            }
            let node = self.node(cursor);
            match node.op {
                UOp::Reshape
                | UOp::DoBroadcast
                | UOp::SwapDim(_, _)
                | UOp::Annotated(_) => cursor = node.args[0],
                UOp::Subtensor(ref spec)
                    if spec
                        .iter()
                        .all(|range| matches!(range, URange::SymStartSymEnd { .. })) =>
                {
                    cursor = node.args[0]
                }
                _ => return true,
            }
        }
    }

    /// Result manikin for an elementwise op: the operand's storage when an
    /// in-place update is safe, a fresh dense allocation otherwise.
    fn elementwise_dst(
        &mut self,
        dims: Vec<u64>,
        dtype: &TypeName,
        candidates: &[UExprId],
    ) -> Result<Manikin, PlanError> {
        for &candidate in candidates {
            if self.in_place_ok(candidate) {
                let manikin = self.manikin_of(candidate)?;
                if manikin.dims == dims {
                    return Ok(manikin.clone());
                }
            }
        }
        self.alloc(dims, dtype)
    }

    /// A gemm operand must look row- or column-major; anything else is
    /// compacted into a fresh buffer first.
    fn gemm_operand(
        &mut self,
        id: UExprId,
        prep_ops: &mut Vec<PrimOp>,
    ) -> Result<(Manikin, BlasOp), PlanError> {
        let manikin = self.manikin_of(id)?.clone();
        let (rows, cols) = (manikin.dims[0], manikin.dims[1]);
        if manikin.strides[1] == 1 && manikin.strides[0] >= cols {
            return Ok((manikin, BlasOp::NonTranspose));
        }
        if manikin.strides[0] == 1 && manikin.strides[1] >= rows {
            return Ok((manikin, BlasOp::Transpose));
        }
        let dense = self.alloc(manikin.dims.clone(), &manikin.dtype)?;
        let manikin_dtype = manikin.dtype.clone();
        prep_ops.push(self.launch(
            "copy",
            &manikin_dtype,
            vec![manikin.rank().to_string()],
            manikin.dims.clone(),
            vec![KernelArg::Buf(dense.clone()), KernelArg::Buf(manikin)],
        )?);
        Ok((dense, BlasOp::NonTranspose))
    }

    fn plan_node(&mut self, id: UExprId) -> Result<(), PlanError> {
        let node = self.node(id).clone();
        let dims = self.dims_of(id)?;
        let dtype = node.dtype.clone();
        match &node.op {
            UOp::Var(spec) => match self.env.placement_of(spec)? {
                VarPlacement::Dev => {
                    let manikin = Manikin::contiguous(
                        spec.shape.eval().map_err(PlanError::from)?,
                        dtype,
                        ManikinStorage::External(spec.clone()),
                    );
                    self.set_result(id, manikin, None);
                }
                VarPlacement::Host => {
                    // Host-resident inputs are uploaded once during init.
                    let dst = self.alloc(dims, &dtype)?;
                    self.push_init_unit(vec![PrimOp::MemcpyHtoD {
                        src: spec.clone(),
                        dst: dst.clone(),
                    }]);
                    self.set_result(id, dst, None);
                }
            },
            UOp::Zeros => {
                let dst = self.alloc(dims, &dtype)?;
                let ops = vec![PrimOp::Memset {
                    value: 0,
                    dst: dst.clone(),
                }];
                self.finish_compute(id, ops, &[], dst)?;
            }
            UOp::Identity => {
                let n = dims[0];
                let dst = self.alloc(dims, &dtype)?;
                let diag = self.launch(
                    "identity_diag",
                    &dtype,
                    Vec::new(),
                    vec![n],
                    vec![KernelArg::Buf(dst.clone()), KernelArg::Size(n)],
                )?;
                let ops = vec![
                    PrimOp::Memset {
                        value: 0,
                        dst: dst.clone(),
                    },
                    diag,
                ];
                self.finish_compute(id, ops, &[], dst)?;
            }
            UOp::ScalarConst(lit) => {
                let dst = self.alloc(dims, &dtype)?;
                let fill = self.launch(
                    "const_fill",
                    &dtype,
                    Vec::new(),
                    vec![1],
                    vec![KernelArg::Buf(dst.clone()), KernelArg::Lit(*lit)],
                )?;
                self.finish_compute(id, vec![fill], &[], dst)?;
            }
            UOp::SizeValue(size) => {
                let value = size.eval().map_err(PlanError::from)?;
                let dst = self.alloc(dims, &dtype)?;
                let fill = self.launch(
                    "const_fill",
                    &dtype,
                    Vec::new(),
                    vec![1],
                    vec![
                        KernelArg::Buf(dst.clone()),
                        KernelArg::Lit(ConstLit::I64(value as i64)),
                    ],
                )?;
                self.finish_compute(id, vec![fill], &[], dst)?;
            }
            UOp::MapUnary(map) => {
                let src = self.manikin_of(node.args[0])?.clone();
                let dst = self.elementwise_dst(dims.clone(), &dtype, &[node.args[0]])?;
                let launch = self.launch(
                    "map_unary",
                    &dtype,
                    vec![map.functor().to_string(), dims.len().to_string()],
                    dims,
                    vec![KernelArg::Buf(dst.clone()), KernelArg::Buf(src)],
                )?;
                self.finish_compute(id, vec![launch], &node.args.to_vec(), dst)?;
            }
            UOp::MapBinary(map) => {
                let lhs = self.manikin_of(node.args[0])?.clone();
                let rhs = self.manikin_of(node.args[1])?.clone();
                let dst =
                    self.elementwise_dst(dims.clone(), &dtype, &[node.args[0], node.args[1]])?;
                let launch = self.launch(
                    "map_binary",
                    &dtype,
                    vec![map.functor().to_string(), dims.len().to_string()],
                    dims,
                    vec![
                        KernelArg::Buf(dst.clone()),
                        KernelArg::Buf(lhs),
                        KernelArg::Buf(rhs),
                    ],
                )?;
                self.finish_compute(id, vec![launch], &node.args.to_vec(), dst)?;
            }
            UOp::Sum => {
                let src = self.manikin_of(node.args[0])?.clone();
                let n = src.num_elems();
                let dst = self.alloc(dims, &dtype)?;
                let call = self.host_call(
                    "sum",
                    "SumDelegate",
                    &dtype,
                    vec![
                        KernelArg::Buf(dst.clone()),
                        KernelArg::Buf(src),
                        KernelArg::Size(n),
                    ],
                )?;
                self.finish_compute(id, vec![call], &node.args.to_vec(), dst)?;
            }
            UOp::SumAxis(axis) => {
                let src = self.manikin_of(node.args[0])?.clone();
                let dst = self.alloc(dims, &dtype)?;
                let call = self.host_call(
                    "sum_axis",
                    "SumAxisDelegate",
                    &dtype,
                    vec![
                        KernelArg::Buf(dst.clone()),
                        KernelArg::Buf(src),
                        KernelArg::Size(*axis as u64),
                    ],
                )?;
                self.finish_compute(id, vec![call], &node.args.to_vec(), dst)?;
            }
            UOp::Reshape => {
                let src = self.manikin_of(node.args[0])?.clone();
                let producer = self.producers[node.args[0].index()];
                match src.reshaped(dims.clone()) {
                    Some(view) => self.set_result(id, view, producer),
                    None => {
                        // Compacting copy, then a free view over it.
                        let dense = self.alloc(src.dims.clone(), &dtype)?;
                        let copy = self.launch(
                            "copy",
                            &dtype,
                            vec![src.rank().to_string()],
                            src.dims.clone(),
                            vec![KernelArg::Buf(dense.clone()), KernelArg::Buf(src)],
                        )?;
                        let view = dense.reshaped(dims).ok_or_else(|| {
                            PlanError::Unsupported("reshape of fresh dense buffer".into())
                        })?;
                        self.finish_compute(id, vec![copy], &node.args.to_vec(), dense)?;
                        let unit = self.producers[id.index()];
                        self.set_result(id, view, unit);
                    }
                }
            }
            UOp::DoBroadcast => {
                let src = self.manikin_of(node.args[0])?.clone();
                let producer = self.producers[node.args[0].index()];
                self.set_result(id, src.broadcast_to(&dims), producer);
            }
            UOp::SwapDim(a, b) => {
                let src = self.manikin_of(node.args[0])?.clone();
                let producer = self.producers[node.args[0].index()];
                self.set_result(id, src.swapped(*a, *b), producer);
            }
            UOp::Subtensor(spec) => self.plan_subtensor(id, &node, spec, dims, &dtype)?,
            UOp::SetSubtensor(spec) => self.plan_set_subtensor(id, &node, spec, dims, &dtype)?,
            UOp::StoreToVar(var) => {
                let src = self.manikin_of(node.args[0])?.clone();
                match self.env.placement_of(var)? {
                    VarPlacement::Dev => {
                        let dst = Manikin::contiguous(
                            var.shape.eval().map_err(PlanError::from)?,
                            var.dtype.clone(),
                            ManikinStorage::External(var.clone()),
                        );
                        let op = PrimOp::MemcpyDtoD {
                            src,
                            dst: dst.clone(),
                        };
                        let unit =
                            self.push_unit(vec![op], &node.args.to_vec(), &[dst.storage]);
                        self.producers[id.index()] = Some(unit);
                    }
                    VarPlacement::Host => {
                        let op = PrimOp::MemcpyDtoH {
                            src,
                            dst: var.clone(),
                        };
                        let unit = self.push_unit(
                            vec![op],
                            &node.args.to_vec(),
                            &[ManikinStorage::External(var.clone())],
                        );
                        self.producers[id.index()] = Some(unit);
                    }
                }
            }
            UOp::Annotated(_) => {
                let src = self.manikin_of(node.args[0])?.clone();
                let producer = self.producers[node.args[0].index()];
                self.set_result(id, src, producer);
            }
            UOp::Dot => self.plan_dot(id, &node, dims, &dtype)?,
            UOp::TensorProduct => {
                let lhs = self.manikin_of(node.args[0])?.clone();
                let rhs = self.manikin_of(node.args[1])?.clone();
                let dst = self.alloc(dims.clone(), &dtype)?;
                let launch = self.launch(
                    "tensor_product",
                    &dtype,
                    vec![dims.len().to_string()],
                    dims,
                    vec![
                        KernelArg::Buf(dst.clone()),
                        KernelArg::Buf(lhs),
                        KernelArg::Buf(rhs),
                    ],
                )?;
                self.finish_compute(id, vec![launch], &node.args.to_vec(), dst)?;
            }
            UOp::Discard => {
                // Pure grouping of side effects; nothing to compute.
                self.producers[id.index()] = None;
            }
            UOp::Extension { name: _, lowering } => {
                let mut args = vec![];
                for &arg in &node.args {
                    args.push(KernelArg::Buf(self.manikin_of(arg)?.clone()));
                }
                let dst = self.alloc(dims.clone(), &dtype)?;
                let mut all_args = vec![KernelArg::Buf(dst.clone())];
                all_args.extend(args);
                let op = match lowering {
                    ExtensionLowering::DeviceKernel { func_name } => self.launch(
                        func_name,
                        &dtype,
                        vec![dims.len().to_string()],
                        dims,
                        all_args,
                    )?,
                    ExtensionLowering::HostCall {
                        func_name,
                        delegate,
                    } => self.host_call(func_name, delegate, &dtype, all_args)?,
                };
                self.finish_compute(id, vec![op], &node.args.to_vec(), dst)?;
            }
        }
        Ok(())
    }

    /// Static subtensors are views; a dynamic start forces a gather kernel
    /// whose start indices arrive as runtime scalar buffers.
    fn plan_subtensor(
        &mut self,
        id: UExprId,
        node: &UExprNode,
        spec: &[URange],
        dims: Vec<u64>,
        dtype: &TypeName,
    ) -> Result<(), PlanError> {
        let src = self.manikin_of(node.args[0])?.clone();
        let all_static = spec
            .iter()
            .all(|range| matches!(range, URange::SymStartSymEnd { .. }));
        if all_static {
            let mut starts = Vec::with_capacity(spec.len());
            for range in spec {
                match range {
                    URange::SymStartSymEnd { start, .. } => {
                        starts.push(start.eval().map_err(PlanError::from)?)
                    }
                    URange::DynStartSymSize { .. } => unreachable!(),
                }
            }
            let lens: Vec<u64> = dims.iter().take(spec.len()).copied().collect();
            let view = src.sliced(&starts, &lens);
            let producer = self.producers[node.args[0].index()];
            self.set_result(id, view, producer);
            return Ok(());
        }

        let dst = self.alloc(dims.clone(), dtype)?;
        let mut args = vec![KernelArg::Buf(dst.clone()), KernelArg::Buf(src)];
        for range in spec {
            match range {
                URange::SymStartSymEnd { start, .. } => {
                    args.push(KernelArg::Size(start.eval().map_err(PlanError::from)?));
                }
                URange::DynStartSymSize { start_arg, .. } => {
                    let start_node = node.args[*start_arg];
                    args.push(KernelArg::Buf(self.manikin_of(start_node)?.clone()));
                }
            }
        }
        let launch = self.launch(
            "subtensor_copy",
            dtype,
            vec![dims.len().to_string()],
            dims,
            args,
        )?;
        self.finish_compute(id, vec![launch], &node.args.to_vec(), dst)
    }

    fn plan_set_subtensor(
        &mut self,
        id: UExprId,
        node: &UExprNode,
        spec: &[URange],
        dims: Vec<u64>,
        dtype: &TypeName,
    ) -> Result<(), PlanError> {
        let base_id = node.args[0];
        let src = self.manikin_of(node.args[1])?.clone();
        let mut ops = Vec::new();

        // Copy-on-write unless the base is provably exclusive.
        let dst = if self.in_place_ok(base_id) {
            self.manikin_of(base_id)?.clone()
        } else {
            let base = self.manikin_of(base_id)?.clone();
            let dst = self.alloc(dims.clone(), dtype)?;
            ops.push(PrimOp::MemcpyDtoD {
                src: base,
                dst: dst.clone(),
            });
            dst
        };

        let all_static = spec
            .iter()
            .all(|range| matches!(range, URange::SymStartSymEnd { .. }));
        if all_static {
            let mut starts = Vec::with_capacity(spec.len());
            for range in spec {
                match range {
                    URange::SymStartSymEnd { start, .. } => {
                        starts.push(start.eval().map_err(PlanError::from)?)
                    }
                    URange::DynStartSymSize { .. } => unreachable!(),
                }
            }
            let lens: Vec<u64> = src.dims.clone();
            let window = dst.sliced(&starts, &lens);
            ops.push(PrimOp::MemcpyDtoD { src, dst: window });
        } else {
            let mut args = vec![KernelArg::Buf(dst.clone()), KernelArg::Buf(src.clone())];
            for range in spec {
                match range {
                    URange::SymStartSymEnd { start, .. } => {
                        args.push(KernelArg::Size(start.eval().map_err(PlanError::from)?));
                    }
                    URange::DynStartSymSize { start_arg, .. } => {
                        let start_node = node.args[*start_arg];
                        args.push(KernelArg::Buf(self.manikin_of(start_node)?.clone()));
                    }
                }
            }
            ops.push(self.launch(
                "set_subtensor",
                dtype,
                vec![src.rank().to_string()],
                src.dims.clone(),
                args,
            )?);
        }
        self.finish_compute(id, ops, &node.args.to_vec(), dst)
    }

    fn plan_dot(
        &mut self,
        id: UExprId,
        node: &UExprNode,
        dims: Vec<u64>,
        dtype: &TypeName,
    ) -> Result<(), PlanError> {
        let lhs_rank = self.manikin_of(node.args[0])?.rank();
        let rhs_rank = self.manikin_of(node.args[1])?.rank();
        match (lhs_rank, rhs_rank) {
            (1, 1) => {
                // Inner product: elementwise multiply into a scratch buffer,
                // then a host-side reduction.
                let lhs = self.manikin_of(node.args[0])?.clone();
                let rhs = self.manikin_of(node.args[1])?.clone();
                let n = lhs.dims[0];
                let scratch = self.alloc(vec![n], dtype)?;
                let mul = self.launch(
                    "map_binary",
                    dtype,
                    vec!["OpMultiply".to_string(), "1".to_string()],
                    vec![n],
                    vec![
                        KernelArg::Buf(scratch.clone()),
                        KernelArg::Buf(lhs),
                        KernelArg::Buf(rhs),
                    ],
                )?;
                let dst = self.alloc(dims, dtype)?;
                let sum = self.host_call(
                    "sum",
                    "SumDelegate",
                    dtype,
                    vec![
                        KernelArg::Buf(dst.clone()),
                        KernelArg::Buf(scratch),
                        KernelArg::Size(n),
                    ],
                )?;
                self.finish_compute(id, vec![mul, sum], &node.args.to_vec(), dst)
            }
            (2, 1) => {
                let mut ops = Vec::new();
                let (a, op_a) = self.gemm_operand(node.args[0], &mut ops)?;
                let rhs = self.manikin_of(node.args[1])?.clone();
                let k = rhs.dims[0];
                let b = match rhs.reshaped(vec![k, 1]) {
                    Some(view) => view,
                    None => {
                        let dense = self.alloc(vec![k], dtype)?;
                        ops.push(self.launch(
                            "copy",
                            dtype,
                            vec!["1".to_string()],
                            vec![k],
                            vec![KernelArg::Buf(dense.clone()), KernelArg::Buf(rhs)],
                        )?);
                        dense.reshaped(vec![k, 1]).ok_or_else(|| {
                            PlanError::Unsupported("reshape of fresh dense buffer".into())
                        })?
                    }
                };
                let dst = self.alloc(dims.clone(), dtype)?;
                let c = dst.reshaped(vec![dims[0], 1]).ok_or_else(|| {
                    PlanError::Unsupported("reshape of fresh dense buffer".into())
                })?;
                ops.push(PrimOp::BlasGemm {
                    op_a,
                    op_b: BlasOp::NonTranspose,
                    alpha: 1.0,
                    a,
                    b,
                    beta: 0.0,
                    c,
                });
                self.finish_compute(id, ops, &node.args.to_vec(), dst)
            }
            (2, 2) => {
                let mut ops = Vec::new();
                let (a, op_a) = self.gemm_operand(node.args[0], &mut ops)?;
                let (b, op_b) = self.gemm_operand(node.args[1], &mut ops)?;
                let dst = self.alloc(dims, dtype)?;
                ops.push(PrimOp::BlasGemm {
                    op_a,
                    op_b,
                    alpha: 1.0,
                    a,
                    b,
                    beta: 0.0,
                    c: dst.clone(),
                });
                self.finish_compute(id, ops, &node.args.to_vec(), dst)
            }
            (l, r) => Err(PlanError::Unsupported(format!(
                "dot over operand ranks ({l}, {r})"
            ))),
        }
    }

    fn finish(self) -> ExecPlan {
        let manikins = self
            .manikins
            .into_iter()
            .enumerate()
            .filter_map(|(index, manikin)| {
                manikin.map(|manikin| (UExprId::from_index(index), manikin))
            })
            .collect();
        ExecPlan {
            units: self.units,
            init_units: self.init_units,
            allocs: self.allocs,
            manikins,
        }
    }
}
