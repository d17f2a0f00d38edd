//! Type-erased unified expressions.
//!
//! [`UExprGraph::lower`] translates a typed expression DAG one-to-one into a
//! flat arena of [`UExprNode`]s: the element dtype moves from the type
//! parameter into a runtime [`TypeName`] field, shared subtrees collapse to
//! a single node (hash-consing), and the dynamic-start index expressions
//! inside range specs become ordinary argument edges. Node ids are
//! topologically ordered by construction: every argument id is smaller than
//! the id of its user.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::dtype::{ConstLit, ElemType, TypeName};
use crate::expr::{
    BinaryOp, Expr, ExprKind, ExprNode, ExprRef, ExtensionLowering, MapBinaryOp, MapUnaryOp,
    NaryOp, SimpleRange, SimpleRangeSpec, UnaryOp,
};
use crate::size::{SizeExpr, SizeSymbol};
use crate::shape::Shape;
use crate::var::VarSpec;

/// Index of a node within a [`UExprGraph`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UExprId(u32);

impl UExprId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(index: usize) -> UExprId {
        UExprId(index as u32)
    }
}

impl fmt::Display for UExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// One axis of a unified range spec. Dynamic starts refer to an argument
/// slot of the owning node instead of embedding a subtree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum URange {
    SymStartSymEnd {
        start: SizeExpr,
        end: Option<SizeExpr>,
    },
    DynStartSymSize { start_arg: usize, size: SizeExpr },
}

pub type URangeSpec = Vec<URange>;

/// Opcode of a unified node; a one-to-one mirror of the typed op tags with
/// shape payloads folded into the node's own shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UOp {
    Identity,
    Zeros,
    ScalarConst(ConstLit),
    SizeValue(SizeExpr),
    Var(VarSpec),
    MapUnary(MapUnaryOp),
    Sum,
    SumAxis(usize),
    Reshape,
    DoBroadcast,
    SwapDim(usize, usize),
    Subtensor(URangeSpec),
    StoreToVar(VarSpec),
    Annotated(String),
    MapBinary(MapBinaryOp),
    Dot,
    TensorProduct,
    SetSubtensor(URangeSpec),
    Discard,
    Extension {
        name: String,
        lowering: ExtensionLowering,
    },
}

impl UOp {
    /// Short label used in trace output and error context.
    pub fn label(&self) -> String {
        match self {
            UOp::Identity => "identity".to_string(),
            UOp::Zeros => "zeros".to_string(),
            UOp::ScalarConst(lit) => format!("const({lit})"),
            UOp::SizeValue(size) => format!("size_value({size})"),
            UOp::Var(spec) => format!("var({})", spec.name),
            UOp::MapUnary(op) => op.functor().trim_start_matches("Op").to_lowercase(),
            UOp::Sum => "sum".to_string(),
            UOp::SumAxis(axis) => format!("sum_axis({axis})"),
            UOp::Reshape => "reshape".to_string(),
            UOp::DoBroadcast => "do_broadcast".to_string(),
            UOp::SwapDim(a, b) => format!("swap_dim({a}, {b})"),
            UOp::Subtensor(_) => "subtensor".to_string(),
            UOp::StoreToVar(spec) => format!("store({})", spec.name),
            UOp::Annotated(text) => format!("annotated({text})"),
            UOp::MapBinary(op) => op.functor().trim_start_matches("Op").to_lowercase(),
            UOp::Dot => "dot".to_string(),
            UOp::TensorProduct => "tensor_product".to_string(),
            UOp::SetSubtensor(_) => "set_subtensor".to_string(),
            UOp::Discard => "discard".to_string(),
            UOp::Extension { name, .. } => format!("extension({name})"),
        }
    }
}

/// A unified node: opcode, argument edges, runtime dtype and derived shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UExprNode {
    pub op: UOp,
    pub args: SmallVec<[UExprId; 2]>,
    pub dtype: TypeName,
    pub shape: Shape,
}

/// Flat, hash-consed arena of unified nodes with the root last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UExprGraph {
    nodes: Vec<UExprNode>,
}

impl UExprGraph {
    /// Translates a typed expression DAG. The translation is one-to-one on
    /// ops; structurally equal subtrees share a single unified node.
    pub fn lower<T: ElemType>(expr: &Expr<T>) -> UExprGraph {
        let mut graph = UExprGraph::default();
        let mut lowering = Lowering {
            graph: &mut graph,
            by_ptr: HashMap::new(),
            by_node: HashMap::new(),
        };
        lowering.lower_node(expr.node());
        graph
    }

    pub fn root(&self) -> UExprId {
        UExprId(self.nodes.len().saturating_sub(1) as u32)
    }

    pub fn node(&self, id: UExprId) -> &UExprNode {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = UExprId> {
        (0..self.nodes.len() as u32).map(UExprId)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (UExprId, &UExprNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (UExprId(index as u32), node))
    }

    /// Number of argument edges pointing at each node.
    pub fn use_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            for arg in &node.args {
                counts[arg.index()] += 1;
            }
        }
        counts
    }

    /// Symbols still unresolved anywhere in the graph, for error listings.
    pub fn unresolved_symbols(&self) -> BTreeSet<SizeSymbol> {
        let mut symbols = BTreeSet::new();
        for node in &self.nodes {
            symbols.extend(node.shape.symbols());
            match &node.op {
                UOp::Subtensor(spec) | UOp::SetSubtensor(spec) => {
                    for range in spec {
                        match range {
                            URange::SymStartSymEnd { start, end } => {
                                symbols.extend(start.symbols());
                                if let Some(end) = end {
                                    symbols.extend(end.symbols());
                                }
                            }
                            URange::DynStartSymSize { size, .. } => {
                                symbols.extend(size.symbols());
                            }
                        }
                    }
                }
                UOp::SizeValue(size) => symbols.extend(size.symbols()),
                _ => {}
            }
        }
        symbols
    }
}

struct Lowering<'g> {
    graph: &'g mut UExprGraph,
    by_ptr: HashMap<*const ExprNode, UExprId>,
    by_node: HashMap<UExprNode, UExprId>,
}

impl Lowering<'_> {
    fn intern(&mut self, node: UExprNode) -> UExprId {
        if let Some(found) = self.by_node.get(&node) {
            return *found;
        }
        let id = UExprId(self.graph.nodes.len() as u32);
        self.graph.nodes.push(node.clone());
        self.by_node.insert(node, id);
        id
    }

    fn lower_range_spec(
        &mut self,
        spec: &SimpleRangeSpec,
        args: &mut SmallVec<[UExprId; 2]>,
    ) -> URangeSpec {
        spec.iter()
            .map(|range| match range {
                SimpleRange::SymStartSymEnd { start, end } => URange::SymStartSymEnd {
                    start: start.clone(),
                    end: end.clone(),
                },
                SimpleRange::DynStartSymSize { start, size } => {
                    let start_id = self.lower_node(start);
                    args.push(start_id);
                    URange::DynStartSymSize {
                        start_arg: args.len() - 1,
                        size: size.clone(),
                    }
                }
            })
            .collect()
    }

    fn lower_node(&mut self, node: &ExprRef) -> UExprId {
        let ptr = ExprRef::as_ptr(node);
        if let Some(found) = self.by_ptr.get(&ptr) {
            return *found;
        }
        let mut args: SmallVec<[UExprId; 2]> = SmallVec::new();
        let op = match node.kind() {
            ExprKind::Identity { .. } => UOp::Identity,
            ExprKind::Zeros { .. } => UOp::Zeros,
            ExprKind::ScalarConst(lit) => UOp::ScalarConst(*lit),
            ExprKind::SizeValue(size) => UOp::SizeValue(size.clone()),
            ExprKind::Var(spec) => UOp::Var(spec.clone()),
            ExprKind::Unary { op, arg } => {
                args.push(self.lower_node(arg));
                match op {
                    UnaryOp::Map(map) => UOp::MapUnary(*map),
                    UnaryOp::Sum => UOp::Sum,
                    UnaryOp::SumAxis(axis) => UOp::SumAxis(*axis),
                    UnaryOp::Reshape(_) => UOp::Reshape,
                    UnaryOp::DoBroadcast(_) => UOp::DoBroadcast,
                    UnaryOp::SwapDim(a, b) => UOp::SwapDim(*a, *b),
                    UnaryOp::Subtensor(spec) => {
                        UOp::Subtensor(self.lower_range_spec(spec, &mut args))
                    }
                    UnaryOp::StoreToVar(spec) => UOp::StoreToVar(spec.clone()),
                    UnaryOp::Annotated(text) => UOp::Annotated(text.clone()),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                args.push(self.lower_node(lhs));
                args.push(self.lower_node(rhs));
                match op {
                    BinaryOp::Map(map) => UOp::MapBinary(*map),
                    BinaryOp::Dot => UOp::Dot,
                    BinaryOp::TensorProduct => UOp::TensorProduct,
                    BinaryOp::SetSubtensor(spec) => {
                        UOp::SetSubtensor(self.lower_range_spec(spec, &mut args))
                    }
                }
            }
            ExprKind::Nary { op, args: parts } => {
                for part in parts {
                    args.push(self.lower_node(part));
                }
                match op {
                    NaryOp::Discard => UOp::Discard,
                    NaryOp::Extension(ext) => UOp::Extension {
                        name: ext.name().to_string(),
                        lowering: ext.lowering(),
                    },
                }
            }
        };
        let unified = UExprNode {
            op,
            args,
            dtype: node.dtype().clone(),
            shape: node.shape().clone(),
        };
        let id = self.intern(unified);
        self.by_ptr.insert(ptr, id);
        id
    }
}
