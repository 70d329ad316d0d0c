//! The expression graph: an arena of immutable-shape nodes, structural
//! dedup of op applications, and the symbolic backward-graph builder.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::op::{check_arity, Op, ShapeDesc};
use crate::ops::arith::{ElemBinOp, Neg, Sum};
use crate::ops::tensor::{At, Concat, Repeat, Reshape, SizeOf, Slice, Transpose};
use crate::value::BinaryKind;
use crate::{bail, DType, DualValue, Error, Result, Shape, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A node's runtime binding: a plain forward value, or a dual once the node
/// has received gradient contributions.
#[derive(Debug, Clone)]
pub enum Bound {
    Plain(Value),
    Dual(DualValue),
}

impl Bound {
    pub fn value(&self) -> &Value {
        match self {
            Bound::Plain(v) => v,
            Bound::Dual(dv) => &dv.value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    name: String,
    dtype: DType,
    shape: Shape,
    op: Option<Arc<dyn Op>>,
    inputs: Vec<NodeId>,
    bound: Option<Bound>,
    /// Nodes whose gradient this node holds.
    deriv_of: Vec<NodeId>,
    /// The node holding this node's gradient.
    deriv: Option<NodeId>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn op(&self) -> Option<&Arc<dyn Op>> {
        self.op.as_ref()
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// True for nodes the machine loads rather than computes.
    pub fn is_leaf(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn value(&self) -> Option<&Value> {
        self.bound.as_ref().map(Bound::value)
    }

    pub fn grad(&self) -> Option<&Value> {
        match &self.bound {
            Some(Bound::Dual(dv)) => Some(&dv.d),
            _ => None,
        }
    }

    pub fn deriv(&self) -> Option<NodeId> {
        self.deriv
    }

    pub fn deriv_of(&self) -> &[NodeId] {
        &self.deriv_of
    }
}

/// The expression graph. Exclusively owns its nodes; applications of
/// structurally identical ops to the same inputs dedup to one node.
#[derive(Debug, Clone, Default)]
pub struct ExprGraph {
    nodes: Vec<Node>,
    dedup: FxHashMap<(u64, Vec<NodeId>), NodeId>,
}

impl ExprGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn shape_of(&self, id: NodeId) -> &Shape {
        &self.nodes[id.0].shape
    }

    pub fn dtype_of(&self, id: NodeId) -> DType {
        self.nodes[id.0].dtype
    }

    fn push(
        &mut self,
        name: String,
        dtype: DType,
        shape: Shape,
        op: Option<Arc<dyn Op>>,
        inputs: Vec<NodeId>,
        bound: Option<Bound>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            name,
            dtype,
            shape,
            op,
            inputs,
            bound,
            deriv_of: Vec::new(),
            deriv: None,
        });
        id
    }

    // -------- leaf constructors --------

    pub fn input(&mut self, name: impl Into<String>, dtype: DType, shape: impl Into<Shape>) -> NodeId {
        self.push(name.into(), dtype, shape.into(), None, Vec::new(), None)
    }

    pub fn scalar(&mut self, name: impl Into<String>, dtype: DType) -> NodeId {
        self.input(name, dtype, ())
    }

    pub fn vector(&mut self, name: impl Into<String>, dtype: DType, len: usize) -> NodeId {
        self.input(name, dtype, len)
    }

    pub fn matrix(&mut self, name: impl Into<String>, dtype: DType, rows: usize, cols: usize) -> NodeId {
        self.input(name, dtype, (rows, cols))
    }

    pub fn tensor(&mut self, name: impl Into<String>, dtype: DType, shape: impl Into<Shape>) -> NodeId {
        self.input(name, dtype, shape)
    }

    /// A leaf with a fixed value.
    pub fn constant(&mut self, name: impl Into<String>, value: Value) -> NodeId {
        let dtype = value.dtype();
        let shape = value.shape();
        self.push(
            name.into(),
            dtype,
            shape,
            None,
            Vec::new(),
            Some(Bound::Plain(value)),
        )
    }

    /// An inputless size node carrying a known axis extent. These are what
    /// drive repeat counts; identical constants dedup to one node.
    pub fn size_const(&mut self, axis: usize, val: usize) -> NodeId {
        let op: Arc<dyn Op> = Arc::new(SizeOf::new(axis, Some(val)));
        let key = (op.hashcode(), Vec::new());
        if let Some(&id) = self.dedup.get(&key) {
            return id;
        }
        let id = self.push(
            format!("{val}"),
            DType::I64,
            Shape::scalar(),
            Some(op),
            Vec::new(),
            Some(Bound::Plain(Value::I64(val as i64))),
        );
        self.dedup.insert(key, id);
        id
    }

    // -------- op application --------

    pub fn apply(&mut self, op: Arc<dyn Op>, inputs: &[NodeId]) -> Result<NodeId> {
        check_arity(op.as_ref(), inputs.len())?;
        let key = (op.hashcode(), inputs.to_vec());
        if let Some(&id) = self.dedup.get(&key) {
            return Ok(id);
        }
        let descs: Vec<ShapeDesc> = inputs
            .iter()
            .map(|&i| {
                let n = &self.nodes[i.0];
                match &n.op {
                    Some(op) if op.is_dim_sizer() => ShapeDesc::Sizer(op.clone()),
                    _ => ShapeDesc::Shaped(n.shape.clone()),
                }
            })
            .collect();
        let shape = op.infer_shape(&descs)?;
        let dtype = self.nodes[inputs[0].0].dtype;
        let name = op.to_string();
        let id = self.push(name, dtype, shape, Some(op), inputs.to_vec(), None);
        self.dedup.insert(key, id);
        Ok(id)
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Arc::new(ElemBinOp::new(BinaryKind::Add)), &[a, b])
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Arc::new(ElemBinOp::new(BinaryKind::Sub)), &[a, b])
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Arc::new(ElemBinOp::new(BinaryKind::Mul)), &[a, b])
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Arc::new(ElemBinOp::new(BinaryKind::Div)), &[a, b])
    }

    pub fn neg(&mut self, x: NodeId) -> Result<NodeId> {
        self.apply(Arc::new(Neg), &[x])
    }

    pub fn sum(&mut self, x: NodeId, axes: &[usize]) -> Result<NodeId> {
        let input_shape = self.shape_of(x).clone();
        self.apply(Arc::new(Sum::new(axes, input_shape)), &[x])
    }

    /// Full reduction to a scalar.
    pub fn sum_all(&mut self, x: NodeId) -> Result<NodeId> {
        self.sum(x, &[])
    }

    pub fn transpose(&mut self, x: NodeId, pattern: &[usize]) -> Result<NodeId> {
        self.apply(Arc::new(Transpose::new(pattern)), &[x])
    }

    pub fn reshape(&mut self, x: NodeId, to: impl Into<Shape>) -> Result<NodeId> {
        let to = to.into();
        let from = self.shape_of(x).clone();
        if from == to {
            return Ok(x);
        }
        self.apply(Arc::new(Reshape::new(from, to)), &[x])
    }

    pub fn concat(&mut self, axis: usize, inputs: &[NodeId]) -> Result<NodeId> {
        self.apply(Arc::new(Concat::new(axis)), inputs)
    }

    pub fn slice(&mut self, x: NodeId, along: usize, start: usize, end: usize) -> Result<NodeId> {
        self.slice_step(x, along, start, end, 1)
    }

    pub fn slice_step(
        &mut self,
        x: NodeId,
        along: usize,
        start: usize,
        end: usize,
        step: usize,
    ) -> Result<NodeId> {
        self.apply(Arc::new(Slice::new(along, start, end, step)), &[x])
    }

    /// Repeat by a fixed count.
    pub fn repeat(&mut self, x: NodeId, along: usize, n: usize) -> Result<NodeId> {
        let count = self.size_const(along, n);
        self.repeat_by(x, along, count)
    }

    /// Repeat by the count another node carries (a size node).
    pub fn repeat_by(&mut self, x: NodeId, along: usize, count: NodeId) -> Result<NodeId> {
        self.apply(Arc::new(Repeat::new(along)), &[x, count])
    }

    /// The runtime size of `of`'s axis, as a node.
    pub fn size_of(&mut self, axis: usize, of: NodeId) -> Result<NodeId> {
        let val = self.shape_of(of).dim(axis)?;
        self.apply(Arc::new(SizeOf::new(axis, Some(val))), &[of])
    }

    pub fn at(&mut self, x: NodeId, coordinates: &[usize]) -> Result<NodeId> {
        self.apply(Arc::new(At::new(coordinates)), &[x])
    }

    // -------- bindings --------

    /// Bind an input value ("let"). Shape and dtype must match the node.
    pub fn bind(&mut self, id: NodeId, value: Value) -> Result<()> {
        let node = &mut self.nodes[id.0];
        if value.shape() != node.shape {
            return Err(Error::ShapeMismatch {
                expected: node.shape.clone(),
                got: value.shape(),
            });
        }
        if value.dtype() != node.dtype {
            return Err(Error::DTypeMismatch {
                expected: node.dtype,
                got: value.dtype(),
            });
        }
        node.bound = Some(Bound::Plain(value));
        Ok(())
    }

    /// Bind a computed forward value, preserving an existing dual's gradient.
    pub fn bind_result(&mut self, id: NodeId, value: Value) {
        let node = &mut self.nodes[id.0];
        match &mut node.bound {
            Some(Bound::Dual(dv)) => dv.value = value,
            other => *other = Some(Bound::Plain(value)),
        }
    }

    pub fn value(&self, id: NodeId) -> Option<&Value> {
        self.nodes[id.0].value()
    }

    pub fn grad(&self, id: NodeId) -> Result<&Value> {
        let node = &self.nodes[id.0];
        node.grad().ok_or_else(|| Error::NoGradient {
            node: id.0,
            name: node.name.clone(),
        })
    }

    /// Add a gradient contribution to a node's dual, creating the dual from
    /// the bound forward value on first contribution.
    pub fn accumulate_dual(&mut self, id: NodeId, contribution: &Value) -> Result<()> {
        let node = &mut self.nodes[id.0];
        match &mut node.bound {
            Some(Bound::Dual(dv)) => dv.accumulate(contribution),
            Some(Bound::Plain(v)) => {
                let mut dv = DualValue::unit(v.clone());
                dv.accumulate(contribution)?;
                node.bound = Some(Bound::Dual(dv));
                Ok(())
            }
            None => Err(Error::UnboundInput {
                node: id.0,
                name: node.name.clone(),
            }),
        }
    }

    pub fn dual_mut(&mut self, id: NodeId) -> Result<&mut DualValue> {
        let node = &mut self.nodes[id.0];
        match &mut node.bound {
            Some(Bound::Dual(dv)) => Ok(dv),
            _ => Err(Error::NoGradient {
                node: id.0,
                name: node.name.clone(),
            }),
        }
    }

    /// Strip duals back to plain values, keeping the forward value.
    pub fn unbind_duals(&mut self) {
        for node in &mut self.nodes {
            if let Some(Bound::Dual(dv)) = &mut node.bound {
                let value = std::mem::replace(&mut dv.value, Value::I64(0));
                node.bound = Some(Bound::Plain(value));
            }
        }
    }

    /// Whether any node is a recorded gradient source.
    pub fn has_gradient_sources(&self) -> bool {
        self.nodes.iter().any(|n| !n.deriv_of.is_empty())
    }

    // -------- ordering and gradients --------

    fn dfs(&self, id: NodeId, visited: &mut [bool], out: &mut Vec<NodeId>) {
        if visited[id.0] {
            return;
        }
        visited[id.0] = true;
        for &inp in &self.nodes[id.0].inputs {
            self.dfs(inp, visited, out);
        }
        out.push(id);
    }

    /// Deterministic topological order over the whole graph: DFS post-order,
    /// roots visited in id order.
    pub fn topo_order(&self) -> Vec<NodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut out = Vec::with_capacity(self.nodes.len());
        for i in 0..self.nodes.len() {
            self.dfs(NodeId(i), &mut visited, &mut out);
        }
        out
    }

    fn topo_from(&self, root: NodeId) -> Vec<NodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut out = Vec::new();
        self.dfs(root, &mut visited, &mut out);
        out
    }

    /// Build the static backward graph of a scalar `cost` and return the
    /// gradient nodes for `wrt`, in order.
    ///
    /// Seeds a ones constant, walks the cost's subgraph in reverse
    /// topological order calling each op's `sym_diff`, and accumulates
    /// multiple contributions to the same node with explicit add nodes.
    /// Every (node, gradient-node) pair is recorded through `deriv` and
    /// `deriv_of` so the machine can accumulate duals during the forward
    /// pass.
    pub fn backprop(&mut self, cost: NodeId, wrt: &[NodeId]) -> Result<Vec<NodeId>> {
        let cost_shape = self.shape_of(cost);
        if !cost_shape.is_scalar() {
            bail!(
                "gradient requires a scalar cost, got {} of shape {}",
                self.node(cost).name,
                cost_shape
            );
        }
        let order = self.topo_from(cost);
        let seed_name = format!("d{}", self.node(cost).name);
        let seed = self.constant(seed_name, Value::one(self.dtype_of(cost)));

        let mut grads: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        grads.insert(cost, seed);

        for &nid in order.iter().rev() {
            let Some(&gnode) = grads.get(&nid) else {
                continue;
            };
            let node = &self.nodes[nid.0];
            let Some(op) = node.op.clone() else { continue };
            let inputs = node.inputs.clone();
            if inputs.is_empty() {
                continue;
            }
            let wrt_mask = op.diff_wrt(inputs.len());
            if !wrt_mask.iter().any(|&b| b) {
                continue;
            }
            let partials = op.sym_diff(self, &inputs, nid, gnode)?;
            for ((&inp, partial), differentiable) in
                inputs.iter().zip(partials).zip(wrt_mask)
            {
                if !differentiable {
                    continue;
                }
                let Some(partial) = partial else { continue };
                match grads.get(&inp).copied() {
                    Some(existing) => {
                        let accumulated = self.add(existing, partial)?;
                        grads.insert(inp, accumulated);
                    }
                    None => {
                        grads.insert(inp, partial);
                    }
                }
            }
        }

        let mut pairs: Vec<(NodeId, NodeId)> = grads.iter().map(|(&n, &g)| (n, g)).collect();
        pairs.sort_unstable();
        for &(n, gn) in &pairs {
            self.nodes[n.0].deriv = Some(gn);
            self.nodes[gn.0].deriv_of.push(n);
        }

        wrt.iter()
            .map(|&w| {
                grads.get(&w).copied().ok_or_else(|| {
                    Error::msg(format!(
                        "no gradient path from {} to {}",
                        self.node(cost).name,
                        self.node(w).name
                    ))
                })
            })
            .collect()
    }
}
