//! Elementwise arithmetic and axis reduction.

use std::hash::Hasher;

use crate::graph::{ExprGraph, NodeId};
use crate::op::{Op, ShapeDesc};
use crate::value::BinaryKind;
use crate::{Error, Result, Shape, Value};

/// Elementwise `+ - * /`. Operands must have equal shapes, or one of them
/// must be a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElemBinOp {
    pub kind: BinaryKind,
}

impl ElemBinOp {
    pub fn new(kind: BinaryKind) -> Self {
        Self { kind }
    }
}

impl std::fmt::Display for ElemBinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind.symbol())
    }
}

/// A scalar operand of a dense result collects contributions from every
/// output element.
fn reduce_if_scalar(g: &mut ExprGraph, grad: NodeId, operand: NodeId) -> Result<NodeId> {
    if g.shape_of(operand).is_scalar() && !g.shape_of(grad).is_scalar() {
        g.sum_all(grad)
    } else {
        Ok(grad)
    }
}

impl Op for ElemBinOp {
    fn arity(&self) -> Option<usize> {
        Some(2)
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        let a = inputs[0].shape()?;
        let b = inputs[1].shape()?;
        if a == b {
            Ok(a.clone())
        } else if a.is_scalar() {
            Ok(b.clone())
        } else if b.is_scalar() {
            Ok(a.clone())
        } else {
            Err(Error::ShapeMismatch {
                expected: a.clone(),
                got: b.clone(),
            })
        }
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        Value::binary(self.kind, inputs[0], inputs[1])
    }

    fn diff_wrt(&self, _n_inputs: usize) -> Vec<bool> {
        vec![true, true]
    }

    fn sym_diff(
        &self,
        g: &mut ExprGraph,
        inputs: &[NodeId],
        output: NodeId,
        output_grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let (a, b) = (inputs[0], inputs[1]);
        let (da, db) = match self.kind {
            BinaryKind::Add => (output_grad, output_grad),
            BinaryKind::Sub => (output_grad, g.neg(output_grad)?),
            BinaryKind::Mul => (g.mul(output_grad, b)?, g.mul(output_grad, a)?),
            BinaryKind::Div => {
                let da = g.div(output_grad, b)?;
                let num = g.mul(output_grad, output)?;
                let quot = g.div(num, b)?;
                (da, g.neg(quot)?)
            }
        };
        let da = reduce_if_scalar(g, da, a)?;
        let db = reduce_if_scalar(g, db, b)?;
        Ok(vec![Some(da), Some(db)])
    }

    fn overwrites_input(&self) -> Option<usize> {
        Some(0)
    }

    fn supports_prealloc(&self) -> bool {
        true
    }

    fn forward_prealloc(&self, prealloc: &mut Value, inputs: &[&Value]) -> Result<()> {
        Value::binary_into(self.kind, inputs[0], inputs[1], prealloc)
    }

    fn forward_unsafe(&self, mut target: Value, rest: &[&Value]) -> Result<Value> {
        Value::binary_assign(self.kind, &mut target, rest[0])?;
        Ok(target)
    }

    fn write_hash(&self, state: &mut dyn Hasher) {
        state.write(b"ebo");
        state.write(self.kind.symbol().as_bytes());
    }
}

/// Elementwise negation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neg;

impl std::fmt::Display for Neg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "neg")
    }
}

impl Op for Neg {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        Ok(inputs[0].shape()?.clone())
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        inputs[0].neg()
    }

    fn diff_wrt(&self, _n_inputs: usize) -> Vec<bool> {
        vec![true]
    }

    fn sym_diff(
        &self,
        g: &mut ExprGraph,
        _inputs: &[NodeId],
        _output: NodeId,
        output_grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        Ok(vec![Some(g.neg(output_grad)?)])
    }

    fn overwrites_input(&self) -> Option<usize> {
        Some(0)
    }

    fn forward_unsafe(&self, mut target: Value, _rest: &[&Value]) -> Result<Value> {
        target.neg_assign();
        Ok(target)
    }

    fn write_hash(&self, state: &mut dyn Hasher) {
        state.write(b"neg");
    }
}

/// Sum over a set of axes, dropping them; reduces to a scalar when every
/// axis is summed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sum {
    pub along: Vec<usize>,
    input_shape: Shape,
}

impl Sum {
    /// An empty `along` means all axes.
    pub fn new(along: &[usize], input_shape: Shape) -> Self {
        let along = if along.is_empty() {
            (0..input_shape.rank()).collect()
        } else {
            along.to_vec()
        };
        Self { along, input_shape }
    }
}

impl std::fmt::Display for Sum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sum{:?}", self.along)
    }
}

impl Op for Sum {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        inputs[0].shape()?.reduced(&self.along)
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        match inputs[0] {
            Value::Dense(d) => d.sum_axes(&self.along),
            _ => Err(Error::Unsupported {
                op: self.to_string(),
                kind: "scalar input",
            }),
        }
    }

    fn diff_wrt(&self, _n_inputs: usize) -> Vec<bool> {
        vec![true]
    }

    // d(sum)/dx spreads the output gradient back over the summed axes:
    // reinsert each axis as extent 1, then repeat it to the input extent.
    fn sym_diff(
        &self,
        g: &mut ExprGraph,
        _inputs: &[NodeId],
        _output: NodeId,
        output_grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let mut axes = self.along.clone();
        axes.sort_unstable();
        let mut cur = output_grad;
        let mut cur_shape = g.shape_of(output_grad).clone();
        for &ax in &axes {
            let with_axis = cur_shape.inserted(ax)?;
            cur = g.reshape(cur, with_axis)?;
            cur = g.repeat(cur, ax, self.input_shape.dim(ax)?)?;
            cur_shape = g.shape_of(cur).clone();
        }
        Ok(vec![Some(cur)])
    }

    fn write_hash(&self, state: &mut dyn Hasher) {
        state.write(b"sum");
        state.write_usize(self.along.len());
        for &ax in &self.along {
            state.write_usize(ax);
        }
        for &d in self.input_shape.dims() {
            state.write_usize(d);
        }
    }
}
