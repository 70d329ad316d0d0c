//! The polymorphic operation contract every graph node's op implements.

use std::hash::Hasher;
use std::sync::Arc;

use crate::graph::{ExprGraph, NodeId};
use crate::{Error, Result, Shape, Value};

/// Shape information about one input, as seen at shape-inference time.
///
/// Most inputs carry a concrete shape. An input that is itself an axis-size
/// node (the repeat count driven by the size of another operand) carries its
/// op instead, so the consumer can ask it for the axis extent it knows.
#[derive(Clone)]
pub enum ShapeDesc {
    Shaped(Shape),
    Sizer(Arc<dyn Op>),
}

impl ShapeDesc {
    pub fn shape(&self) -> Result<&Shape> {
        match self {
            ShapeDesc::Shaped(s) => Ok(s),
            ShapeDesc::Sizer(op) => Err(Error::msg(format!(
                "expected a shaped input, got the size node {op}"
            ))),
        }
    }

    /// The extent this input stands for along `axis`.
    pub fn dim_size(&self, axis: usize) -> Result<usize> {
        match self {
            ShapeDesc::Shaped(s) => s.dim(axis),
            ShapeDesc::Sizer(op) => op.dim_size_hint(axis).ok_or_else(|| {
                Error::msg(format!("size node {op} does not know the extent of axis {axis}"))
            }),
        }
    }
}

impl std::fmt::Debug for ShapeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShapeDesc::Shaped(s) => write!(f, "{s}"),
            ShapeDesc::Sizer(op) => write!(f, "sizer({op})"),
        }
    }
}

/// A node's operation.
///
/// The required methods define the functional core: arity, shape inference,
/// allocating evaluation, and the symbolic gradient. The provided methods are
/// opt-in capabilities the compiler and machine exploit: buffer-reuse
/// evaluation (`supports_prealloc` / `forward_prealloc`), in-place evaluation
/// (`overwrites_input` / `forward_unsafe`), and compiler hints.
pub trait Op: std::fmt::Debug + std::fmt::Display + Send + Sync {
    /// Number of inputs, or `None` for variable arity.
    fn arity(&self) -> Option<usize>;

    /// Deterministic output shape from input shape descriptors.
    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape>;

    /// Allocating evaluation.
    fn forward(&self, inputs: &[&Value]) -> Result<Value>;

    /// Which inputs the op is differentiable with respect to.
    fn diff_wrt(&self, n_inputs: usize) -> Vec<bool>;

    /// Build gradient nodes for each input. `output` is this op's node,
    /// `output_grad` the node holding its gradient. Entries for inputs the op
    /// is not differentiable with respect to are `None`.
    fn sym_diff(
        &self,
        g: &mut ExprGraph,
        inputs: &[NodeId],
        output: NodeId,
        output_grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>>;

    /// The result is a pointer-like view rather than fresh storage.
    fn returns_ptr(&self) -> bool {
        false
    }

    /// The op hands work to an external kernel; the compiler responds by
    /// pre-marking the destination register for buffer reuse.
    fn calls_extern(&self) -> bool {
        false
    }

    /// The input index this op may overwrite in place, if any.
    fn overwrites_input(&self) -> Option<usize> {
        None
    }

    fn supports_prealloc(&self) -> bool {
        false
    }

    /// Evaluate into `prealloc`. Must fail with a structured error (not
    /// panic, not write garbage) when the buffer cannot structurally hold the
    /// result, so the machine can fall back to allocating evaluation.
    fn forward_prealloc(&self, prealloc: &mut Value, inputs: &[&Value]) -> Result<()> {
        let _ = (prealloc, inputs);
        Err(Error::Unsupported {
            op: self.to_string(),
            kind: "buffer-reuse evaluation",
        })
    }

    /// Evaluate in place, consuming the overwritten input's value. `rest`
    /// holds the remaining inputs in order, with the overwritten one removed.
    /// An op that declares `overwrites_input` must override this.
    fn forward_unsafe(&self, target: Value, rest: &[&Value]) -> Result<Value> {
        let _ = (target, rest);
        Err(Error::Unsupported {
            op: self.to_string(),
            kind: "in-place evaluation",
        })
    }

    /// For size nodes: the extent this op stands for along `axis`.
    fn dim_size_hint(&self, axis: usize) -> Option<usize> {
        let _ = axis;
        None
    }

    /// Whether this op can serve as a `ShapeDesc::Sizer`.
    fn is_dim_sizer(&self) -> bool {
        false
    }

    /// Feed the op's structural identity to a hasher. Two ops hashing equal
    /// are interchangeable given the same inputs; the graph dedups on this.
    fn write_hash(&self, state: &mut dyn Hasher);

    fn hashcode(&self) -> u64 {
        let mut h = rustc_hash::FxHasher::default();
        self.write_hash(&mut h);
        h.finish()
    }
}

pub fn check_arity(op: &dyn Op, n_inputs: usize) -> Result<()> {
    match op.arity() {
        Some(expected) if expected != n_inputs => Err(Error::ArityMismatch {
            op: op.to_string(),
            expected,
            got: n_inputs,
        }),
        None if n_inputs == 0 => Err(Error::ArityMismatch {
            op: op.to_string(),
            expected: 1,
            got: 0,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Identity;

    impl std::fmt::Display for Identity {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "identity")
        }
    }

    impl Op for Identity {
        fn arity(&self) -> Option<usize> {
            Some(1)
        }

        fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
            Ok(inputs[0].shape()?.clone())
        }

        fn forward(&self, inputs: &[&Value]) -> Result<Value> {
            Ok(inputs[0].clone())
        }

        fn diff_wrt(&self, n_inputs: usize) -> Vec<bool> {
            vec![false; n_inputs]
        }

        fn sym_diff(
            &self,
            _g: &mut ExprGraph,
            _inputs: &[NodeId],
            _output: NodeId,
            _output_grad: NodeId,
        ) -> Result<Vec<Option<NodeId>>> {
            Err(Error::NonDifferentiable {
                op: self.to_string(),
            })
        }

        fn write_hash(&self, state: &mut dyn Hasher) {
            state.write(b"identity");
        }
    }

    #[test]
    fn optional_evaluation_modes_default_to_unsupported() {
        let v = Value::F64(1.0);
        assert!(matches!(
            Identity.forward_unsafe(v.clone(), &[]),
            Err(Error::Unsupported { .. })
        ));
        let mut out = Value::F64(0.0);
        assert!(matches!(
            Identity.forward_prealloc(&mut out, &[&v]),
            Err(Error::Unsupported { .. })
        ));
        assert!(!Identity.supports_prealloc());
        assert!(Identity.overwrites_input().is_none());
    }
}
