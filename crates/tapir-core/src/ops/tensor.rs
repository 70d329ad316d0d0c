//! Structural tensor operations: index lookup, axis sizes, repeat, slicing,
//! transpose, concatenation, and reshape.

use std::hash::Hasher;
use std::sync::Arc;

use crate::graph::{ExprGraph, NodeId};
use crate::op::{Op, ShapeDesc};
use crate::{Dense, Error, Result, Shape, Value};

fn write_dims(state: &mut dyn Hasher, dims: &[usize]) {
    state.write_usize(dims.len());
    for &d in dims {
        state.write_usize(d);
    }
}

/// Scalar lookup at fixed coordinates. Not differentiable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct At {
    pub coordinates: Vec<usize>,
}

impl At {
    pub fn new(coordinates: &[usize]) -> Self {
        Self {
            coordinates: coordinates.to_vec(),
        }
    }
}

impl std::fmt::Display for At {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "At{:?}", self.coordinates)
    }
}

impl Op for At {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        let s = inputs[0].shape()?;
        if s.rank() != self.coordinates.len() {
            return Err(Error::RankMismatch {
                expected: self.coordinates.len(),
                got: s.rank(),
            });
        }
        for (d, &c) in self.coordinates.iter().enumerate() {
            if c >= s.dim(d)? {
                return Err(Error::DimOutOfRange {
                    dim: c,
                    shape: s.clone(),
                });
            }
        }
        Ok(Shape::scalar())
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        match inputs[0] {
            Value::Dense(d) => d.at(&self.coordinates),
            _ => Err(Error::Unsupported {
                op: self.to_string(),
                kind: "scalar input",
            }),
        }
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
        state.write(b"at");
        write_dims(state, &self.coordinates);
    }
}

/// The extent of one axis of the input, as a scalar of the input's dtype.
/// A scalar input reports 1 on every axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeOf {
    pub axis: usize,
    /// Known at graph-construction time when the operand's shape is fixed,
    /// letting this node serve shape inference as a `ShapeDesc::Sizer`.
    pub val: Option<usize>,
}

impl SizeOf {
    pub fn new(axis: usize, val: Option<usize>) -> Self {
        Self { axis, val }
    }
}

impl std::fmt::Display for SizeOf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SizeOf[{}]", self.axis)
    }
}

impl Op for SizeOf {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        let s = inputs[0].shape()?;
        if !s.is_scalar() {
            s.dim(self.axis)?;
        }
        Ok(Shape::scalar())
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        match inputs[0] {
            Value::Dense(d) => {
                let e = d.shape().dim(self.axis)?;
                Ok(match d.dtype() {
                    crate::DType::F32 => Value::F32(e as f32),
                    crate::DType::F64 => Value::F64(e as f64),
                    crate::DType::I64 => Value::I64(e as i64),
                })
            }
            scalar => Ok(Value::one(scalar.dtype())),
        }
    }

    fn diff_wrt(&self, _n_inputs: usize) -> Vec<bool> {
        vec![false]
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

    fn dim_size_hint(&self, axis: usize) -> Option<usize> {
        if axis == self.axis {
            self.val
        } else {
            None
        }
    }

    fn is_dim_sizer(&self) -> bool {
        self.val.is_some()
    }

    fn write_hash(&self, state: &mut dyn Hasher) {
        state.write(b"sizeof");
        state.write_usize(self.axis);
        match self.val {
            Some(v) => state.write_usize(v),
            None => state.write(b"?"),
        }
    }
}

/// Repeat the input along one axis. The second input carries the repeat
/// count; its extent must be known to shape inference via `dim_size_hint`.
///
/// Vectors repeated on axis 1 are treated as columns, and scalars become
/// 1-vectors first (trailing extent-1 axes are appended until the axis
/// exists).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repeat {
    pub along: usize,
}

impl Repeat {
    pub fn new(along: usize) -> Self {
        Self { along }
    }

    fn padded_dims(&self, s: &Shape) -> Vec<usize> {
        let mut dims = s.dims().to_vec();
        while dims.len() <= self.along {
            dims.push(1);
        }
        dims
    }
}

impl std::fmt::Display for Repeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Repeat[{}]", self.along)
    }
}

impl Op for Repeat {
    fn arity(&self) -> Option<usize> {
        Some(2)
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        let rep = inputs[1].dim_size(self.along)?;
        let mut dims = self.padded_dims(inputs[0].shape()?);
        dims[self.along] *= rep;
        Ok(Shape::from(dims))
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        let rep = inputs[1].to_usize()?;
        match inputs[0] {
            Value::Dense(d) => {
                if rep == 1 && self.along < d.rank() {
                    return Ok(Value::Dense(d.clone()));
                }
                Ok(Value::Dense(d.repeat(self.along, rep)?))
            }
            scalar => {
                let d = Dense::from_f64_slice(&[scalar.to_f64()?], [1], scalar.dtype())?;
                Ok(Value::Dense(d.repeat(self.along, rep)?))
            }
        }
    }

    fn diff_wrt(&self, _n_inputs: usize) -> Vec<bool> {
        vec![true, false]
    }

    // The gradient sum-reduces over the repeats. With input extent e > 1 the
    // output interleaves repeats per index, so the output gradient is first
    // reshaped to split the axis into (e, repeats) and summed over the
    // repeats axis; with extent 1 (or a padded axis) a plain axis sum plus a
    // reshape back to the input shape suffices.
    fn sym_diff(
        &self,
        g: &mut ExprGraph,
        inputs: &[NodeId],
        _output: NodeId,
        output_grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let xshape = g.shape_of(inputs[0]).clone();
        let gshape = g.shape_of(output_grad).clone();
        let along = self.along;
        let padded = along >= xshape.rank();
        let dx = if xshape.is_scalar() || padded || xshape.dims()[along] == 1 {
            let s = g.sum(output_grad, &[along])?;
            if xshape.is_scalar() {
                s
            } else {
                g.reshape(s, xshape)?
            }
        } else {
            let e = xshape.dims()[along];
            let rep = gshape.dim(along)? / e;
            let mut split = gshape.dims().to_vec();
            split[along] = e;
            split.insert(along + 1, rep);
            let r = g.reshape(output_grad, Shape::from(split))?;
            // dropping the repeats axis restores the input shape
            g.sum(r, &[along + 1])?
        };
        Ok(vec![Some(dx), None])
    }

    fn returns_ptr(&self) -> bool {
        true
    }

    fn calls_extern(&self) -> bool {
        true
    }

    fn supports_prealloc(&self) -> bool {
        true
    }

    fn forward_prealloc(&self, prealloc: &mut Value, inputs: &[&Value]) -> Result<()> {
        let rep = inputs[1].to_usize()?;
        match (inputs[0], prealloc) {
            (Value::Dense(d), Value::Dense(p)) => d.repeat_into(p, self.along, rep),
            (scalar, Value::Dense(p)) => {
                let mut dims = vec![1usize; self.along + 1];
                dims[self.along] = rep;
                let expected = Shape::from(dims);
                if p.shape() != &expected || p.dtype() != scalar.dtype() {
                    return Err(Error::ReuseMismatch {
                        buffer: p.shape().clone(),
                        result: expected,
                    });
                }
                p.fill(scalar.to_f64()?)
            }
            (input, prealloc) => {
                let mut dims = self.padded_dims(&input.shape());
                dims[self.along] *= rep;
                Err(Error::ReuseMismatch {
                    buffer: prealloc.shape(),
                    result: Shape::from(dims),
                })
            }
        }
    }

    fn write_hash(&self, state: &mut dyn Hasher) {
        state.write(b"repeat");
        state.write_usize(self.along);
    }
}

/// Strided slice along one axis. An axis reduced to a single index is
/// dropped from the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub along: usize,
    pub start: usize,
    pub end: usize,
    pub step: usize,
}

impl Slice {
    pub fn new(along: usize, start: usize, end: usize, step: usize) -> Self {
        Self {
            along,
            start,
            end,
            step,
        }
    }

    fn check(&self, s: &Shape) -> Result<usize> {
        let e = s.dim(self.along)?;
        if self.start >= self.end || self.end > e || self.step == 0 {
            return Err(Error::SliceOutOfBounds {
                along: self.along,
                start: self.start,
                end: self.end,
                step: self.step,
                shape: s.clone(),
            });
        }
        Ok((self.start..self.end).step_by(self.step).count())
    }
}

impl std::fmt::Display for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Slice[{}; {}:{}:{}]",
            self.along, self.start, self.end, self.step
        )
    }
}

impl Op for Slice {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        let s = inputs[0].shape()?;
        let span = self.check(s)?;
        let mut dims = s.dims().to_vec();
        if span == 1 {
            dims.remove(self.along);
        } else {
            dims[self.along] = span;
        }
        Ok(Shape::from(dims))
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        match inputs[0] {
            Value::Dense(d) => d.slice_axis(self.along, self.start, self.end, self.step),
            _ => Err(Error::Unsupported {
                op: self.to_string(),
                kind: "scalar input",
            }),
        }
    }

    fn diff_wrt(&self, _n_inputs: usize) -> Vec<bool> {
        vec![true]
    }

    fn sym_diff(
        &self,
        g: &mut ExprGraph,
        inputs: &[NodeId],
        _output: NodeId,
        output_grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let incr = g.apply(Arc::new(SliceIncr::new(*self)), &[inputs[0], output_grad])?;
        Ok(vec![Some(incr)])
    }

    fn returns_ptr(&self) -> bool {
        true
    }

    fn write_hash(&self, state: &mut dyn Hasher) {
        state.write(b"slice");
        state.write_usize(self.along);
        state.write_usize(self.start);
        state.write_usize(self.end);
        state.write_usize(self.step);
    }
}

/// The slice gradient: a zeroed buffer of the first input's shape with the
/// second input scatter-added into the sliced region. The first input
/// contributes only its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceIncr {
    pub slice: Slice,
}

impl SliceIncr {
    pub fn new(slice: Slice) -> Self {
        Self { slice }
    }

    fn scatter(&self, out: &mut Dense, incr: &Value) -> Result<()> {
        let s = self.slice;
        out.slice_add(s.along, s.start, s.end, s.step, incr)
    }
}

impl std::fmt::Display for SliceIncr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SliceIncr[{}]", self.slice)
    }
}

impl Op for SliceIncr {
    fn arity(&self) -> Option<usize> {
        Some(2)
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        let s = inputs[0].shape()?;
        self.slice.check(s)?;
        Ok(s.clone())
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        match inputs[0] {
            Value::Dense(t) => {
                let mut out = Dense::zeros(t.shape(), t.dtype());
                self.scatter(&mut out, inputs[1])?;
                Ok(Value::Dense(out))
            }
            _ => Err(Error::Unsupported {
                op: self.to_string(),
                kind: "scalar input",
            }),
        }
    }

    fn diff_wrt(&self, _n_inputs: usize) -> Vec<bool> {
        vec![false, true]
    }

    fn sym_diff(
        &self,
        g: &mut ExprGraph,
        _inputs: &[NodeId],
        _output: NodeId,
        output_grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let back = g.apply(Arc::new(self.slice), &[output_grad])?;
        Ok(vec![None, Some(back)])
    }

    fn overwrites_input(&self) -> Option<usize> {
        Some(0)
    }

    fn supports_prealloc(&self) -> bool {
        true
    }

    fn forward_prealloc(&self, prealloc: &mut Value, inputs: &[&Value]) -> Result<()> {
        let expected = inputs[0].shape();
        match prealloc {
            Value::Dense(p) if p.shape() == &expected && p.dtype() == inputs[0].dtype() => {
                // the buffer may hold a stale value from a previous register use
                p.fill(0.0)?;
                self.scatter(p, inputs[1])
            }
            other => Err(Error::ReuseMismatch {
                buffer: other.shape(),
                result: expected,
            }),
        }
    }

    fn forward_unsafe(&self, target: Value, rest: &[&Value]) -> Result<Value> {
        match target {
            Value::Dense(mut t) => {
                t.fill(0.0)?;
                self.scatter(&mut t, rest[0])?;
                Ok(Value::Dense(t))
            }
            _ => Err(Error::Unsupported {
                op: self.to_string(),
                kind: "scalar input",
            }),
        }
    }

    fn write_hash(&self, state: &mut dyn Hasher) {
        state.write(b"sliceIncr");
        self.slice.write_hash(state);
    }
}

/// Axis permutation: output axis `i` is input axis `pattern[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transpose {
    pub pattern: Vec<usize>,
}

impl Transpose {
    pub fn new(pattern: &[usize]) -> Self {
        Self {
            pattern: pattern.to_vec(),
        }
    }
}

impl std::fmt::Display for Transpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transpose{:?}", self.pattern)
    }
}

impl Op for Transpose {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        let s = inputs[0].shape()?;
        if s.is_scalar() {
            return Err(Error::Unsupported {
                op: self.to_string(),
                kind: "scalar input",
            });
        }
        s.permuted(&self.pattern)
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        match inputs[0] {
            Value::Dense(d) => Ok(Value::Dense(d.transposed(&self.pattern)?)),
            _ => Err(Error::Unsupported {
                op: self.to_string(),
                kind: "scalar input",
            }),
        }
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
        let mut inverse = vec![0usize; self.pattern.len()];
        for (i, &p) in self.pattern.iter().enumerate() {
            inverse[p] = i;
        }
        let back = g.apply(Arc::new(Transpose { pattern: inverse }), &[output_grad])?;
        Ok(vec![Some(back)])
    }

    fn returns_ptr(&self) -> bool {
        true
    }

    fn write_hash(&self, state: &mut dyn Hasher) {
        state.write(b"transpose");
        write_dims(state, &self.pattern);
    }
}

/// N-ary concatenation along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concat {
    pub axis: usize,
}

impl Concat {
    pub fn new(axis: usize) -> Self {
        Self { axis }
    }
}

impl std::fmt::Display for Concat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Concat[{}]", self.axis)
    }
}

impl Op for Concat {
    fn arity(&self) -> Option<usize> {
        None
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        let first = inputs[0].shape()?;
        let rest = inputs[1..]
            .iter()
            .map(|d| d.shape())
            .collect::<Result<Vec<_>>>()?;
        first.concat(self.axis, &rest)
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        let parts = inputs
            .iter()
            .map(|v| {
                v.as_dense().ok_or_else(|| Error::Unsupported {
                    op: self.to_string(),
                    kind: "scalar input",
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if parts.len() == 1 {
            return Ok(Value::Dense(parts[0].clone()));
        }
        Ok(Value::Dense(Dense::concat(self.axis, &parts)?))
    }

    fn diff_wrt(&self, n_inputs: usize) -> Vec<bool> {
        vec![true; n_inputs]
    }

    // Each input's gradient is its span of the output gradient. A span of
    // one collapses the slice's axis, so it is reshaped back to the input's
    // shape.
    fn sym_diff(
        &self,
        g: &mut ExprGraph,
        inputs: &[NodeId],
        _output: NodeId,
        output_grad: NodeId,
    ) -> Result<Vec<Option<NodeId>>> {
        let mut out = Vec::with_capacity(inputs.len());
        let mut start = 0usize;
        for &inp in inputs {
            let ishape = g.shape_of(inp).clone();
            let e = ishape.dim(self.axis)?;
            let sliced = g.apply(
                Arc::new(Slice::new(self.axis, start, start + e, 1)),
                &[output_grad],
            )?;
            let node = if e == 1 {
                g.reshape(sliced, ishape)?
            } else {
                sliced
            };
            out.push(Some(node));
            start += e;
        }
        Ok(out)
    }

    fn write_hash(&self, state: &mut dyn Hasher) {
        state.write(b"concat");
        state.write_usize(self.axis);
    }
}

/// Reshape between element-count-compatible shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reshape {
    pub from: Shape,
    pub to: Shape,
}

impl Reshape {
    pub fn new(from: Shape, to: Shape) -> Self {
        Self { from, to }
    }
}

impl std::fmt::Display for Reshape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reshape({}, {})", self.from, self.to)
    }
}

impl Op for Reshape {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn infer_shape(&self, inputs: &[ShapeDesc]) -> Result<Shape> {
        let s = inputs[0].shape()?;
        if s.elem_count() != self.to.elem_count() {
            return Err(Error::ElementCountMismatch {
                from_count: s.elem_count(),
                to_count: self.to.elem_count(),
                from: s.clone(),
                to: self.to.clone(),
            });
        }
        Ok(self.to.clone())
    }

    fn forward(&self, inputs: &[&Value]) -> Result<Value> {
        match inputs[0] {
            Value::Dense(d) => {
                if self.to.is_scalar() {
                    return d.at(&vec![0; d.rank()]);
                }
                Ok(Value::Dense(d.reshaped(self.to.clone())?))
            }
            scalar => {
                if self.to.elem_count() != 1 {
                    return Err(Error::ElementCountMismatch {
                        from_count: 1,
                        to_count: self.to.elem_count(),
                        from: Shape::scalar(),
                        to: self.to.clone(),
                    });
                }
                let d = Dense::from_f64_slice(&[scalar.to_f64()?], self.to.clone(), scalar.dtype())?;
                Ok(Value::Dense(d))
            }
        }
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
        let back = g.reshape(output_grad, self.from.clone())?;
        Ok(vec![Some(back)])
    }

    fn returns_ptr(&self) -> bool {
        true
    }

    fn overwrites_input(&self) -> Option<usize> {
        Some(0)
    }

    fn forward_unsafe(&self, target: Value, _rest: &[&Value]) -> Result<Value> {
        match target {
            Value::Dense(mut d) => {
                if self.to.is_scalar() {
                    return d.at(&vec![0; d.rank()]);
                }
                d.reshape_in_place(self.to.clone())?;
                Ok(Value::Dense(d))
            }
            scalar => self.forward(&[&scalar]),
        }
    }

    fn write_hash(&self, state: &mut dyn Hasher) {
        state.write(b"reshape");
        write_dims(state, self.from.dims());
        write_dims(state, self.to.dims());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    fn shaped(dims: impl Into<Shape>) -> ShapeDesc {
        ShapeDesc::Shaped(dims.into())
    }

    fn sizer(axis: usize, val: usize) -> ShapeDesc {
        ShapeDesc::Sizer(Arc::new(SizeOf::new(axis, Some(val))))
    }

    fn dense(data: &[f64], dims: impl Into<Shape>) -> Value {
        Value::Dense(Dense::from_f64_slice(data, dims, DType::F64).unwrap())
    }

    #[test]
    fn repeat_infer_shapes() {
        let cases: &[(Shape, usize, usize, Shape)] = &[
            (Shape::from((2, 2)), 0, 2, Shape::from((4, 2))),
            (Shape::from((2, 2)), 1, 2, Shape::from((2, 4))),
            (Shape::from(2usize), 0, 3, Shape::from(6usize)),
            (Shape::from(2usize), 1, 2, Shape::from((2, 2))),
            (Shape::scalar(), 0, 2, Shape::from(2usize)),
        ];
        for (input, along, n, want) in cases {
            let op = Repeat::new(*along);
            let got = op
                .infer_shape(&[shaped(input), sizer(*along, *n)])
                .unwrap();
            assert_eq!(&got, want, "repeat {input} along {along} x{n}");
        }
    }

    #[test]
    fn repeat_forward_values() {
        let op = Repeat::new(0);
        let t = dense(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let n = Value::I64(2);
        let r = op.forward(&[&t, &n]).unwrap();
        assert_eq!(r.shape(), Shape::from((4, 2)));
        assert_eq!(r.to_f64_vec(), vec![1.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 4.0]);
        // scalar input becomes a vector
        let s = Value::F64(7.0);
        let r = op.forward(&[&s, &n]).unwrap();
        assert_eq!(r.shape(), Shape::from(2usize));
        assert_eq!(r.to_f64_vec(), vec![7.0, 7.0]);
    }

    #[test]
    fn repeat_prealloc_checks_buffer() {
        let op = Repeat::new(1);
        let t = dense(&[1.0, 2.0], [2]);
        let n = Value::I64(2);
        let mut good = Value::Dense(Dense::zeros((2, 2), DType::F64));
        op.forward_prealloc(&mut good, &[&t, &n]).unwrap();
        assert_eq!(good.to_f64_vec(), vec![1.0, 1.0, 2.0, 2.0]);
        let mut bad = Value::Dense(Dense::zeros((2, 3), DType::F64));
        assert!(op.forward_prealloc(&mut bad, &[&t, &n]).is_err());
    }

    #[test]
    fn slice_infer_and_forward() {
        let op = Slice::new(1, 1, 3, 1);
        assert_eq!(
            op.infer_shape(&[shaped((2, 3))]).unwrap(),
            Shape::from((2, 2))
        );
        // span of one drops the axis
        let op1 = Slice::new(0, 0, 1, 1);
        assert_eq!(op1.infer_shape(&[shaped((2, 3))]).unwrap(), Shape::from(3usize));
        let t = dense(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        assert_eq!(op.forward(&[&t]).unwrap().to_f64_vec(), vec![2.0, 3.0, 5.0, 6.0]);
        assert!(Slice::new(1, 2, 5, 1).infer_shape(&[shaped((2, 3))]).is_err());
    }

    #[test]
    fn slice_incr_scatters_into_zeros() {
        let op = SliceIncr::new(Slice::new(0, 2, 4, 1));
        let t = dense(&[9.0, 9.0, 9.0, 9.0], [4]);
        let incr = dense(&[1.0, 2.0], [2]);
        let r = op.forward(&[&t, &incr]).unwrap();
        assert_eq!(r.to_f64_vec(), vec![0.0, 0.0, 1.0, 2.0]);
        // prealloc zeroes stale contents first
        let mut buf = dense(&[5.0, 5.0, 5.0, 5.0], [4]);
        op.forward_prealloc(&mut buf, &[&t, &incr]).unwrap();
        assert_eq!(buf.to_f64_vec(), vec![0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn transpose_forward() {
        let op = Transpose::new(&[1, 0]);
        let t = dense(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let r = op.forward(&[&t]).unwrap();
        assert_eq!(r.shape(), Shape::from((3, 2)));
        assert_eq!(r.to_f64_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(op.infer_shape(&[shaped(())]).is_err());
    }

    #[test]
    fn concat_infer_and_forward() {
        let op = Concat::new(0);
        assert_eq!(
            op.infer_shape(&[shaped((2, 3)), shaped((1, 3))]).unwrap(),
            Shape::from((3, 3))
        );
        assert!(op.infer_shape(&[shaped((2, 3)), shaped((1, 2))]).is_err());
        let a = dense(&[1.0, 2.0], [2]);
        let b = dense(&[3.0], [1]);
        let r = op.forward(&[&a, &b]).unwrap();
        assert_eq!(r.to_f64_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn reshape_checks_element_count() {
        let op = Reshape::new(Shape::from((2, 3)), Shape::from((3, 2)));
        assert!(op.infer_shape(&[shaped((2, 3))]).is_ok());
        let bad = Reshape::new(Shape::from((2, 3)), Shape::from((4, 2)));
        assert!(bad.infer_shape(&[shaped((2, 3))]).is_err());
        let t = dense(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let r = op.forward(&[&t]).unwrap();
        assert_eq!(r.shape(), Shape::from((3, 2)));
        assert_eq!(r.to_f64_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn at_and_size_of() {
        let t = dense(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let at = At::new(&[1, 2]);
        assert_eq!(at.forward(&[&t]).unwrap(), Value::F64(6.0));
        assert_eq!(at.infer_shape(&[shaped((2, 3))]).unwrap(), Shape::scalar());
        let sz = SizeOf::new(1, Some(3));
        assert_eq!(sz.forward(&[&t]).unwrap(), Value::F64(3.0));
        assert_eq!(sz.dim_size_hint(1), Some(3));
        assert_eq!(sz.dim_size_hint(0), None);
        assert!(SizeOf::new(5, None).forward(&[&t]).is_err());
    }
}
