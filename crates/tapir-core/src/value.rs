//! Runtime values: scalars and dense row-major tensors, plus the CPU kernels
//! the operations are built from.

use crate::{bail, DType, Error, Result, Shape, WithDType};
use rand::Rng;

/// Typed contiguous storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl Buffer {
    pub fn dtype(&self) -> DType {
        match self {
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
            Buffer::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(d) => d.len(),
            Buffer::F64(d) => d.len(),
            Buffer::I64(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Elementwise arithmetic selector shared by the value kernels and the
/// arithmetic ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryKind::Add => "+",
            BinaryKind::Sub => "-",
            BinaryKind::Mul => "*",
            BinaryKind::Div => "/",
        }
    }
}

fn apply_kind<T>(k: BinaryKind, a: T, b: T) -> T
where
    T: Copy
        + std::ops::Add<Output = T>
        + std::ops::Sub<Output = T>
        + std::ops::Mul<Output = T>
        + std::ops::Div<Output = T>,
{
    match k {
        BinaryKind::Add => a + b,
        BinaryKind::Sub => a - b,
        BinaryKind::Mul => a * b,
        BinaryKind::Div => a / b,
    }
}

macro_rules! same_dtype {
    (($a:expr, $b:expr), |$x:ident, $y:ident| $body:expr) => {
        match ($a, $b) {
            (Buffer::F32($x), Buffer::F32($y)) => Ok(Buffer::F32($body)),
            (Buffer::F64($x), Buffer::F64($y)) => Ok(Buffer::F64($body)),
            (Buffer::I64($x), Buffer::I64($y)) => Ok(Buffer::I64($body)),
            (a, b) => Err(Error::DTypeMismatch {
                expected: a.dtype(),
                got: b.dtype(),
            }),
        }
    };
}

macro_rules! same_dtype_unit {
    (($a:expr, $b:expr), |$x:ident, $y:ident| $body:expr) => {
        match ($a, $b) {
            (Buffer::F32($x), Buffer::F32($y)) => {
                $body;
                Ok(())
            }
            (Buffer::F64($x), Buffer::F64($y)) => {
                $body;
                Ok(())
            }
            (Buffer::I64($x), Buffer::I64($y)) => {
                $body;
                Ok(())
            }
            (a, b) => Err(Error::DTypeMismatch {
                expected: a.dtype(),
                got: b.dtype(),
            }),
        }
    };
}

macro_rules! map_buffer {
    ($buf:expr, |$d:ident| $body:expr) => {
        match $buf {
            Buffer::F32($d) => Buffer::F32($body),
            Buffer::F64($d) => Buffer::F64($body),
            Buffer::I64($d) => Buffer::I64($body),
        }
    };
}

impl Buffer {
    /// Integer division traps on a zero divisor; `self` is the divisor side.
    fn check_div(&self, k: BinaryKind) -> Result<()> {
        if k == BinaryKind::Div {
            if let Buffer::I64(d) = self {
                if d.contains(&0) {
                    return Err(Error::msg("integer division by zero"));
                }
            }
        }
        Ok(())
    }

    fn zip(&self, other: &Buffer, k: BinaryKind) -> Result<Buffer> {
        other.check_div(k)?;
        same_dtype!((self, other), |a, b| a
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| apply_kind(k, x, y))
            .collect())
    }

    fn zip_into(&self, other: &Buffer, out: &mut Buffer, k: BinaryKind) -> Result<()> {
        let zipped = self.zip(other, k)?;
        same_dtype_unit!((out, &zipped), |o, z| o.copy_from_slice(z))
    }

    fn zip_assign(&mut self, other: &Buffer, k: BinaryKind) -> Result<()> {
        other.check_div(k)?;
        same_dtype_unit!((self, other), |a, b| {
            for (x, &y) in a.iter_mut().zip(b.iter()) {
                *x = apply_kind(k, *x, y);
            }
        })
    }

    fn map_scalar(&self, s: f64, k: BinaryKind, scalar_on_left: bool) -> Result<Buffer> {
        fn go<T: WithDType>(d: &[T], s: f64, k: BinaryKind, left: bool) -> Result<Vec<T>>
        where
            T: std::ops::Add<Output = T>
                + std::ops::Sub<Output = T>
                + std::ops::Mul<Output = T>
                + std::ops::Div<Output = T>,
        {
            let s = T::from_f64(s)?;
            Ok(d.iter()
                .map(|&x| {
                    if left {
                        apply_kind(k, s, x)
                    } else {
                        apply_kind(k, x, s)
                    }
                })
                .collect())
        }
        if k == BinaryKind::Div {
            if scalar_on_left {
                // the buffer's elements are the divisors
                self.check_div(k)?;
            } else if matches!(self, Buffer::I64(_)) && s == 0.0 {
                return Err(Error::msg("integer division by zero"));
            }
        }
        Ok(match self {
            Buffer::F32(d) => Buffer::F32(go(d, s, k, scalar_on_left)?),
            Buffer::F64(d) => Buffer::F64(go(d, s, k, scalar_on_left)?),
            Buffer::I64(d) => Buffer::I64(go(d, s, k, scalar_on_left)?),
        })
    }

    fn neg(&self) -> Buffer {
        map_buffer!(self, |d| d.iter().map(|&x| -x).collect())
    }

    fn neg_assign(&mut self) {
        match self {
            Buffer::F32(d) => d.iter_mut().for_each(|x| *x = -*x),
            Buffer::F64(d) => d.iter_mut().for_each(|x| *x = -*x),
            Buffer::I64(d) => d.iter_mut().for_each(|x| *x = -*x),
        }
    }

    fn scaled_add_assign(&mut self, other: &Buffer, factor: f64) -> Result<()> {
        match (self, other) {
            (Buffer::F32(a), Buffer::F32(b)) => {
                for (x, &y) in a.iter_mut().zip(b.iter()) {
                    *x += y * factor as f32;
                }
                Ok(())
            }
            (Buffer::F64(a), Buffer::F64(b)) => {
                for (x, &y) in a.iter_mut().zip(b.iter()) {
                    *x += y * factor;
                }
                Ok(())
            }
            (Buffer::I64(_), Buffer::I64(_)) => {
                Err(Error::msg("scaled accumulation requires a float dtype"))
            }
            (a, b) => Err(Error::DTypeMismatch {
                expected: a.dtype(),
                got: b.dtype(),
            }),
        }
    }

    fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Buffer::F32(d) => d.iter().map(|&x| x as f64).collect(),
            Buffer::F64(d) => d.clone(),
            Buffer::I64(d) => d.iter().map(|&x| x as f64).collect(),
        }
    }
}

/// A dense row-major tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    shape: Shape,
    data: Buffer,
}

fn repeat_kernel<T: Copy>(data: &[T], dims: &[usize], along: usize, n: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(data.len() * n);
    repeat_kernel_into(data, dims, along, n, |blk| out.extend_from_slice(blk));
    out
}

fn repeat_kernel_into<T: Copy>(
    data: &[T],
    dims: &[usize],
    along: usize,
    n: usize,
    mut write: impl FnMut(&[T]),
) {
    let e = dims[along];
    let outer: usize = dims[..along].iter().product();
    let inner: usize = dims[along + 1..].iter().product();
    for o in 0..outer {
        for i in 0..e {
            let base = (o * e + i) * inner;
            for _ in 0..n {
                write(&data[base..base + inner]);
            }
        }
    }
}

fn slice_kernel<T: Copy>(
    data: &[T],
    dims: &[usize],
    along: usize,
    start: usize,
    end: usize,
    step: usize,
) -> Vec<T> {
    let e = dims[along];
    let outer: usize = dims[..along].iter().product();
    let inner: usize = dims[along + 1..].iter().product();
    let mut out = Vec::new();
    for o in 0..outer {
        for i in (start..end).step_by(step) {
            let base = (o * e + i) * inner;
            out.extend_from_slice(&data[base..base + inner]);
        }
    }
    out
}

fn slice_add_kernel<T>(
    data: &mut [T],
    dims: &[usize],
    along: usize,
    start: usize,
    end: usize,
    step: usize,
    incr: &[T],
) where
    T: Copy + std::ops::AddAssign,
{
    let e = dims[along];
    let outer: usize = dims[..along].iter().product();
    let inner: usize = dims[along + 1..].iter().product();
    let mut src = 0usize;
    for o in 0..outer {
        for i in (start..end).step_by(step) {
            let base = (o * e + i) * inner;
            for k in 0..inner {
                data[base + k] += incr[src];
                src += 1;
            }
        }
    }
}

fn slice_add_scalar_kernel<T>(
    data: &mut [T],
    dims: &[usize],
    along: usize,
    start: usize,
    end: usize,
    step: usize,
    incr: T,
) where
    T: Copy + std::ops::AddAssign,
{
    let e = dims[along];
    let outer: usize = dims[..along].iter().product();
    let inner: usize = dims[along + 1..].iter().product();
    for o in 0..outer {
        for i in (start..end).step_by(step) {
            let base = (o * e + i) * inner;
            for k in 0..inner {
                data[base + k] += incr;
            }
        }
    }
}

fn transpose_kernel<T: Copy>(data: &[T], dims: &[usize], perm: &[usize]) -> Vec<T> {
    let rank = dims.len();
    let mut in_strides = vec![1usize; rank];
    for d in (0..rank.saturating_sub(1)).rev() {
        in_strides[d] = in_strides[d + 1] * dims[d + 1];
    }
    let out_dims: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
    let step_strides: Vec<usize> = perm.iter().map(|&p| in_strides[p]).collect();
    let mut coord = vec![0usize; rank];
    let mut out = Vec::with_capacity(data.len());
    for _ in 0..data.len() {
        let src: usize = coord.iter().zip(&step_strides).map(|(&c, &s)| c * s).sum();
        out.push(data[src]);
        for d in (0..rank).rev() {
            coord[d] += 1;
            if coord[d] < out_dims[d] {
                break;
            }
            coord[d] = 0;
        }
    }
    out
}

fn concat_kernel<T: Copy>(parts: &[(&[T], usize)], outer: usize, inner: usize) -> Vec<T> {
    let total: usize = parts.iter().map(|(d, _)| d.len()).sum();
    let mut out = Vec::with_capacity(total);
    for o in 0..outer {
        for &(data, e) in parts {
            let blk = e * inner;
            out.extend_from_slice(&data[o * blk..(o + 1) * blk]);
        }
    }
    out
}

fn sum_axis_once<T>(data: &[T], dims: &[usize], ax: usize) -> Vec<T>
where
    T: WithDType + std::ops::AddAssign,
{
    let e = dims[ax];
    let outer: usize = dims[..ax].iter().product();
    let inner: usize = dims[ax + 1..].iter().product();
    let mut out = vec![T::zero(); outer * inner];
    for o in 0..outer {
        for i in 0..e {
            let base = (o * e + i) * inner;
            for k in 0..inner {
                out[o * inner + k] += data[base + k];
            }
        }
    }
    out
}

fn sum_axes_kernel<T>(data: &[T], dims: &[usize], axes_desc: &[usize]) -> Vec<T>
where
    T: WithDType + std::ops::AddAssign,
{
    let mut data = data.to_vec();
    let mut dims = dims.to_vec();
    for &ax in axes_desc {
        data = sum_axis_once(&data, &dims, ax);
        dims.remove(ax);
    }
    data
}

impl Dense {
    pub fn from_f64_slice(data: &[f64], shape: impl Into<Shape>, dtype: DType) -> Result<Dense> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            bail!(
                "expected {} elements for shape {shape}, got {}",
                shape.elem_count(),
                data.len()
            );
        }
        let data = match dtype {
            DType::F32 => Buffer::F32(data.iter().map(|&x| x as f32).collect()),
            DType::F64 => Buffer::F64(data.to_vec()),
            DType::I64 => Buffer::I64(data.iter().map(|&x| x as i64).collect()),
        };
        Ok(Dense { shape, data })
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Dense {
        let shape = shape.into();
        let n = shape.elem_count();
        let data = match dtype {
            DType::F32 => Buffer::F32(vec![0.0; n]),
            DType::F64 => Buffer::F64(vec![0.0; n]),
            DType::I64 => Buffer::I64(vec![0; n]),
        };
        Dense { shape, data }
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType) -> Dense {
        let shape = shape.into();
        let n = shape.elem_count();
        let data = match dtype {
            DType::F32 => Buffer::F32(vec![1.0; n]),
            DType::F64 => Buffer::F64(vec![1.0; n]),
            DType::I64 => Buffer::I64(vec![1; n]),
        };
        Dense { shape, data }
    }

    pub fn rand_uniform(shape: impl Into<Shape>, dtype: DType, lo: f64, hi: f64) -> Result<Dense> {
        let shape = shape.into();
        let n = shape.elem_count();
        let mut rng = rand::thread_rng();
        let data = match dtype {
            DType::F32 => Buffer::F32((0..n).map(|_| rng.gen_range(lo..hi) as f32).collect()),
            DType::F64 => Buffer::F64((0..n).map(|_| rng.gen_range(lo..hi)).collect()),
            DType::I64 => return Err(Error::msg("uniform init requires a float dtype")),
        };
        Ok(Dense { shape, data })
    }

    pub fn rand_normal(shape: impl Into<Shape>, dtype: DType, mean: f64, std: f64) -> Result<Dense> {
        let shape = shape.into();
        let n = shape.elem_count();
        let mut rng = rand::thread_rng();
        let mut sample = || {
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.gen_range(0.0..1.0);
            mean + std * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
        };
        let data = match dtype {
            DType::F32 => Buffer::F32((0..n).map(|_| sample() as f32).collect()),
            DType::F64 => Buffer::F64((0..n).map(|_| sample()).collect()),
            DType::I64 => return Err(Error::msg("normal init requires a float dtype")),
        };
        Ok(Dense { shape, data })
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data.to_f64_vec()
    }

    fn get(&self, i: usize) -> Value {
        match &self.data {
            Buffer::F32(d) => Value::F32(d[i]),
            Buffer::F64(d) => Value::F64(d[i]),
            Buffer::I64(d) => Value::I64(d[i]),
        }
    }

    /// The scalar element of a single-element buffer.
    fn into_scalar(self) -> Value {
        self.get(0)
    }

    pub fn at(&self, coords: &[usize]) -> Result<Value> {
        if coords.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: coords.len(),
            });
        }
        let strides = self.shape.strides();
        let mut flat = 0usize;
        for (d, (&c, &s)) in coords.iter().zip(&strides).enumerate() {
            if c >= self.dims()[d] {
                return Err(Error::DimOutOfRange {
                    dim: c,
                    shape: self.shape.clone(),
                });
            }
            flat += c * s;
        }
        Ok(self.get(flat))
    }

    pub fn fill(&mut self, v: f64) -> Result<()> {
        match &mut self.data {
            Buffer::F32(d) => d.fill(v as f32),
            Buffer::F64(d) => d.fill(v),
            Buffer::I64(d) => d.fill(i64::from_f64(v)?),
        }
        Ok(())
    }

    pub fn reshaped(&self, to: impl Into<Shape>) -> Result<Dense> {
        let mut out = self.clone();
        out.reshape_in_place(to.into())?;
        Ok(out)
    }

    pub fn reshape_in_place(&mut self, to: Shape) -> Result<()> {
        if to.elem_count() != self.shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                from_count: self.shape.elem_count(),
                to_count: to.elem_count(),
                from: self.shape.clone(),
                to,
            });
        }
        self.shape = to;
        Ok(())
    }

    /// Dims padded with trailing 1s so `along` is in range. This is how a
    /// vector repeated on axis 1 becomes a column, and a scalar a 1-vector.
    fn repeat_dims(&self, along: usize) -> Vec<usize> {
        let mut dims = self.dims().to_vec();
        while dims.len() <= along {
            dims.push(1);
        }
        dims
    }

    pub fn repeat(&self, along: usize, n: usize) -> Result<Dense> {
        let dims = self.repeat_dims(along);
        let data = map_buffer!(&self.data, |d| repeat_kernel(d, &dims, along, n));
        let mut out_dims = dims;
        out_dims[along] *= n;
        Ok(Dense {
            shape: Shape::from(out_dims),
            data,
        })
    }

    pub fn repeat_into(&self, out: &mut Dense, along: usize, n: usize) -> Result<()> {
        let dims = self.repeat_dims(along);
        let mut out_dims = dims.clone();
        out_dims[along] *= n;
        let expected = Shape::from(out_dims);
        if out.shape != expected || out.dtype() != self.dtype() {
            return Err(Error::ReuseMismatch {
                buffer: out.shape.clone(),
                result: expected,
            });
        }
        same_dtype_unit!((&mut out.data, &self.data), |o, d| {
            let mut at = 0usize;
            repeat_kernel_into(d, &dims, along, n, |blk| {
                o[at..at + blk.len()].copy_from_slice(blk);
                at += blk.len();
            })
        })
    }

    fn check_slice(&self, along: usize, start: usize, end: usize, step: usize) -> Result<usize> {
        let e = self.shape.dim(along)?;
        if start >= end || end > e || step == 0 {
            return Err(Error::SliceOutOfBounds {
                along,
                start,
                end,
                step,
                shape: self.shape.clone(),
            });
        }
        Ok((start..end).step_by(step).count())
    }

    /// Slice along one axis. An axis reduced to a single index is dropped;
    /// a rank-0 result becomes a scalar value.
    pub fn slice_axis(&self, along: usize, start: usize, end: usize, step: usize) -> Result<Value> {
        let span = self.check_slice(along, start, end, step)?;
        let data = map_buffer!(&self.data, |d| slice_kernel(
            d,
            self.dims(),
            along,
            start,
            end,
            step
        ));
        let mut dims = self.dims().to_vec();
        if span == 1 {
            dims.remove(along);
        } else {
            dims[along] = span;
        }
        let out = Dense {
            shape: Shape::from(dims),
            data,
        };
        if out.rank() == 0 {
            Ok(out.into_scalar())
        } else {
            Ok(Value::Dense(out))
        }
    }

    /// Scatter-add `incr` into the region selected by the slice bounds.
    pub fn slice_add(
        &mut self,
        along: usize,
        start: usize,
        end: usize,
        step: usize,
        incr: &Value,
    ) -> Result<()> {
        let span = self.check_slice(along, start, end, step)?;
        let dims = self.dims().to_vec();
        match incr {
            Value::Dense(incr) => {
                let outer: usize = dims[..along].iter().product();
                let inner: usize = dims[along + 1..].iter().product();
                if incr.len() != outer * span * inner {
                    return Err(Error::ShapeMismatch {
                        expected: self.shape.clone(),
                        got: incr.shape.clone(),
                    });
                }
                same_dtype_unit!((&mut self.data, &incr.data), |a, b| slice_add_kernel(
                    a, &dims, along, start, end, step, b
                ))
            }
            scalar => {
                let s = scalar.to_f64()?;
                match &mut self.data {
                    Buffer::F32(d) => {
                        slice_add_scalar_kernel(d, &dims, along, start, end, step, s as f32)
                    }
                    Buffer::F64(d) => slice_add_scalar_kernel(d, &dims, along, start, end, step, s),
                    Buffer::I64(d) => slice_add_scalar_kernel(
                        d,
                        &dims,
                        along,
                        start,
                        end,
                        step,
                        i64::from_f64(s)?,
                    ),
                }
                Ok(())
            }
        }
    }

    pub fn transposed(&self, perm: &[usize]) -> Result<Dense> {
        let out_shape = self.shape.permuted(perm)?;
        let data = map_buffer!(&self.data, |d| transpose_kernel(d, self.dims(), perm));
        Ok(Dense {
            shape: out_shape,
            data,
        })
    }

    pub fn concat(axis: usize, parts: &[&Dense]) -> Result<Dense> {
        let Some((first, rest)) = parts.split_first() else {
            bail!("concat of zero values");
        };
        let rest_shapes: Vec<&Shape> = rest.iter().map(|p| &p.shape).collect();
        let out_shape = first.shape.concat(axis, &rest_shapes)?;
        let outer: usize = first.dims()[..axis].iter().product();
        let inner: usize = first.dims()[axis + 1..].iter().product();
        macro_rules! concat_arm {
            ($variant:ident) => {{
                let typed: Vec<_> = parts
                    .iter()
                    .map(|p| match &p.data {
                        Buffer::$variant(d) => Ok((d.as_slice(), p.dims()[axis])),
                        other => Err(Error::DTypeMismatch {
                            expected: first.dtype(),
                            got: other.dtype(),
                        }),
                    })
                    .collect::<Result<_>>()?;
                Buffer::$variant(concat_kernel(&typed, outer, inner))
            }};
        }
        let data = match &first.data {
            Buffer::F32(_) => concat_arm!(F32),
            Buffer::F64(_) => concat_arm!(F64),
            Buffer::I64(_) => concat_arm!(I64),
        };
        Ok(Dense {
            shape: out_shape,
            data,
        })
    }

    /// Sum over `axes`, dropping them. Reduces to a scalar value when no
    /// axes remain.
    pub fn sum_axes(&self, axes: &[usize]) -> Result<Value> {
        let out_shape = self.shape.reduced(axes)?;
        let mut desc = axes.to_vec();
        desc.sort_unstable();
        desc.reverse();
        let data = map_buffer!(&self.data, |d| sum_axes_kernel(d, self.dims(), &desc));
        let out = Dense {
            shape: out_shape,
            data,
        };
        if out.rank() == 0 {
            Ok(out.into_scalar())
        } else {
            Ok(Value::Dense(out))
        }
    }

    pub fn binary(&self, other: &Dense, k: BinaryKind) -> Result<Dense> {
        if self.shape != other.shape {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(Dense {
            shape: self.shape.clone(),
            data: self.data.zip(&other.data, k)?,
        })
    }
}

/// A runtime value: a scalar or a dense tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    F32(f32),
    F64(f64),
    I64(i64),
    Dense(Dense),
}

impl Value {
    pub fn zero(dtype: DType) -> Value {
        match dtype {
            DType::F32 => Value::F32(0.0),
            DType::F64 => Value::F64(0.0),
            DType::I64 => Value::I64(0),
        }
    }

    pub fn one(dtype: DType) -> Value {
        match dtype {
            DType::F32 => Value::F32(1.0),
            DType::F64 => Value::F64(1.0),
            DType::I64 => Value::I64(1),
        }
    }

    /// A zeroed value of the given shape and dtype; a scalar shape yields a
    /// scalar value.
    pub fn zeros(shape: &Shape, dtype: DType) -> Value {
        if shape.is_scalar() {
            Value::zero(dtype)
        } else {
            Value::Dense(Dense::zeros(shape, dtype))
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Value::F32(_) => DType::F32,
            Value::F64(_) => DType::F64,
            Value::I64(_) => DType::I64,
            Value::Dense(d) => d.dtype(),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Dense(d) => d.shape().clone(),
            _ => Shape::scalar(),
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Dense(_))
    }

    pub fn as_dense(&self) -> Option<&Dense> {
        match self {
            Value::Dense(d) => Some(d),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Result<f64> {
        match self {
            Value::F32(v) => Ok(*v as f64),
            Value::F64(v) => Ok(*v),
            Value::I64(v) => Ok(*v as f64),
            Value::Dense(d) if d.len() == 1 => d.get(0).to_f64(),
            Value::Dense(d) => Err(Error::msg(format!(
                "expected a scalar, got a dense value of shape {}",
                d.shape()
            ))),
        }
    }

    pub fn to_usize(&self) -> Result<usize> {
        let v = self.to_f64()?;
        if v < 0.0 {
            bail!("expected a non-negative count, got {v}");
        }
        Ok(v as usize)
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Value::Dense(d) => d.to_f64_vec(),
            scalar => vec![scalar.to_f64().unwrap_or(f64::NAN)],
        }
    }

    pub fn zeros_like(&self) -> Value {
        Value::zeros(&self.shape(), self.dtype())
    }

    fn scalar_binary(k: BinaryKind, a: &Value, b: &Value) -> Result<Value> {
        match (a, b) {
            (Value::F32(x), Value::F32(y)) => Ok(Value::F32(apply_kind(k, *x, *y))),
            (Value::F64(x), Value::F64(y)) => Ok(Value::F64(apply_kind(k, *x, *y))),
            (Value::I64(x), Value::I64(y)) => {
                if k == BinaryKind::Div && *y == 0 {
                    return Err(Error::msg("integer division by zero"));
                }
                Ok(Value::I64(apply_kind(k, *x, *y)))
            }
            _ => Err(Error::DTypeMismatch {
                expected: a.dtype(),
                got: b.dtype(),
            }),
        }
    }

    /// Elementwise binary arithmetic. Operands must have equal shapes, or one
    /// of them must be a scalar.
    pub fn binary(k: BinaryKind, a: &Value, b: &Value) -> Result<Value> {
        match (a, b) {
            (Value::Dense(x), Value::Dense(y)) => Ok(Value::Dense(x.binary(y, k)?)),
            (Value::Dense(x), scalar) => {
                let s = scalar.to_f64()?;
                Ok(Value::Dense(Dense {
                    shape: x.shape.clone(),
                    data: x.data.map_scalar(s, k, false)?,
                }))
            }
            (scalar, Value::Dense(y)) => {
                let s = scalar.to_f64()?;
                Ok(Value::Dense(Dense {
                    shape: y.shape.clone(),
                    data: y.data.map_scalar(s, k, true)?,
                }))
            }
            (a, b) => Self::scalar_binary(k, a, b),
        }
    }

    /// Like [`Value::binary`], writing into an existing buffer of the right
    /// shape and dtype.
    pub fn binary_into(k: BinaryKind, a: &Value, b: &Value, out: &mut Value) -> Result<()> {
        match (a, b, out) {
            (Value::Dense(x), Value::Dense(y), Value::Dense(o)) => {
                if x.shape != y.shape {
                    return Err(Error::ShapeMismatch {
                        expected: x.shape.clone(),
                        got: y.shape.clone(),
                    });
                }
                if o.shape != x.shape {
                    return Err(Error::ReuseMismatch {
                        buffer: o.shape.clone(),
                        result: x.shape.clone(),
                    });
                }
                x.data.zip_into(&y.data, &mut o.data, k)
            }
            (a, b, out) => {
                let r = Self::binary(k, a, b)?;
                if r.shape() != out.shape() || r.dtype() != out.dtype() {
                    return Err(Error::ReuseMismatch {
                        buffer: out.shape(),
                        result: r.shape(),
                    });
                }
                *out = r;
                Ok(())
            }
        }
    }

    /// In-place `a = a k b`, with `a` as the left operand.
    pub fn binary_assign(k: BinaryKind, a: &mut Value, b: &Value) -> Result<()> {
        match (a, b) {
            (Value::Dense(x), Value::Dense(y)) => {
                if x.shape != y.shape {
                    return Err(Error::ShapeMismatch {
                        expected: x.shape.clone(),
                        got: y.shape.clone(),
                    });
                }
                x.data.zip_assign(&y.data, k)
            }
            (Value::Dense(x), scalar) => {
                let s = scalar.to_f64()?;
                x.data = x.data.map_scalar(s, k, false)?;
                Ok(())
            }
            (a, b) => {
                *a = Self::scalar_binary(k, a, b)?;
                Ok(())
            }
        }
    }

    pub fn neg(&self) -> Result<Value> {
        match self {
            Value::F32(v) => Ok(Value::F32(-v)),
            Value::F64(v) => Ok(Value::F64(-v)),
            Value::I64(v) => Ok(Value::I64(-v)),
            Value::Dense(d) => Ok(Value::Dense(Dense {
                shape: d.shape.clone(),
                data: d.data.neg(),
            })),
        }
    }

    pub fn neg_assign(&mut self) {
        match self {
            Value::F32(v) => *v = -*v,
            Value::F64(v) => *v = -*v,
            Value::I64(v) => *v = -*v,
            Value::Dense(d) => d.data.neg_assign(),
        }
    }

    /// Gradient accumulation: `self += other` with strictly matching shapes.
    pub fn add_assign(&mut self, other: &Value) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape(),
                got: other.shape(),
            });
        }
        Value::binary_assign(BinaryKind::Add, self, other)
    }

    /// `self += factor * other`, float dtypes only.
    pub fn scaled_add_assign(&mut self, other: &Value, factor: f64) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape(),
                got: other.shape(),
            });
        }
        match (self, other) {
            (Value::Dense(a), Value::Dense(b)) => a.data.scaled_add_assign(&b.data, factor),
            (Value::F32(a), b) => {
                *a += (b.to_f64()? * factor) as f32;
                Ok(())
            }
            (Value::F64(a), b) => {
                *a += b.to_f64()? * factor;
                Ok(())
            }
            (a, _) => Err(Error::msg(format!(
                "scaled accumulation requires a float dtype, got {}",
                a.dtype()
            ))),
        }
    }
}

impl From<Dense> for Value {
    fn from(d: Dense) -> Self {
        Value::Dense(d)
    }
}
