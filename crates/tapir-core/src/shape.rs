use crate::{bail, Error, Result};

/// Row-major shape of a value. Rank 0 is a scalar.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_vector(&self) -> bool {
        self.0.len() == 1
    }

    /// Total number of elements; 1 for a scalar.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or_else(|| Error::DimOutOfRange {
            dim: d,
            shape: self.clone(),
        })
    }

    /// Row-major strides, innermost axis last.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.rank()];
        for d in (0..self.rank().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * self.0[d + 1];
        }
        strides
    }

    /// Shape after permuting axes so that output axis `i` is input axis `perm[i]`.
    pub fn permuted(&self, perm: &[usize]) -> Result<Shape> {
        if perm.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: perm.len(),
            });
        }
        let mut seen = vec![false; self.rank()];
        for &p in perm {
            if p >= self.rank() || seen[p] {
                bail!("{:?} is not a permutation of the axes of {}", perm, self);
            }
            seen[p] = true;
        }
        Ok(Shape(perm.iter().map(|&p| self.0[p]).collect()))
    }

    /// Shape after concatenating `others` onto `self` along `axis`.
    pub fn concat(&self, axis: usize, others: &[&Shape]) -> Result<Shape> {
        if axis >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim: axis,
                shape: self.clone(),
            });
        }
        let mut dims = self.0.clone();
        for other in others {
            if other.rank() != self.rank() {
                return Err(Error::RankMismatch {
                    expected: self.rank(),
                    got: other.rank(),
                });
            }
            for d in 0..self.rank() {
                if d != axis && other.0[d] != self.0[d] {
                    return Err(Error::ShapeMismatch {
                        expected: self.clone(),
                        got: (*other).clone(),
                    });
                }
            }
            dims[axis] += other.0[axis];
        }
        Ok(Shape(dims))
    }

    /// Shape after inserting an axis of extent 1 at `axis`.
    pub fn inserted(&self, axis: usize) -> Result<Shape> {
        if axis > self.rank() {
            return Err(Error::DimOutOfRange {
                dim: axis,
                shape: self.clone(),
            });
        }
        let mut dims = self.0.clone();
        dims.insert(axis, 1);
        Ok(Shape(dims))
    }

    /// Shape after dropping the axes in `axes` (must be distinct and in range).
    pub fn reduced(&self, axes: &[usize]) -> Result<Shape> {
        let mut keep = vec![true; self.rank()];
        for &ax in axes {
            if ax >= self.rank() {
                return Err(Error::DimOutOfRange {
                    dim: ax,
                    shape: self.clone(),
                });
            }
            if !keep[ax] {
                bail!("duplicate axis {ax} in reduction over {}", self);
            }
            keep[ax] = false;
        }
        Ok(Shape(
            self.0
                .iter()
                .zip(keep)
                .filter_map(|(&d, k)| k.then_some(d))
                .collect(),
        ))
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Self::scalar()
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Self(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Self(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Self(vec![d0, d1, d2])
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basics() {
        let s = Shape::from((2, 3));
        assert_eq!(s.rank(), 2);
        assert_eq!(s.elem_count(), 6);
        assert_eq!(s.strides(), vec![3, 1]);
        assert!(Shape::scalar().is_scalar());
        assert_eq!(Shape::scalar().elem_count(), 1);
    }

    #[test]
    fn dim_out_of_range() {
        let s = Shape::from(4usize);
        assert_eq!(s.dim(0).unwrap(), 4);
        assert!(s.dim(1).is_err());
    }

    #[test]
    fn permuted() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.permuted(&[2, 0, 1]).unwrap(), Shape::from((4, 2, 3)));
        assert!(s.permuted(&[0, 0, 1]).is_err());
        assert!(s.permuted(&[0, 1]).is_err());
    }

    #[test]
    fn concat() {
        let a = Shape::from((2, 3));
        let b = Shape::from((4, 3));
        assert_eq!(a.concat(0, &[&b]).unwrap(), Shape::from((6, 3)));
        assert!(a.concat(1, &[&b]).is_err());
        assert!(a.concat(2, &[&b]).is_err());
    }

    #[test]
    fn inserted_and_reduced() {
        let s = Shape::from((2, 3));
        assert_eq!(s.inserted(1).unwrap(), Shape::from((2, 1, 3)));
        assert_eq!(s.reduced(&[0]).unwrap(), Shape::from(3usize));
        assert_eq!(s.reduced(&[0, 1]).unwrap(), Shape::scalar());
        assert!(s.reduced(&[0, 0]).is_err());
    }
}
