//! The broadcast algebra: a compact pattern describing which operand's axes
//! get repeated, and the graph-level apply that inserts the reshape and
//! repeat nodes realizing it.

use crate::graph::{ExprGraph, NodeId};
use crate::{bail, Error, Result, Shape};

/// Broadcasting supports at most this many axes per operand.
pub const MAX_BROADCAST_AXES: usize = 4;

/// Which axes of each operand are repeated: left operand axis `i` maps to
/// bit `4 + i`, right operand axis `i` to bit `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastPattern(u8);

impl BroadcastPattern {
    pub fn new(left: &[usize], right: &[usize]) -> Result<Self> {
        let mut bits = 0u8;
        for &ax in left {
            if ax >= MAX_BROADCAST_AXES {
                bail!("broadcast axis {ax} exceeds the supported {MAX_BROADCAST_AXES} axes");
            }
            bits |= 1 << (ax + MAX_BROADCAST_AXES);
        }
        for &ax in right {
            if ax >= MAX_BROADCAST_AXES {
                bail!("broadcast axis {ax} exceeds the supported {MAX_BROADCAST_AXES} axes");
            }
            bits |= 1 << ax;
        }
        Ok(Self(bits))
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Decode into (left axes, right axes), each ascending.
    pub fn on(&self) -> (Vec<usize>, Vec<usize>) {
        let mut left = Vec::new();
        let mut right = Vec::new();
        for ax in 0..MAX_BROADCAST_AXES {
            if self.0 & (1 << (ax + MAX_BROADCAST_AXES)) != 0 {
                left.push(ax);
            }
            if self.0 & (1 << ax) != 0 {
                right.push(ax);
            }
        }
        (left, right)
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 != 0
    }
}

/// Infer the pattern for two equal-rank shapes: along each axis with unequal
/// extents, the smaller side is marked for repetition.
pub fn auto_broadcast_pattern(a: &Shape, b: &Shape) -> Result<BroadcastPattern> {
    if a.rank() != b.rank() {
        return Err(Error::RankMismatch {
            expected: a.rank(),
            got: b.rank(),
        });
    }
    let mut left = Vec::new();
    let mut right = Vec::new();
    for (ax, (&ea, &eb)) in a.dims().iter().zip(b.dims()).enumerate() {
        if ea == eb {
            continue;
        }
        if ea < eb {
            left.push(ax);
        } else {
            right.push(ax);
        }
    }
    BroadcastPattern::new(&left, &right)
}

/// The shape a marked operand is reshaped to before its repeats: marked axes
/// become extent 1; the remaining axes take the operand's extents in order.
fn broadcast_reshape(shape: &Shape, target_rank: usize, axes: &[usize]) -> Result<Shape> {
    if shape.rank() == target_rank {
        let mut dims = shape.dims().to_vec();
        for &ax in axes {
            if dims[ax] != 1 {
                bail!(
                    "cannot broadcast axis {ax} of {shape}: extent {} is not 1",
                    dims[ax]
                );
            }
        }
        return Ok(shape.clone());
    }
    let mut dims = Vec::with_capacity(target_rank);
    let mut rest = shape.dims().iter();
    for ax in 0..target_rank {
        if axes.contains(&ax) {
            dims.push(1);
        } else {
            match rest.next() {
                Some(&d) => dims.push(d),
                None => bail!("cannot broadcast {shape} to rank {target_rank} on axes {axes:?}"),
            }
        }
    }
    if rest.next().is_some() {
        bail!("cannot broadcast {shape} to rank {target_rank} on axes {axes:?}");
    }
    Ok(Shape::from(dims))
}

fn apply_side(
    g: &mut ExprGraph,
    node: NodeId,
    other: NodeId,
    axes: &[usize],
    side: &str,
) -> Result<NodeId> {
    let other_shape = g.shape_of(other).clone();
    for &ax in axes {
        if ax >= other_shape.rank() {
            bail!(
                "broadcast axis {ax} of the {side} operand does not exist in the other \
                 operand's shape {other_shape}"
            );
        }
    }
    let reshaped_to = broadcast_reshape(g.shape_of(node), other_shape.rank(), axes)?;
    let mut out = g.reshape(node, reshaped_to)?;
    for &ax in axes {
        let count = g.size_of(ax, other)?;
        out = g.repeat_by(out, ax, count)?;
    }
    Ok(out)
}

/// Materialize a broadcast pattern in the graph. Each marked axis of an
/// operand is repeated up to the other operand's extent, driven by a size
/// node of the other operand. Returns the (possibly replaced) operand nodes.
pub fn broadcast(
    g: &mut ExprGraph,
    a: NodeId,
    b: NodeId,
    pattern: BroadcastPattern,
) -> Result<(NodeId, NodeId)> {
    let (lefts, rights) = pattern.on();
    let mut x = a;
    let mut y = b;
    if !lefts.is_empty() {
        x = apply_side(g, a, b, &lefts, "left")?;
    }
    if !rights.is_empty() {
        y = apply_side(g, b, a, &rights, "right")?;
    }
    Ok((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    #[test]
    fn pattern_bit_layout() {
        let p = BroadcastPattern::new(&[1], &[0, 2]).unwrap();
        assert_eq!(p.bits(), 0b0010_0101);
        assert_eq!(p.on(), (vec![1], vec![0, 2]));
        assert!(p.is_broadcast());
        assert!(!BroadcastPattern::default().is_broadcast());
        assert!(BroadcastPattern::new(&[4], &[]).is_err());
    }

    #[test]
    fn auto_pattern_marks_smaller_side() {
        let a = Shape::from((2, 1));
        let b = Shape::from((2, 3));
        let p = auto_broadcast_pattern(&a, &b).unwrap();
        assert_eq!(p.on(), (vec![1], Vec::new()));
        let p = auto_broadcast_pattern(&b, &a).unwrap();
        assert_eq!(p.on(), (Vec::new(), vec![1]));
        assert!(auto_broadcast_pattern(&a, &Shape::from(2usize)).is_err());
        // equal shapes mark nothing
        assert!(!auto_broadcast_pattern(&b, &b).unwrap().is_broadcast());
    }

    #[test]
    fn broadcast_equalizes_extents() {
        let mut g = ExprGraph::new();
        let a = g.matrix("a", DType::F64, 2, 3);
        let b = g.matrix("b", DType::F64, 2, 1);
        let p = auto_broadcast_pattern(g.shape_of(a), g.shape_of(b)).unwrap();
        let (x, y) = broadcast(&mut g, a, b, p).unwrap();
        assert_eq!(x, a);
        assert_eq!(g.shape_of(y), &Shape::from((2, 3)));
        assert_eq!(g.shape_of(x).dims(), g.shape_of(y).dims());
    }

    #[test]
    fn broadcast_rejects_missing_axis() {
        let mut g = ExprGraph::new();
        let a = g.vector("a", DType::F64, 3);
        let b = g.vector("b", DType::F64, 3);
        let p = BroadcastPattern::new(&[2], &[]).unwrap();
        assert!(broadcast(&mut g, a, b, p).is_err());
    }

    #[test]
    fn broadcast_rejects_non_unit_extent() {
        let mut g = ExprGraph::new();
        let a = g.matrix("a", DType::F64, 2, 2);
        let b = g.matrix("b", DType::F64, 2, 3);
        let p = BroadcastPattern::new(&[1], &[]).unwrap();
        assert!(broadcast(&mut g, a, b, p).is_err());
    }
}
